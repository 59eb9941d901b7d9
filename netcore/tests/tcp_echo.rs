mod common;

use netcore::inet::Address;
use netcore::tcp::{ServerSocket, TcpClient};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn echoes_several_messages_over_one_connection() {
    common::init_tracing();
    let server = ServerSocket::new();
    server.bind(&Address::parse("127.0.0.1:0").unwrap()).unwrap();
    server.listen(8).unwrap();
    let local = server.local_address().unwrap();

    let handle = thread::spawn(move || {
        let (client, _addr) = server.accept().unwrap();
        for _ in 0..3 {
            let mut buf = [0u8; 4];
            let n = client.recv_bytes_exact(&mut buf).unwrap();
            client.send_bytes_all(&buf[..n]).unwrap();
        }
    });

    let client = TcpClient::new();
    let received = Arc::new(AtomicUsize::new(0));
    let received2 = received.clone();
    client.on_data_received.connect(0, move |_data| {
        received2.fetch_add(1, Ordering::SeqCst);
    });

    client.connect(&local).unwrap();
    for msg in [b"ping", b"pong", b"ping"] {
        client.send_bytes_all(msg).unwrap();
        let mut buf = [0u8; 4];
        client.recv_bytes_exact(&mut buf).unwrap();
        assert_eq!(&buf, msg);
    }

    handle.join().unwrap();
    assert_eq!(received.load(Ordering::SeqCst), 3);
}

#[test]
fn connect_non_blocking_eventually_completes() {
    let server = ServerSocket::new();
    server.bind(&Address::parse("127.0.0.1:0").unwrap()).unwrap();
    server.listen(4).unwrap();
    let local = server.local_address().unwrap();
    let handle = thread::spawn(move || server.accept().unwrap());

    let client = TcpClient::new();
    let immediate = client.connect_non_blocking(&local).unwrap();
    if !immediate {
        let ready = client.poll_writable(Duration::from_secs(1)).unwrap();
        assert!(ready);
    }
    assert!(client.is_connected() || immediate);

    handle.join().unwrap();
}

#[test]
fn connect_with_timeout_on_non_routable_address_times_out() {
    // 10.255.255.1 is a private, typically non-routed address used in other
    // connect-timeout tests across the ecosystem; a short deadline should
    // reliably expire rather than resolve the connection either way.
    let client = TcpClient::new();
    let addr = Address::parse("10.255.255.1:9").unwrap();
    let result = client.connect_with_timeout(&addr, Duration::from_millis(200));
    assert!(result.is_err());
}
