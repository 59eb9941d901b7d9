use crate::error::{Error, Result};
use crate::inet::{Address, Family};
use crate::signal::{Priority, Signal};
use crate::socket::{PollMode, SockKind, SocketCore};
use socket2::Socket;
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;

/// A connected TCP stream endpoint.
///
/// I/O signals carry an owned, cheaply-cloned `Arc<[u8]>` snapshot of the
/// bytes involved rather than a raw pointer and length — `Signal<A>`
/// requires a `'static` argument, so there is no sound way to hand a slot a
/// borrowed pointer into a buffer this call is about to reuse.
pub struct TcpClient {
    core: SocketCore,

    pub on_connected: Signal<Address>,
    pub on_disconnected: Signal<()>,
    pub on_connection_error: Signal<String>,
    pub on_data_received: Signal<Arc<[u8]>>,
    pub on_data_sent: Signal<usize>,
    pub on_send_error: Signal<String>,
    pub on_receive_error: Signal<String>,
    pub on_shutdown_initiated: Signal<()>,
}

impl TcpClient {
    pub fn new() -> Self {
        TcpClient {
            core: SocketCore::new(),
            on_connected: Signal::new(),
            on_disconnected: Signal::new(),
            on_connection_error: Signal::new(),
            on_data_received: Signal::new(),
            on_data_sent: Signal::new(),
            on_send_error: Signal::new(),
            on_receive_error: Signal::new(),
            on_shutdown_initiated: Signal::new(),
        }
    }

    /// Wraps an already-connected socket (used by `ServerSocket::accept`).
    pub(crate) fn from_accepted(socket: Socket, family: Family) -> Self {
        let client = TcpClient::new();
        client.core.replace(socket, family, SockKind::Stream, true);
        client
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn connect(&self, addr: &Address) -> Result<()> {
        if self.core.is_closed() {
            self.core.init(addr.family(), SockKind::Stream)?;
        }
        match self.core.connect(addr) {
            Ok(()) => {
                self.on_connected.emit(*addr);
                Ok(())
            }
            Err(e) => {
                if !matches!(e, Error::InProgress) {
                    self.on_connection_error.emit(e.to_string());
                }
                Err(e)
            }
        }
    }

    pub fn connect_with_timeout(&self, addr: &Address, timeout: Duration) -> Result<()> {
        if self.core.is_closed() {
            self.core.init(addr.family(), SockKind::Stream)?;
        }
        match self.core.connect_with_timeout(addr, timeout) {
            Ok(()) => {
                self.on_connected.emit(*addr);
                Ok(())
            }
            Err(e) => {
                self.on_connection_error.emit(e.to_string());
                Err(e)
            }
        }
    }

    /// Starts a non-blocking connect. Returns `Ok(true)` if the connection
    /// completed immediately, `Ok(false)` if it is in progress (poll for
    /// write-readiness, then check `is_connected`), or an error.
    ///
    /// `Error::InProgress` is swallowed into `Ok(false)` here: it is the
    /// expected outcome of a non-blocking connect, not a failure, so
    /// `on_connection_error` must not fire for it.
    pub fn connect_non_blocking(&self, addr: &Address) -> Result<bool> {
        if self.core.is_closed() {
            self.core.init(addr.family(), SockKind::Stream)?;
        }
        self.core.set_blocking(false)?;
        match self.core.connect(addr) {
            Ok(()) => {
                self.on_connected.emit(*addr);
                Ok(true)
            }
            Err(Error::InProgress) | Err(Error::WouldBlock) => Ok(false),
            Err(e) => {
                self.on_connection_error.emit(e.to_string());
                Err(e)
            }
        }
    }

    /// One `send` call. Returning `0` with no error means "nothing sent
    /// this call" — never treat it as EOF on the send side.
    pub fn send_bytes(&self, buf: &[u8]) -> Result<usize> {
        match self.core.send(buf) {
            Ok(n) => {
                if n > 0 && !self.on_data_sent.is_empty() {
                    self.on_data_sent.emit(n);
                }
                Ok(n)
            }
            Err(e) => {
                if !e.is_retryable() {
                    self.on_send_error.emit(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Loops `send_bytes` until the whole buffer is sent or a fatal/EOF
    /// condition stops it early; returns the partial count in that case.
    /// Never returns more than `buf.len()`.
    pub fn send_bytes_all(&self, buf: &[u8]) -> Result<usize> {
        let mut sent = 0;
        while sent < buf.len() {
            match self.send_bytes(&buf[sent..]) {
                Ok(0) => break,
                Ok(n) => sent += n,
                Err(e) if e.is_retryable() => continue,
                Err(e) => {
                    if sent > 0 {
                        return Ok(sent);
                    }
                    return Err(e);
                }
            }
        }
        Ok(sent)
    }

    /// One `recv` call. `0` means the peer closed the read side; the client
    /// transitions to not-connected and emits `on_disconnected`.
    pub fn recv_bytes(&self, buf: &mut [u8]) -> Result<usize> {
        match self.core.recv(buf) {
            Ok(0) => {
                self.core.set_connected(false);
                self.on_disconnected.emit(());
                Ok(0)
            }
            Ok(n) => {
                if !self.on_data_received.is_empty() {
                    self.on_data_received.emit(Arc::from(&buf[..n]));
                }
                Ok(n)
            }
            Err(e) => {
                if !e.is_retryable() {
                    self.on_receive_error.emit(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Loops `recv_bytes` until `buf` is full or the peer closes; returns
    /// the partial count read so far on early stop.
    pub fn recv_bytes_exact(&self, buf: &mut [u8]) -> Result<usize> {
        let mut received = 0;
        while received < buf.len() {
            match self.recv_bytes(&mut buf[received..]) {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(e) if e.is_retryable() => continue,
                Err(e) => {
                    if received > 0 {
                        return Ok(received);
                    }
                    return Err(e);
                }
            }
        }
        Ok(received)
    }

    pub fn send_string(&self, s: &str) -> Result<usize> {
        self.send_bytes(s.as_bytes())
    }

    pub fn send_string_all(&self, s: &str) -> Result<usize> {
        self.send_bytes_all(s.as_bytes())
    }

    /// Sends one byte out-of-band via `MSG_OOB`, bypassing any buffering
    /// facade in front of this client.
    #[cfg(unix)]
    pub fn send_urgent(&self, byte: u8) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let fd = self.core.as_raw_fd()?;
        let rc = unsafe {
            libc::send(
                fd,
                &byte as *const u8 as *const libc::c_void,
                1,
                libc::MSG_OOB,
            )
        };
        if rc < 0 {
            return Err(Error::io("send(MSG_OOB) failed", std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.on_shutdown_initiated.emit(());
        self.core.shutdown(how)
    }

    pub fn no_delay(&self, flag: bool) -> Result<()> {
        self.core.no_delay(flag)
    }

    pub fn keep_alive(&self, flag: bool) -> Result<()> {
        self.core.keep_alive(flag)
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.core.send_timeout(timeout)
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.core.recv_timeout(timeout)
    }

    pub fn poll_readable(&self, timeout: Duration) -> Result<bool> {
        self.core.poll(timeout, PollMode::READ)
    }

    pub fn poll_writable(&self, timeout: Duration) -> Result<bool> {
        self.core.poll(timeout, PollMode::WRITE)
    }

    pub fn local_address(&self) -> Result<Address> {
        self.core.local_address()
    }

    pub fn peer_address(&self) -> Result<Address> {
        self.core.peer_address()
    }

    pub fn close(&self) {
        self.core.close();
    }

    pub(crate) fn core(&self) -> &SocketCore {
        &self.core
    }
}

impl Default for TcpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl std::os::unix::io::AsRawFd for TcpClient {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.core.as_raw_fd().expect("socket is closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::ServerSocket;
    use std::thread;

    #[test]
    fn echo_round_trip() {
        let server = ServerSocket::new();
        let bind_addr = Address::parse("127.0.0.1:0").unwrap();
        server.bind(&bind_addr).unwrap();
        server.listen(16).unwrap();
        let local = server.local_address().unwrap();

        let handle = thread::spawn(move || {
            let (client, _addr) = server.accept().unwrap();
            let mut buf = [0u8; 5];
            let n = client.recv_bytes_exact(&mut buf).unwrap();
            client.send_bytes_all(&buf[..n]).unwrap();
        });

        let client = TcpClient::new();
        client.connect(&local).unwrap();
        client.send_bytes_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        client.recv_bytes_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        handle.join().unwrap();
    }

    #[test]
    fn send_zero_with_no_error_is_not_eof() {
        // send_bytes on an empty buffer must not be mistaken for EOF.
        let server = ServerSocket::new();
        server.bind(&Address::parse("127.0.0.1:0").unwrap()).unwrap();
        server.listen(4).unwrap();
        let local = server.local_address().unwrap();

        let handle = thread::spawn(move || server.accept().unwrap());
        let client = TcpClient::new();
        client.connect(&local).unwrap();
        let (_peer, _addr) = handle.join().unwrap();

        assert_eq!(client.send_bytes(b"").unwrap(), 0);
        assert!(client.is_connected());
    }
}
