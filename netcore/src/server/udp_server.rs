use super::queue::BoundedQueue;
use super::udp_handler::{process_packet, HandlerStats, UdpHandler};
use crate::inet::Address;
use crate::signal::Signal;
use crate::udp::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Builds a fresh [`UdpHandler`] for one datagram, given its payload and
/// sender address. Used by [`UdpServer::with_factory`] for handlers that
/// need per-datagram state instead of a single handler shared across every
/// packet.
pub type HandlerFactory = dyn Fn(&[u8], Address) -> Box<dyn UdpHandler> + Send + Sync;

/// Either a single handler shared by every worker, or a factory invoked once
/// per datagram to build a short-lived handler for it.
enum HandlerSource {
    Shared(Arc<dyn UdpHandler>),
    Factory(Arc<HandlerFactory>),
}

impl HandlerSource {
    fn max_packet_size(&self) -> usize {
        match self {
            HandlerSource::Shared(h) => h.max_packet_size(),
            HandlerSource::Factory(_) => crate::udp::MAX_DATAGRAM_SIZE,
        }
    }
}

/// Snapshot of a [`UdpServer`]'s counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpServerStats {
    pub received_total: u64,
    pub processed_total: u64,
    pub dropped_total: u64,
    pub exceptions_total: u64,
    pub bytes_processed_total: u64,
    pub uptime: Duration,
    pub last_packet_age: Option<Duration>,
}

struct Datagram {
    data: Vec<u8>,
    from: Address,
    received_at: Instant,
}

/// A threaded UDP server: one receiver thread feeding a bounded queue,
/// drained by a fixed pool of worker threads that each run a [`UdpHandler`]
/// once per datagram.
///
/// Unlike [`super::TcpServer`], `stop` always joins every thread — there is
/// no per-connection state a lingering worker could hold hostage, since each
/// datagram is handled independently and to completion before the next is
/// dequeued.
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    source: Arc<HandlerSource>,
    queue: Arc<BoundedQueue<Datagram>>,
    worker_count: usize,
    stopping: Arc<AtomicBool>,
    stats: Arc<HandlerStats>,
    packet_timeout: Arc<Mutex<Duration>>,
    active_workers: Arc<AtomicUsize>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,

    pub on_server_started: Arc<Signal<()>>,
    pub on_server_stopping: Arc<Signal<()>>,
    pub on_server_stopped: Arc<Signal<()>>,
    pub on_packet_received: Arc<Signal<Address>>,
    pub on_total_packets_changed: Arc<Signal<u64>>,
    pub on_processed_packets_changed: Arc<Signal<u64>>,
    pub on_dropped_packets_changed: Arc<Signal<u64>>,
    pub on_queued_packets_changed: Arc<Signal<u64>>,
    pub on_worker_thread_created: Arc<Signal<usize>>,
    pub on_worker_thread_destroyed: Arc<Signal<usize>>,
    pub on_exception: Arc<Signal<(String, String)>>,
}

impl UdpServer {
    /// `socket` must already be bound. Every worker thread shares `handler`.
    pub fn new(socket: UdpSocket, handler: Arc<dyn UdpHandler>, worker_count: usize, max_queue: usize) -> Self {
        Self::from_source(socket, HandlerSource::Shared(handler), worker_count, max_queue)
    }

    /// Like [`UdpServer::new`], but `factory` is invoked once per datagram to
    /// build the handler that processes it, instead of sharing one handler
    /// across every worker. Useful when handling state must not outlive a
    /// single packet.
    pub fn with_factory(
        socket: UdpSocket,
        factory: impl Fn(&[u8], Address) -> Box<dyn UdpHandler> + Send + Sync + 'static,
        worker_count: usize,
        max_queue: usize,
    ) -> Self {
        Self::from_source(socket, HandlerSource::Factory(Arc::new(factory)), worker_count, max_queue)
    }

    fn from_source(socket: UdpSocket, source: HandlerSource, worker_count: usize, max_queue: usize) -> Self {
        UdpServer {
            socket: Arc::new(socket),
            source: Arc::new(source),
            queue: Arc::new(BoundedQueue::new(max_queue)),
            worker_count: worker_count.max(1),
            stopping: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(HandlerStats::new()),
            packet_timeout: Arc::new(Mutex::new(Duration::ZERO)),
            active_workers: Arc::new(AtomicUsize::new(0)),
            receiver: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            on_server_started: Arc::new(Signal::new()),
            on_server_stopping: Arc::new(Signal::new()),
            on_server_stopped: Arc::new(Signal::new()),
            on_packet_received: Arc::new(Signal::new()),
            on_total_packets_changed: Arc::new(Signal::new()),
            on_processed_packets_changed: Arc::new(Signal::new()),
            on_dropped_packets_changed: Arc::new(Signal::new()),
            on_queued_packets_changed: Arc::new(Signal::new()),
            on_worker_thread_created: Arc::new(Signal::new()),
            on_worker_thread_destroyed: Arc::new(Signal::new()),
            on_exception: Arc::new(Signal::new()),
        }
    }

    /// Datagrams older than `timeout` when a worker dequeues them are
    /// dropped, uncounted towards `processed_total`, instead of being handed
    /// to the handler. `Duration::ZERO` (the default) disables the check.
    pub fn set_packet_timeout(&self, timeout: Duration) {
        *self.packet_timeout.lock().unwrap() = timeout;
    }

    pub fn start(&self) {
        self.stopping.store(false, Ordering::Release);

        let socket = self.socket.clone();
        let queue = self.queue.clone();
        let stopping = self.stopping.clone();
        let stats = self.stats.clone();
        let max_packet = self.source.max_packet_size();
        let on_received = self.on_packet_received.clone();
        let on_total_changed = self.on_total_packets_changed.clone();
        let on_dropped_changed = self.on_dropped_packets_changed.clone();
        let on_queued_changed = self.on_queued_packets_changed.clone();
        *self.receiver.lock().unwrap() = Some(thread::spawn(move || {
            receiver_loop(
                socket,
                queue,
                stopping,
                stats,
                max_packet,
                on_received,
                on_total_changed,
                on_dropped_changed,
                on_queued_changed,
            );
        }));

        let mut workers = self.workers.lock().unwrap();
        for worker_id in 0..self.worker_count {
            let queue = self.queue.clone();
            let stopping = self.stopping.clone();
            let source = self.source.clone();
            let stats = self.stats.clone();
            let packet_timeout = self.packet_timeout.clone();
            let active_workers = self.active_workers.clone();
            let on_processed_changed = self.on_processed_packets_changed.clone();
            let on_dropped_changed = self.on_dropped_packets_changed.clone();
            let on_exception = self.on_exception.clone();
            let on_created = self.on_worker_thread_created.clone();
            let on_destroyed = self.on_worker_thread_destroyed.clone();
            workers.push(thread::spawn(move || {
                let active_now = active_workers.fetch_add(1, Ordering::Relaxed) + 1;
                on_created.emit(active_now);
                worker_loop(
                    queue,
                    stopping,
                    source,
                    stats,
                    packet_timeout,
                    on_processed_changed,
                    on_dropped_changed,
                    on_exception,
                );
                let active_now = active_workers.fetch_sub(1, Ordering::Relaxed) - 1;
                on_destroyed.emit(active_now);
                let _ = worker_id;
            }));
        }

        self.on_server_started.emit(());
    }

    /// Stops the receiver and every worker, joining all of them
    /// unconditionally (see the type-level doc comment for why this never
    /// detaches).
    pub fn stop(&self) {
        self.on_server_stopping.emit(());
        self.stopping.store(true, Ordering::Release);
        self.socket.close();
        self.queue.wake_all();

        if let Some(handle) = self.receiver.lock().unwrap().take() {
            let _ = handle.join();
        }
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            let _ = handle.join();
        }
        self.on_server_stopped.emit(());
    }

    pub fn local_address(&self) -> crate::error::Result<Address> {
        self.socket.local_address()
    }

    pub fn stats(&self) -> UdpServerStats {
        UdpServerStats {
            received_total: self.stats.received_total.load(Ordering::Relaxed),
            processed_total: self.stats.processed_total.load(Ordering::Relaxed),
            dropped_total: self.stats.dropped_total.load(Ordering::Relaxed),
            exceptions_total: self.stats.exceptions_total.load(Ordering::Relaxed),
            bytes_processed_total: self.stats.bytes_processed.load(Ordering::Relaxed),
            uptime: self.stats.creation_time.elapsed(),
            last_packet_age: self.stats.last_packet_time.lock().unwrap().map(|t| t.elapsed()),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn receiver_loop(
    socket: Arc<UdpSocket>,
    queue: Arc<BoundedQueue<Datagram>>,
    stopping: Arc<AtomicBool>,
    stats: Arc<HandlerStats>,
    max_packet: usize,
    on_received: Arc<Signal<Address>>,
    on_total_changed: Arc<Signal<u64>>,
    on_dropped_changed: Arc<Signal<u64>>,
    on_queued_changed: Arc<Signal<u64>>,
) {
    // Bounded so this thread wakes up periodically to recheck `stopping`
    // instead of blocking in `recvfrom` forever; without it, `UdpServer::stop`
    // would have to race `close()` against a syscall already in flight.
    let _ = socket.set_recv_timeout(Some(Duration::from_millis(200)));
    let mut buf = vec![0u8; max_packet.max(1)];
    while !stopping.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                let total = stats.received_total.fetch_add(1, Ordering::Relaxed) + 1;
                on_received.emit(from);
                on_total_changed.emit(total);
                let datagram = Datagram {
                    data: buf[..n].to_vec(),
                    from,
                    received_at: Instant::now(),
                };
                if queue.try_push(datagram) {
                    on_queued_changed.emit(queue.len() as u64);
                } else {
                    let dropped = stats.dropped_total.fetch_add(1, Ordering::Relaxed) + 1;
                    on_dropped_changed.emit(dropped);
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%from, "datagram queue full, dropping");
                }
            }
            Err(crate::error::Error::Timeout(_)) | Err(crate::error::Error::WouldBlock) => continue,
            Err(_) if stopping.load(Ordering::Acquire) => break,
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::error!(%err, "socket recv error");
                continue;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    queue: Arc<BoundedQueue<Datagram>>,
    stopping: Arc<AtomicBool>,
    source: Arc<HandlerSource>,
    stats: Arc<HandlerStats>,
    packet_timeout: Arc<Mutex<Duration>>,
    on_processed_changed: Arc<Signal<u64>>,
    on_dropped_changed: Arc<Signal<u64>>,
    on_exception: Arc<Signal<(String, String)>>,
) {
    loop {
        let datagram = match queue.pop_wait(Duration::from_millis(200)) {
            Some(d) => d,
            None => {
                if stopping.load(Ordering::Acquire) && queue.is_empty() {
                    return;
                }
                continue;
            }
        };

        let timeout = *packet_timeout.lock().unwrap();
        if !timeout.is_zero() && datagram.received_at.elapsed() > timeout {
            let dropped = stats.dropped_total.fetch_add(1, Ordering::Relaxed) + 1;
            on_dropped_changed.emit(dropped);
            continue;
        }

        let from = datagram.from;
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match source.as_ref() {
            HandlerSource::Shared(handler) => {
                process_packet(handler.as_ref(), &stats, &datagram.data, from);
            }
            HandlerSource::Factory(factory) => {
                let handler = factory(&datagram.data, from);
                process_packet(handler.as_ref(), &stats, &datagram.data, from);
            }
        }));
        if let Err(panic) = outcome {
            let message = panic_message(&panic);
            stats.exceptions_total.fetch_add(1, Ordering::Relaxed);
            #[cfg(feature = "tracing")]
            tracing::error!(%from, %message, "udp handler panicked");
            on_exception.emit((message, from.to_string()));
        }
        on_processed_changed.emit(stats.processed_total.load(Ordering::Relaxed));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "udp handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inet::Family;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct Echo {
        seen: StdMutex<Vec<Vec<u8>>>,
    }
    impl UdpHandler for Echo {
        fn handle_packet(&self, data: &[u8], _from: Address) {
            self.seen.lock().unwrap().push(data.to_vec());
        }
    }

    #[test]
    fn processes_datagrams_sent_to_it() {
        let socket = UdpSocket::new();
        socket.bind(&Address::new(Family::V4, "127.0.0.1", 0).unwrap()).unwrap();

        let handler = Arc::new(Echo {
            seen: StdMutex::new(Vec::new()),
        });
        let server = UdpServer::new(socket, handler.clone(), 2, 8);
        let local = server.local_address().unwrap();
        server.start();

        let sender = UdpSocket::new();
        sender.bind(&Address::new(Family::V4, "127.0.0.1", 0).unwrap()).unwrap();
        for _ in 0..5 {
            sender.send_to(b"ping", &local).unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(100));
        server.stop();

        assert_eq!(handler.seen.lock().unwrap().len(), 5);
        assert_eq!(server.stats().processed_total, 5);
        assert_eq!(server.stats().received_total, 5);
        assert!(server.stats().bytes_processed_total >= 20);
    }

    #[test]
    fn dropped_counter_tracks_oversized_packets() {
        let _ = AtomicUsize::new(0);
        struct TinyHandler;
        impl UdpHandler for TinyHandler {
            fn max_packet_size(&self) -> usize {
                2
            }
            fn handle_packet(&self, _data: &[u8], _from: Address) {}
        }

        let socket = UdpSocket::new();
        socket.bind(&Address::new(Family::V4, "127.0.0.1", 0).unwrap()).unwrap();
        let server = UdpServer::new(socket, Arc::new(TinyHandler), 1, 8);
        let local = server.local_address().unwrap();
        server.start();

        let sender = UdpSocket::new();
        sender.bind(&Address::new(Family::V4, "127.0.0.1", 0).unwrap()).unwrap();
        sender.send_to(b"too long", &local).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        server.stop();

        assert_eq!(server.stats().dropped_total, 1);
    }

    #[test]
    fn factory_builds_a_fresh_handler_per_datagram() {
        struct OneShot(Arc<AtomicUsize>);
        impl UdpHandler for OneShot {
            fn handle_packet(&self, data: &[u8], _from: Address) {
                assert_eq!(data, b"ping");
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let build_count = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));

        let socket = UdpSocket::new();
        socket.bind(&Address::new(Family::V4, "127.0.0.1", 0).unwrap()).unwrap();

        let builds = build_count.clone();
        let hits = processed.clone();
        let server = UdpServer::with_factory(
            socket,
            move |_data, _from| {
                builds.fetch_add(1, Ordering::SeqCst);
                Box::new(OneShot(hits.clone())) as Box<dyn UdpHandler>
            },
            1,
            8,
        );
        let local = server.local_address().unwrap();
        server.start();

        let sender = UdpSocket::new();
        sender.bind(&Address::new(Family::V4, "127.0.0.1", 0).unwrap()).unwrap();
        sender.send_to(b"ping", &local).unwrap();
        sender.send_to(b"ping", &local).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        server.stop();

        assert_eq!(build_count.load(Ordering::SeqCst), 2);
        assert_eq!(processed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn lifecycle_signals_fire_in_order() {
        let socket = UdpSocket::new();
        socket.bind(&Address::new(Family::V4, "127.0.0.1", 0).unwrap()).unwrap();

        let server = Arc::new(UdpServer::new(socket, Arc::new(Echo { seen: StdMutex::new(Vec::new()) }), 1, 4));
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let e1 = events.clone();
        server.on_server_started.connect(0, move |_| e1.lock().unwrap().push("started"));
        let e2 = events.clone();
        server.on_server_stopping.connect(0, move |_| e2.lock().unwrap().push("stopping"));
        let e3 = events.clone();
        server.on_server_stopped.connect(0, move |_| e3.lock().unwrap().push("stopped"));

        server.start();
        server.stop();

        assert_eq!(*events.lock().unwrap(), vec!["started", "stopping", "stopped"]);
    }

    #[test]
    fn packet_timeout_drops_stale_queued_datagrams() {
        let socket = UdpSocket::new();
        socket.bind(&Address::new(Family::V4, "127.0.0.1", 0).unwrap()).unwrap();

        struct Slow;
        impl UdpHandler for Slow {
            fn handle_packet(&self, _data: &[u8], _from: Address) {
                std::thread::sleep(Duration::from_millis(300));
            }
        }

        let server = UdpServer::new(socket, Arc::new(Slow), 1, 8);
        server.set_packet_timeout(Duration::from_millis(50));
        let local = server.local_address().unwrap();
        server.start();

        let sender = UdpSocket::new();
        sender.bind(&Address::new(Family::V4, "127.0.0.1", 0).unwrap()).unwrap();
        // First packet occupies the only worker for 300ms; the second sits
        // queued long enough to age past the 50ms timeout and get dropped.
        sender.send_to(b"first", &local).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        sender.send_to(b"second", &local).unwrap();
        std::thread::sleep(Duration::from_millis(500));
        server.stop();

        assert_eq!(server.stats().dropped_total, 1);
        assert_eq!(server.stats().processed_total, 1);
    }
}
