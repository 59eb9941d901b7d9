use super::queue::BoundedQueue;
use super::tcp_connection::{ConnectionContext, TcpServerConnection};
use crate::inet::Address;
use crate::signal::Signal;
use crate::tcp::{ServerSocket, TcpClient};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type HandlerFactory = dyn Fn() -> Box<dyn TcpServerConnection> + Send + Sync;

/// Snapshot of a [`TcpServer`]'s counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpServerStats {
    pub accepted_total: u64,
    pub rejected_total: u64,
    pub exceptions_total: u64,
    pub active_connections: u64,
}

struct Accepted {
    client: TcpClient,
    client_address: Address,
    local_address: Address,
}

/// A threaded TCP server: one acceptor thread feeding a bounded queue,
/// drained by a fixed pool of worker threads that each run one
/// [`TcpServerConnection`] to completion.
///
/// Backpressure: once the queue is full, newly accepted connections are
/// closed immediately and counted in `rejected_total` instead of blocking
/// the acceptor thread.
///
/// This server's own signals report on the server's aggregate view of every
/// connection it handles (`on_connection_accepted`, `on_connection_closed`,
/// `on_active_connections_changed`, ...). A single connection's own
/// lifecycle is reported separately through the signals on the
/// [`ConnectionContext`](super::tcp_connection::ConnectionContext) its
/// handler runs with.
pub struct TcpServer {
    server_socket: Arc<ServerSocket>,
    factory: Arc<HandlerFactory>,
    queue: Arc<BoundedQueue<Accepted>>,
    worker_count: usize,
    stopping: Arc<AtomicBool>,
    accepted_total: Arc<AtomicU64>,
    rejected_total: Arc<AtomicU64>,
    exceptions_total: Arc<AtomicU64>,
    active_connections: Arc<AtomicU64>,
    acceptor: std::sync::Mutex<Option<JoinHandle<()>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,

    pub on_server_started: Arc<Signal<()>>,
    pub on_server_stopping: Arc<Signal<()>>,
    pub on_server_stopped: Arc<Signal<()>>,
    pub on_connection_accepted: Arc<Signal<Address>>,
    pub on_connection_closed: Arc<Signal<Address>>,
    pub on_active_connections_changed: Arc<Signal<u64>>,
    pub on_exception: Arc<Signal<(String, String)>>,
}

impl TcpServer {
    /// `server_socket` must already be bound and listening.
    pub fn new(
        server_socket: ServerSocket,
        worker_count: usize,
        max_queue: usize,
        factory: impl Fn() -> Box<dyn TcpServerConnection> + Send + Sync + 'static,
    ) -> Self {
        TcpServer {
            server_socket: Arc::new(server_socket),
            factory: Arc::new(factory),
            queue: Arc::new(BoundedQueue::new(max_queue)),
            worker_count: worker_count.max(1),
            stopping: Arc::new(AtomicBool::new(false)),
            accepted_total: Arc::new(AtomicU64::new(0)),
            rejected_total: Arc::new(AtomicU64::new(0)),
            exceptions_total: Arc::new(AtomicU64::new(0)),
            active_connections: Arc::new(AtomicU64::new(0)),
            acceptor: std::sync::Mutex::new(None),
            workers: std::sync::Mutex::new(Vec::new()),
            on_server_started: Arc::new(Signal::new()),
            on_server_stopping: Arc::new(Signal::new()),
            on_server_stopped: Arc::new(Signal::new()),
            on_connection_accepted: Arc::new(Signal::new()),
            on_connection_closed: Arc::new(Signal::new()),
            on_active_connections_changed: Arc::new(Signal::new()),
            on_exception: Arc::new(Signal::new()),
        }
    }

    pub fn start(&self) {
        self.stopping.store(false, Ordering::Release);

        let server_socket = self.server_socket.clone();
        let queue = self.queue.clone();
        let stopping = self.stopping.clone();
        let accepted_total = self.accepted_total.clone();
        let rejected_total = self.rejected_total.clone();
        let on_accepted = self.on_connection_accepted.clone();
        *self.acceptor.lock().unwrap() = Some(thread::spawn(move || {
            acceptor_loop(server_socket, queue, stopping, accepted_total, rejected_total, on_accepted);
        }));

        let mut workers = self.workers.lock().unwrap();
        for _ in 0..self.worker_count {
            let queue = self.queue.clone();
            let stopping = self.stopping.clone();
            let factory = self.factory.clone();
            let exceptions_total = self.exceptions_total.clone();
            let active_connections = self.active_connections.clone();
            let on_closed = self.on_connection_closed.clone();
            let on_active_changed = self.on_active_connections_changed.clone();
            let on_exception = self.on_exception.clone();
            workers.push(thread::spawn(move || {
                worker_loop(
                    queue,
                    stopping,
                    factory,
                    exceptions_total,
                    active_connections,
                    on_closed,
                    on_active_changed,
                    on_exception,
                );
            }));
        }

        self.on_server_started.emit(());
    }

    /// Stops accepting new connections, wakes idle workers, and joins every
    /// thread up to `deadline`. Threads still running past the deadline are
    /// detached (handed to a reaper thread) rather than leaked or forcibly
    /// killed, since Rust has no API to cancel a running `std::thread`.
    pub fn stop(&self, deadline: Duration) {
        self.on_server_stopping.emit(());
        self.stopping.store(true, Ordering::Release);
        self.server_socket.close();
        self.queue.wake_all();

        let start = Instant::now();
        if let Some(handle) = self.acceptor.lock().unwrap().take() {
            join_with_deadline(handle, deadline.saturating_sub(start.elapsed()));
        }
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            join_with_deadline(handle, deadline.saturating_sub(start.elapsed()));
        }
        self.on_server_stopped.emit(());
    }

    pub fn local_address(&self) -> crate::error::Result<Address> {
        self.server_socket.local_address()
    }

    pub fn stats(&self) -> TcpServerStats {
        TcpServerStats {
            accepted_total: self.accepted_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            exceptions_total: self.exceptions_total.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

fn acceptor_loop(
    server_socket: Arc<ServerSocket>,
    queue: Arc<BoundedQueue<Accepted>>,
    stopping: Arc<AtomicBool>,
    accepted_total: Arc<AtomicU64>,
    rejected_total: Arc<AtomicU64>,
    on_accepted: Arc<Signal<Address>>,
) {
    while !stopping.load(Ordering::Acquire) {
        match server_socket.accept_with_timeout(Duration::from_millis(200)) {
            Ok((client, client_address)) => {
                accepted_total.fetch_add(1, Ordering::Relaxed);
                on_accepted.emit(client_address);
                let local_address = client.local_address().unwrap_or(client_address);
                let accepted = Accepted {
                    client,
                    client_address,
                    local_address,
                };
                if !queue.try_push(accepted) {
                    rejected_total.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%client_address, "connection queue full, rejecting");
                    // `accepted` was consumed by the failed push; its
                    // `TcpClient` drops here, closing the connection.
                }
            }
            Err(crate::error::Error::Timeout(_)) => continue,
            Err(_) if stopping.load(Ordering::Acquire) => break,
            Err(_) => continue,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    queue: Arc<BoundedQueue<Accepted>>,
    stopping: Arc<AtomicBool>,
    factory: Arc<HandlerFactory>,
    exceptions_total: Arc<AtomicU64>,
    active_connections: Arc<AtomicU64>,
    on_closed: Arc<Signal<Address>>,
    on_active_changed: Arc<Signal<u64>>,
    on_exception: Arc<Signal<(String, String)>>,
) {
    loop {
        let accepted = match queue.pop_wait(Duration::from_millis(200)) {
            Some(a) => a,
            None => {
                if stopping.load(Ordering::Acquire) && queue.is_empty() {
                    return;
                }
                continue;
            }
        };

        let active_now = active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        on_active_changed.emit(active_now);
        let client_address = accepted.client_address;
        let ctx = ConnectionContext::new(
            accepted.client,
            client_address,
            accepted.local_address,
            stopping.clone(),
        );

        ctx.on_connection_started.emit(());
        let mut handler = factory();
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.run(&ctx)));
        if let Err(panic) = outcome {
            exceptions_total.fetch_add(1, Ordering::Relaxed);
            let message = panic_message(&panic);
            #[cfg(feature = "tracing")]
            tracing::error!(%client_address, %message, "connection handler panicked");
            handler.handle_exception(&ctx, &message);
            on_exception.emit((message, client_address.to_string()));
        }

        ctx.on_connection_closing.emit(());
        ctx.socket().close();
        ctx.on_connection_closed.emit(());
        on_closed.emit(client_address);

        let active_now = active_connections.fetch_sub(1, Ordering::Relaxed) - 1;
        on_active_changed.emit(active_now);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "connection handler panicked".to_string()
    }
}

fn join_with_deadline(handle: JoinHandle<()>, remaining: Duration) {
    if remaining.is_zero() {
        thread::spawn(move || {
            let _ = handle.join();
        });
        return;
    }
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = handle.join();
        let _ = tx.send(());
    });
    let _ = rx.recv_timeout(remaining);
}
