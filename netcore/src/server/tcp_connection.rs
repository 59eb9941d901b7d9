use crate::error::Result;
use crate::inet::Address;
use crate::signal::Signal;
use crate::tcp::TcpClient;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a worker thread hands to one accepted connection's handler.
///
/// Holds the accepted socket plus the bookkeeping `TcpServerConnection`
/// implementations need without reaching into `TcpServer` directly:
/// addresses, connection age, the cooperative stop flag set by
/// `TcpServer::stop`, and this connection's own signal surface. These
/// signals are distinct from `TcpServer`'s own: `TcpServer`'s fire for the
/// server's view of every connection it has handled, while these fire once
/// each for the single connection `ctx` represents.
pub struct ConnectionContext {
    client: TcpClient,
    client_address: Address,
    local_address: Address,
    started_at: Instant,
    stop_requested: Arc<AtomicBool>,

    pub on_connection_started: Signal<()>,
    pub on_connection_closing: Signal<()>,
    pub on_connection_closed: Signal<()>,
    pub on_exception: Signal<String>,
}

impl ConnectionContext {
    pub(crate) fn new(
        client: TcpClient,
        client_address: Address,
        local_address: Address,
        stop_requested: Arc<AtomicBool>,
    ) -> Self {
        ConnectionContext {
            client,
            client_address,
            local_address,
            started_at: Instant::now(),
            stop_requested,
            on_connection_started: Signal::new(),
            on_connection_closing: Signal::new(),
            on_connection_closed: Signal::new(),
            on_exception: Signal::new(),
        }
    }

    pub fn socket(&self) -> &TcpClient {
        &self.client
    }

    pub fn client_address(&self) -> Address {
        self.client_address
    }

    pub fn local_address(&self) -> Address {
        self.local_address
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// `run()` implementations should poll this in any loop and return
    /// promptly once it flips true.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.client.set_send_timeout(timeout)?;
        self.client.set_recv_timeout(timeout)
    }

    pub fn set_no_delay(&self, flag: bool) -> Result<()> {
        self.client.no_delay(flag)
    }

    pub fn set_keep_alive(&self, flag: bool) -> Result<()> {
        self.client.keep_alive(flag)
    }
}

/// Per-connection handling logic run on a dedicated worker thread.
///
/// `TcpServer` constructs one handler per accepted connection (via the
/// factory passed to `TcpServer::new`), invokes `run` exactly once, then
/// closes the socket regardless of how `run` returned. A handler that never
/// checks `ctx.stop_requested()` will not be interrupted by
/// `TcpServer::stop` until it returns on its own or the shutdown deadline
/// forces the worker thread to be detached.
pub trait TcpServerConnection: Send {
    fn run(&mut self, ctx: &ConnectionContext);

    /// Called on the connection's worker thread when `run` unwinds instead
    /// of returning normally. The default emits `ctx.on_exception` with
    /// `message`; override to add connection-specific recovery or cleanup.
    fn handle_exception(&mut self, ctx: &ConnectionContext, message: &str) {
        ctx.on_exception.emit(message.to_string());
    }
}

/// Adapts a plain closure into a [`TcpServerConnection`], for handlers that
/// don't need their own struct.
impl<F: FnMut(&ConnectionContext) + Send> TcpServerConnection for F {
    fn run(&mut self, ctx: &ConnectionContext) {
        self(ctx)
    }
}
