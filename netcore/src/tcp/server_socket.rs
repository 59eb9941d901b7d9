use super::client::TcpClient;
use crate::error::Result;
use crate::inet::Address;
use crate::socket::{PollMode, SockKind, SocketCore};
use std::time::Duration;

/// A listening stream endpoint.
pub struct ServerSocket {
    core: SocketCore,
    backlog: std::sync::atomic::AtomicI32,
}

impl ServerSocket {
    pub fn new() -> Self {
        ServerSocket {
            core: SocketCore::new(),
            backlog: std::sync::atomic::AtomicI32::new(128),
        }
    }

    pub fn bind(&self, addr: &Address) -> Result<()> {
        if self.core.is_closed() {
            self.core.init(addr.family(), SockKind::Stream)?;
        }
        self.core.reuse_address(true)?;
        self.core.bind(addr)
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        self.backlog.store(backlog, std::sync::atomic::Ordering::Relaxed);
        self.core.listen(backlog)
    }

    /// Best-effort: some platforms ignore changing the backlog of a socket
    /// that is already listening.
    pub fn set_backlog(&self, backlog: i32) -> Result<()> {
        self.backlog.store(backlog, std::sync::atomic::Ordering::Relaxed);
        self.core.listen(backlog)
    }

    pub fn accept(&self) -> Result<(TcpClient, Address)> {
        let (socket, addr) = self.core.accept()?;
        let family = self.core.family().unwrap_or(addr.family());
        Ok((TcpClient::from_accepted(socket, family), addr))
    }

    pub fn accept_with_timeout(&self, timeout: Duration) -> Result<(TcpClient, Address)> {
        let (socket, addr) = self.core.accept_with_timeout(timeout)?;
        let family = self.core.family().unwrap_or(addr.family());
        Ok((TcpClient::from_accepted(socket, family), addr))
    }

    pub fn has_pending_connections(&self, timeout: Duration) -> Result<bool> {
        self.core.poll(timeout, PollMode::READ)
    }

    pub fn reuse_address(&self, flag: bool) -> Result<()> {
        self.core.reuse_address(flag)
    }

    pub fn reuse_port(&self, flag: bool) -> Result<()> {
        self.core.reuse_port(flag)
    }

    pub fn local_address(&self) -> Result<Address> {
        self.core.local_address()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Synchronous; releases the handle immediately, which unblocks any
    /// in-progress `accept`.
    pub fn close(&self) {
        self.core.close();
    }

    pub(crate) fn core(&self) -> &SocketCore {
        &self.core
    }
}

impl Default for ServerSocket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_report_local_address() {
        let server = ServerSocket::new();
        server.bind(&Address::parse("127.0.0.1:0").unwrap()).unwrap();
        server.listen(8).unwrap();
        let local = server.local_address().unwrap();
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn accept_with_timeout_times_out_with_no_client() {
        let server = ServerSocket::new();
        server.bind(&Address::parse("127.0.0.1:0").unwrap()).unwrap();
        server.listen(8).unwrap();
        let result = server.accept_with_timeout(Duration::from_millis(50));
        assert!(matches!(result, Err(crate::error::Error::Timeout(_))));
    }
}
