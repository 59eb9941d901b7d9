use super::MAX_DATAGRAM_SIZE;
use crate::error::{Error, Result};
use crate::inet::Address;
use crate::socket::{SockKind, SocketCore};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// A datagram endpoint. `send`/`recv` require a prior `connect`;
/// `send_to`/`recv_from` work whether or not the socket is connected.
pub struct UdpSocket {
    core: SocketCore,
}

impl UdpSocket {
    pub fn new() -> Self {
        UdpSocket {
            core: SocketCore::new(),
        }
    }

    pub fn bind(&self, addr: &Address) -> Result<()> {
        if self.core.is_closed() {
            self.core.init(addr.family(), SockKind::Dgram)?;
        }
        self.core.bind(addr)
    }

    pub fn connect(&self, addr: &Address) -> Result<()> {
        if self.core.is_closed() {
            self.core.init(addr.family(), SockKind::Dgram)?;
        }
        self.core.connect(addr)
    }

    /// Clears the peer binding established by `connect` by issuing a
    /// `connect(AF_UNSPEC)` — the documented way to dissolve a UDP
    /// connection on Linux and the BSDs. Connecting to an ordinary wildcard
    /// address instead would just connect the socket to `0.0.0.0`, not
    /// disconnect it.
    #[cfg(unix)]
    pub fn disconnect(&self) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let fd = self.core.as_raw_fd()?;
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        storage.ss_family = libc::AF_UNSPEC as libc::sa_family_t;
        let rc = unsafe {
            libc::connect(
                fd,
                &storage as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sa_family_t>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // Some platforms reject an AF_UNSPEC connect on a socket that
            // was never connected in the first place; harmless either way.
            if err.raw_os_error() != Some(libc::EAFNOSUPPORT) {
                return Err(Error::io("connect(AF_UNSPEC) failed", err));
            }
        }
        self.core.set_connected(false);
        Ok(())
    }

    pub fn send_to(&self, buf: &[u8], addr: &Address) -> Result<usize> {
        check_datagram_size(buf)?;
        self.core.send_to(buf, addr)
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        self.core.recv_from(buf)
    }

    /// Requires a prior `connect`; raises `Logic` otherwise.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        if !self.core.is_connected() {
            return Err(Error::Logic("send() requires a connected UDP socket"));
        }
        check_datagram_size(buf)?;
        self.core.send(buf)
    }

    /// Requires a prior `connect`; raises `Logic` otherwise.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.core.is_connected() {
            return Err(Error::Logic("recv() requires a connected UDP socket"));
        }
        self.core.recv(buf)
    }

    pub fn broadcast(&self, flag: bool) -> Result<()> {
        self.core.broadcast(flag)
    }

    /// Bounds how long `recv`/`recv_from` block. `UdpServer`'s receiver
    /// thread relies on this being set so it can periodically recheck its
    /// stop flag instead of blocking in the kernel indefinitely.
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.core.recv_timeout(timeout)
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.core.send_timeout(timeout)
    }

    pub fn multicast_ttl_v4(&self, ttl: u32) -> Result<()> {
        self.core
            .with_raw(|s| s.set_multicast_ttl_v4(ttl).map_err(|e| Error::io("set IP_MULTICAST_TTL failed", e)))
    }

    pub fn multicast_loop_v4(&self, flag: bool) -> Result<()> {
        self.core.with_raw(|s| {
            s.set_multicast_loop_v4(flag)
                .map_err(|e| Error::io("set IP_MULTICAST_LOOP failed", e))
        })
    }

    pub fn multicast_loop_v6(&self, flag: bool) -> Result<()> {
        self.core.with_raw(|s| {
            s.set_multicast_loop_v6(flag)
                .map_err(|e| Error::io("set IPV6_MULTICAST_LOOP failed", e))
        })
    }

    /// Joins a multicast group on `interface` (or the default interface
    /// when `None`). IPv4 is fully supported; IPv6 group membership raises
    /// `Unsupported`.
    pub fn join_group(&self, multiaddr: IpAddr, interface: Option<IpAddr>) -> Result<()> {
        match multiaddr {
            IpAddr::V4(group) => {
                let iface = match interface {
                    Some(IpAddr::V4(i)) => i,
                    None => Ipv4Addr::UNSPECIFIED,
                    Some(IpAddr::V6(_)) => {
                        return Err(Error::InvalidArgument(
                            "interface family must match the multicast group family".into(),
                        ))
                    }
                };
                self.core.with_raw(|s| {
                    s.join_multicast_v4(&group, &iface)
                        .map_err(|e| Error::io("IP_ADD_MEMBERSHIP failed", e))
                })
            }
            IpAddr::V6(_) => Err(Error::Unsupported("IPv6 multicast group membership")),
        }
    }

    pub fn leave_group(&self, multiaddr: IpAddr, interface: Option<IpAddr>) -> Result<()> {
        match multiaddr {
            IpAddr::V4(group) => {
                let iface = match interface {
                    Some(IpAddr::V4(i)) => i,
                    None => Ipv4Addr::UNSPECIFIED,
                    Some(IpAddr::V6(_)) => {
                        return Err(Error::InvalidArgument(
                            "interface family must match the multicast group family".into(),
                        ))
                    }
                };
                self.core.with_raw(|s| {
                    s.leave_multicast_v4(&group, &iface)
                        .map_err(|e| Error::io("IP_DROP_MEMBERSHIP failed", e))
                })
            }
            IpAddr::V6(_) => Err(Error::Unsupported("IPv6 multicast group membership")),
        }
    }

    pub fn local_address(&self) -> Result<Address> {
        self.core.local_address()
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn close(&self) {
        self.core.close();
    }

    pub(crate) fn core(&self) -> &SocketCore {
        &self.core
    }
}

impl Default for UdpSocket {
    fn default() -> Self {
        Self::new()
    }
}

fn check_datagram_size(buf: &[u8]) -> Result<()> {
    if buf.len() > MAX_DATAGRAM_SIZE {
        return Err(Error::InvalidArgument(format!(
            "datagram of {} bytes exceeds the {} byte limit",
            buf.len(),
            MAX_DATAGRAM_SIZE
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inet::Family;

    #[test]
    fn unconnected_send_recv_round_trip() {
        let a = UdpSocket::new();
        a.bind(&Address::new(Family::V4, "127.0.0.1", 0).unwrap()).unwrap();
        let b = UdpSocket::new();
        b.bind(&Address::new(Family::V4, "127.0.0.1", 0).unwrap()).unwrap();

        let a_addr = a.local_address().unwrap();
        b.send_to(b"ping", &a_addr).unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = a.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from.family(), Family::V4);
    }

    #[test]
    fn send_on_unconnected_socket_is_logic_error() {
        let a = UdpSocket::new();
        a.bind(&Address::new(Family::V4, "127.0.0.1", 0).unwrap()).unwrap();
        assert!(matches!(a.send(b"x"), Err(Error::Logic(_))));
    }

    #[test]
    fn oversized_datagram_is_rejected() {
        let a = UdpSocket::new();
        a.bind(&Address::new(Family::V4, "127.0.0.1", 0).unwrap()).unwrap();
        let target = a.local_address().unwrap();
        let buf = vec![0u8; super::MAX_DATAGRAM_SIZE + 1];
        assert!(matches!(a.send_to(&buf, &target), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn ipv6_multicast_is_unsupported() {
        let a = UdpSocket::new();
        a.bind(&Address::new(Family::V6, "::1", 0).unwrap()).unwrap();
        let group: IpAddr = "ff02::1".parse().unwrap();
        assert!(matches!(a.join_group(group, None), Err(Error::Unsupported(_))));
    }
}
