use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

/// Address family tag. Mirrors the two sockaddr shapes the platform actually
/// hands back (`sockaddr_in` / `sockaddr_in6`); there is no "unspecified"
/// family — `Address::new(family)` always picks a concrete wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    fn wildcard(self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// A family-tagged IP endpoint: an address plus a port.
///
/// Immutable after construction. Ordering is by family, then the textual
/// host form, then port — not by numeric address value — so that
/// `BTreeSet<Address>` groups endpoints the way a human reading a sorted
/// listing would expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    ip: IpAddr,
    port: u16,
}

impl Address {
    /// The wildcard address for `family` with port 0 ("any port").
    pub fn new_wildcard(family: Family) -> Self {
        Address {
            ip: family.wildcard(),
            port: 0,
        }
    }

    /// Builds an address from an explicit family, host text, and port.
    ///
    /// `host` may be a numeric address in `family`'s notation, one of the
    /// wildcard spellings (`""`, `"0.0.0.0"`, `"::"`), or a hostname, which
    /// is resolved synchronously through the system resolver. The first
    /// resolved candidate matching `family` is used.
    pub fn new(family: Family, host: &str, port: u16) -> Result<Self> {
        if host.is_empty() || host == "0.0.0.0" || host == "::" {
            return Ok(Address {
                ip: family.wildcard(),
                port,
            });
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            if Family::of(&ip) != family {
                return Err(Error::InvalidArgument(format!(
                    "host '{host}' does not match requested family {family:?}"
                )));
            }
            return Ok(Address { ip, port });
        }

        resolve(host, port, Some(family))
    }

    /// Parses `"host:port"` (IPv4) or `"[host]:port"` (IPv6, brackets
    /// required whenever a port follows). `port` may be decimal or a
    /// service name resolvable via the system services database.
    pub fn parse(endpoint: &str) -> Result<Self> {
        let (host, port_text) = split_host_port(endpoint)?;
        let port = parse_port(port_text)?;

        if host.is_empty() || host == "0.0.0.0" || host == "::" {
            let family = if host == "::" { Family::V6 } else { Family::V4 };
            return Ok(Address {
                ip: family.wildcard(),
                port,
            });
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Address { ip, port });
        }

        resolve(host, port, None)
    }

    /// Builds an address from raw `sockaddr`/`sockaddr_in6` bytes, as
    /// returned by `accept`/`recvfrom`/`getsockname`.
    pub fn from_raw(bytes: &[u8]) -> Result<Self> {
        #[cfg(unix)]
        {
            raw::from_raw_unix(bytes)
        }
        #[cfg(not(unix))]
        {
            let _ = bytes;
            Err(Error::Unsupported("from_raw is only implemented for unix sockaddr layouts"))
        }
    }

    pub fn family(&self) -> Family {
        Family::of(&self.ip)
    }

    /// The textual host form, e.g. `"192.0.2.1"` or `"2001:db8::1"` (no
    /// brackets — brackets are only added by [`Address::to_string`]).
    pub fn host(&self) -> String {
        self.ip.to_string()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn is_wildcard(&self) -> bool {
        self.ip.is_unspecified()
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Address {
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    /// Raw `sockaddr`/`sockaddr_in6` bytes for this address, suitable for
    /// passing to `bind`/`connect`/`sendto`.
    #[cfg(unix)]
    pub fn raw(&self) -> Vec<u8> {
        raw::to_raw_unix(self)
    }

    /// Resolves `host` and returns every usable candidate, instead of just
    /// the first. `Address::new`/`Address::parse` keep "pick the first"
    /// semantics; this is for callers that want to implement their own
    /// selection (e.g. try all addresses in order, Happy-Eyeballs-style).
    pub fn resolve_all(host: &str, port: u16) -> Result<Vec<Address>> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Resolve {
                host: host.to_string(),
                reason: e.to_string(),
            })?
            .map(Address::from_socket_addr)
            .collect::<Vec<_>>();
        if addrs.is_empty() {
            return Err(Error::Resolve {
                host: host.to_string(),
                reason: "resolver returned no addresses".to_string(),
            });
        }
        Ok(addrs)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{ip}:{}", self.port),
            IpAddr::V6(ip) => write!(f, "[{ip}]:{}", self.port),
        }
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.family()
            .rank()
            .cmp(&other.family().rank())
            .then_with(|| self.host().cmp(&other.host()))
            .then_with(|| self.port.cmp(&other.port))
    }
}

impl Family {
    fn rank(self) -> u8 {
        match self {
            Family::V4 => 0,
            Family::V6 => 1,
        }
    }
}

fn resolve(host: &str, port: u16, family: Option<Family>) -> Result<Address> {
    let candidates = (host, port).to_socket_addrs().map_err(|e| Error::Resolve {
        host: host.to_string(),
        reason: e.to_string(),
    })?;

    for addr in candidates {
        let candidate = Address::from_socket_addr(addr);
        if family.map_or(true, |f| candidate.family() == f) {
            return Ok(candidate);
        }
    }

    Err(Error::Resolve {
        host: host.to_string(),
        reason: "resolver returned no address of the requested family".to_string(),
    })
}

fn split_host_port(endpoint: &str) -> Result<(&str, &str)> {
    if let Some(rest) = endpoint.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| Error::InvalidArgument(format!("unterminated '[' in '{endpoint}'")))?;
        let host = &rest[..close];
        let after = &rest[close + 1..];
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| Error::InvalidArgument(format!("missing port in '{endpoint}'")))?;
        return Ok((host, port));
    }

    let idx = endpoint
        .rfind(':')
        .ok_or_else(|| Error::InvalidArgument(format!("missing ':port' in '{endpoint}'")))?;
    Ok((&endpoint[..idx], &endpoint[idx + 1..]))
}

fn parse_port(text: &str) -> Result<u16> {
    if let Ok(n) = text.parse::<u32>() {
        if n == 0 || n > 65535 {
            return Err(Error::InvalidArgument(format!("port {n} out of range 1-65535")));
        }
        return Ok(n as u16);
    }

    // Not a number: try the services database via a throwaway resolve.
    format!("localhost:{text}")
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
        .map(|a| a.port())
        .ok_or_else(|| Error::InvalidArgument(format!("invalid port '{text}'")))
}

#[cfg(unix)]
mod raw {
    use super::*;
    use crate::error::Error;
    use std::mem;

    pub fn from_raw_unix(bytes: &[u8]) -> Result<Address> {
        if bytes.len() < mem::size_of::<libc::sa_family_t>() {
            return Err(Error::InvalidArgument("sockaddr buffer too short".into()));
        }
        let family = unsafe { (*(bytes.as_ptr() as *const libc::sockaddr)).sa_family as i32 };
        match family {
            libc::AF_INET => {
                if bytes.len() < mem::size_of::<libc::sockaddr_in>() {
                    return Err(Error::InvalidArgument("sockaddr_in buffer too short".into()));
                }
                let raw: libc::sockaddr_in =
                    unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const _) };
                let ip = Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
                let port = u16::from_be(raw.sin_port);
                Ok(Address {
                    ip: IpAddr::V4(ip),
                    port,
                })
            }
            libc::AF_INET6 => {
                if bytes.len() < mem::size_of::<libc::sockaddr_in6>() {
                    return Err(Error::InvalidArgument("sockaddr_in6 buffer too short".into()));
                }
                let raw: libc::sockaddr_in6 =
                    unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const _) };
                let ip = Ipv6Addr::from(raw.sin6_addr.s6_addr);
                let port = u16::from_be(raw.sin6_port);
                Ok(Address {
                    ip: IpAddr::V6(ip),
                    port,
                })
            }
            other => Err(Error::InvalidArgument(format!("unknown address family {other}"))),
        }
    }

    pub fn to_raw_unix(addr: &Address) -> Vec<u8> {
        match addr.ip {
            IpAddr::V4(ip) => {
                let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
                raw.sin_family = libc::AF_INET as libc::sa_family_t;
                raw.sin_port = addr.port.to_be();
                raw.sin_addr.s_addr = u32::from(ip).to_be();
                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        &raw as *const _ as *const u8,
                        mem::size_of::<libc::sockaddr_in>(),
                    )
                };
                bytes.to_vec()
            }
            IpAddr::V6(ip) => {
                let mut raw: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                raw.sin6_port = addr.port.to_be();
                raw.sin6_addr.s6_addr = ip.octets();
                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        &raw as *const _ as *const u8,
                        mem::size_of::<libc::sockaddr_in6>(),
                    )
                };
                bytes.to_vec()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_endpoint() {
        let a = Address::parse("127.0.0.1:8080").unwrap();
        assert_eq!(a.family(), Family::V4);
        assert_eq!(a.port(), 8080);
        assert_eq!(a.host(), "127.0.0.1");
    }

    #[test]
    fn parses_bracketed_ipv6_endpoint() {
        let a = Address::parse("[::1]:443").unwrap();
        assert_eq!(a.family(), Family::V6);
        assert_eq!(a.port(), 443);
    }

    #[test]
    fn round_trips_through_to_string() {
        let a = Address::parse("192.0.2.5:9").unwrap();
        assert_eq!(Address::parse(&a.to_string()).unwrap(), a);

        let b = Address::parse("[2001:db8::1]:9").unwrap();
        assert_eq!(Address::parse(&b.to_string()).unwrap(), b);
    }

    #[test]
    fn wildcard_forms_are_recognized() {
        let a = Address::new(Family::V4, "", 0).unwrap();
        assert!(a.is_wildcard());
        let b = Address::new(Family::V4, "0.0.0.0", 53).unwrap();
        assert!(b.is_wildcard());
        let c = Address::new(Family::V6, "::", 0).unwrap();
        assert!(c.is_wildcard());
    }

    #[test]
    fn rejects_out_of_range_port() {
        assert!(Address::parse("127.0.0.1:70000").is_err());
        assert!(Address::parse("127.0.0.1:0").is_err());
    }

    #[test]
    fn orders_by_family_then_host_then_port() {
        let v4_low = Address::parse("10.0.0.1:1").unwrap();
        let v4_high = Address::parse("10.0.0.1:2").unwrap();
        let v6 = Address::parse("[::1]:1").unwrap();
        assert!(v4_low < v4_high);
        assert!(v4_high < v6);
    }

    #[cfg(unix)]
    #[test]
    fn raw_round_trip_ipv4() {
        let a = Address::parse("198.51.100.7:1234").unwrap();
        let bytes = a.raw();
        let back = Address::from_raw(&bytes).unwrap();
        assert_eq!(a, back);
    }

    #[cfg(unix)]
    #[test]
    fn raw_round_trip_ipv6() {
        let a = Address::parse("[2001:db8::5]:4321").unwrap();
        let bytes = a.raw();
        let back = Address::from_raw(&bytes).unwrap();
        assert_eq!(a, back);
    }
}
