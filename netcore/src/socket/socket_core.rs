use super::OptionValue;
use crate::error::{Error, Result};
use crate::inet::{Address, Family};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;
#[cfg(not(unix))]
use std::time::Instant;

/// Upper bound applied to every `listen()` backlog request. Some platforms
/// silently clamp larger values anyway; we make the clamp explicit so
/// behavior doesn't vary by OS.
const MAX_BACKLOG: i32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    Stream,
    Dgram,
}

/// Bitmask of readiness conditions: `READ=1, WRITE=2, ERROR=4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollMode(u8);

impl PollMode {
    pub const NONE: PollMode = PollMode(0);
    pub const READ: PollMode = PollMode(1);
    pub const WRITE: PollMode = PollMode(2);
    pub const ERROR: PollMode = PollMode(4);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        PollMode(bits & 0b111)
    }

    pub fn contains(self, other: PollMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: PollMode) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for PollMode {
    type Output = PollMode;
    fn bitor(self, rhs: Self) -> Self {
        PollMode(self.0 | rhs.0)
    }
}

impl BitOrAssign for PollMode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

struct Inner {
    socket: Option<Socket>,
    family: Option<Family>,
    kind: Option<SockKind>,
    connected: bool,
    blocking: bool,
    recv_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            socket: None,
            family: None,
            kind: None,
            connected: false,
            blocking: true,
            recv_timeout: None,
            send_timeout: None,
        }
    }
}

/// Owns exactly one OS socket handle. `closed ⇒ handle invalid`;
/// `connected ⇒ ¬closed ∧ handle valid`. Close is idempotent and releases
/// the handle exactly once; everything but `close`/`is_closed` raises
/// [`Error::Logic`] once closed.
pub struct SocketCore {
    inner: std::sync::RwLock<Inner>,
}

impl SocketCore {
    pub fn new() -> Self {
        SocketCore {
            inner: std::sync::RwLock::new(Inner::default()),
        }
    }

    /// Wraps an already-open `socket2::Socket` (e.g. one returned from
    /// `accept`) as a connected core.
    pub fn from_connected(socket: Socket, family: Family, kind: SockKind) -> Self {
        SocketCore {
            inner: std::sync::RwLock::new(Inner {
                socket: Some(socket),
                family: Some(family),
                kind: Some(kind),
                connected: true,
                blocking: true,
                recv_timeout: None,
                send_timeout: None,
            }),
        }
    }

    /// Creates the native socket. Calling this twice raises `Logic`;
    /// operations before the first call also raise `Logic`.
    pub fn init(&self, family: Family, kind: SockKind) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        if g.socket.is_some() {
            return Err(Error::Logic("socket already initialized"));
        }
        let domain = match family {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        };
        let (ty, protocol) = match kind {
            SockKind::Stream => (Type::STREAM, Some(Protocol::TCP)),
            SockKind::Dgram => (Type::DGRAM, Some(Protocol::UDP)),
        };
        let socket =
            Socket::new(domain, ty, protocol).map_err(|e| Error::io("socket() failed", e))?;
        g.socket = Some(socket);
        g.family = Some(family);
        g.kind = Some(kind);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().unwrap().socket.is_none()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.read().unwrap().connected
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.write().unwrap().connected = connected;
    }

    /// Releases the handle. Safe to call more than once.
    pub fn close(&self) {
        let mut g = self.inner.write().unwrap();
        g.socket = None;
        g.connected = false;
    }

    fn with_socket<T>(&self, f: impl FnOnce(&Socket) -> Result<T>) -> Result<T> {
        let g = self.inner.read().unwrap();
        match &g.socket {
            Some(s) => f(s),
            None => Err(Error::Logic("operation on closed or uninitialized socket")),
        }
    }

    pub fn set_blocking(&self, blocking: bool) -> Result<()> {
        let mut g = self.inner.write().unwrap();
        let s = g
            .socket
            .as_ref()
            .ok_or(Error::Logic("operation on closed or uninitialized socket"))?;
        s.set_nonblocking(!blocking)
            .map_err(|e| Error::io("set_nonblocking() failed", e))?;
        g.blocking = blocking;
        Ok(())
    }

    pub fn is_blocking(&self) -> bool {
        self.inner.read().unwrap().blocking
    }

    pub fn bind(&self, addr: &Address) -> Result<()> {
        self.with_socket(|s| {
            let sa = SockAddr::from(addr.to_socket_addr());
            s.bind(&sa).map_err(|e| Error::io("bind() failed", e))
        })
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        self.with_socket(|s| {
            s.listen(backlog.clamp(1, MAX_BACKLOG))
                .map_err(|e| Error::io("listen() failed", e))
        })
    }

    pub fn connect(&self, addr: &Address) -> Result<()> {
        let sa = SockAddr::from(addr.to_socket_addr());
        self.with_socket(|s| s.connect(&sa).map_err(|e| Error::io("connect() failed", e)))?;
        self.set_connected(true);
        Ok(())
    }

    /// Connects with a wall-clock deadline: toggles non-blocking, attempts
    /// `connect`, and if the attempt is still in progress waits for
    /// write-readiness up to `timeout`, then probes `SO_ERROR`. Restores the
    /// prior blocking mode before returning either way.
    pub fn connect_with_timeout(&self, addr: &Address, timeout: Duration) -> Result<()> {
        let was_blocking = self.is_blocking();
        self.set_blocking(false)?;

        let sa = SockAddr::from(addr.to_socket_addr());
        let immediate = self.with_socket(|s| match s.connect(&sa) {
            Ok(()) => Ok(true),
            Err(e) if is_in_progress(&e) => Ok(false),
            Err(e) => Err(Error::io("connect() failed", e)),
        });

        let result = match immediate {
            Ok(true) => Ok(()),
            Ok(false) => {
                let ready = self.poll(timeout, PollMode::WRITE | PollMode::ERROR)?;
                if !ready {
                    Err(Error::Timeout(timeout))
                } else {
                    self.probe_connect_result(&sa)
                }
            }
            Err(e) => Err(e),
        };

        if was_blocking {
            let _ = self.set_blocking(true);
        }

        if result.is_ok() {
            self.set_connected(true);
        }
        result
    }

    fn probe_connect_result(&self, sa: &SockAddr) -> Result<()> {
        let err = self.with_socket(|s| {
            s.take_error()
                .map_err(|e| Error::io("getsockopt(SO_ERROR) failed", e))
        })?;
        match err {
            None => Ok(()),
            Some(e) => {
                // Some platforms report success on a second connect() call
                // ("already connected") rather than through SO_ERROR.
                let retry_ok = self.with_socket(|s| {
                    Ok(match s.connect(sa) {
                        Ok(()) => true,
                        Err(e2) => is_already_connected(&e2),
                    })
                });
                match retry_ok {
                    Ok(true) => Ok(()),
                    _ => Err(Error::io("connect() failed", e)),
                }
            }
        }
    }

    /// Blocking accept. Returns the accepted `socket2::Socket` and its peer
    /// address.
    pub fn accept(&self) -> Result<(Socket, Address)> {
        self.with_socket(|s| {
            let (socket, sa) = s.accept().map_err(|e| Error::io("accept() failed", e))?;
            let addr = sa
                .as_socket()
                .ok_or(Error::Logic("accept() returned a non-IP address"))?;
            Ok((socket, Address::from_socket_addr(addr)))
        })
    }

    /// Accepts with a wall-clock deadline. A zero duration is a non-blocking
    /// poll.
    pub fn accept_with_timeout(&self, timeout: Duration) -> Result<(Socket, Address)> {
        if !self.poll(timeout, PollMode::READ)? {
            return Err(Error::Timeout(timeout));
        }
        self.accept()
    }

    /// Waits up to `timeout` for any of `mode`'s conditions. `EINTR` is
    /// treated as "no events, not an error".
    #[cfg(unix)]
    pub fn poll(&self, timeout: Duration, mode: PollMode) -> Result<bool> {
        use std::os::unix::io::AsRawFd;

        let fd = self.with_socket(|s| Ok(s.as_raw_fd()))?;
        let mut events: i16 = 0;
        if mode.intersects(PollMode::READ) {
            events |= libc::POLLIN;
        }
        if mode.intersects(PollMode::WRITE) {
            events |= libc::POLLOUT;
        }
        if mode.intersects(PollMode::ERROR) {
            events |= libc::POLLERR;
        }

        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };

        let millis = duration_to_poll_millis(timeout);
        loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(false);
                }
                return Err(Error::io("poll() failed", err));
            }
            return Ok(rc > 0 && pfd.revents != 0);
        }
    }

    #[cfg(not(unix))]
    pub fn poll(&self, timeout: Duration, mode: PollMode) -> Result<bool> {
        // Portable fallback: repeatedly probe with a zero-timeout select-like
        // check. Adequate for tests; production non-unix targets should add
        // a real backend the way `poll::PollSet` does for the multiplexer.
        let deadline = Instant::now() + timeout;
        loop {
            let g = self.inner.read().unwrap();
            let s = g
                .socket
                .as_ref()
                .ok_or(Error::Logic("operation on closed or uninitialized socket"))?;
            if mode.intersects(PollMode::WRITE) {
                if s.take_error().ok().flatten().is_none() {
                    return Ok(true);
                }
            }
            drop(g);
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn local_address(&self) -> Result<Address> {
        self.with_socket(|s| {
            let sa = s
                .local_addr()
                .map_err(|e| Error::io("getsockname() failed", e))?;
            sa.as_socket()
                .map(Address::from_socket_addr)
                .ok_or(Error::Logic("local address is not an IP address"))
        })
    }

    pub fn peer_address(&self) -> Result<Address> {
        self.with_socket(|s| {
            let sa = s
                .peer_addr()
                .map_err(|e| Error::io("getpeername() failed", e))?;
            sa.as_socket()
                .map(Address::from_socket_addr)
                .ok_or(Error::Logic("peer address is not an IP address"))
        })
    }

    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        self.with_socket(|s| s.send(buf).map_err(|e| Error::io("send() failed", e)))
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.with_socket(|s| {
            // SAFETY: `recv` immediately writes through this slice and never
            // reads uninitialized bytes through the `MaybeUninit` view.
            let uninit = unsafe {
                std::slice::from_raw_parts_mut(
                    buf.as_mut_ptr() as *mut std::mem::MaybeUninit<u8>,
                    buf.len(),
                )
            };
            s.recv(uninit).map_err(|e| Error::io("recv() failed", e))
        })
    }

    pub fn send_to(&self, buf: &[u8], addr: &Address) -> Result<usize> {
        self.with_socket(|s| {
            let sa = SockAddr::from(addr.to_socket_addr());
            s.send_to(buf, &sa)
                .map_err(|e| Error::io("sendto() failed", e))
        })
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        self.with_socket(|s| {
            let uninit = unsafe {
                std::slice::from_raw_parts_mut(
                    buf.as_mut_ptr() as *mut std::mem::MaybeUninit<u8>,
                    buf.len(),
                )
            };
            let (n, sa) = s
                .recv_from(uninit)
                .map_err(|e| Error::io("recvfrom() failed", e))?;
            let addr = sa
                .as_socket()
                .map(Address::from_socket_addr)
                .ok_or(Error::Logic("recvfrom() returned a non-IP address"))?;
            Ok((n, addr))
        })
    }

    pub fn shutdown(&self, how: std::net::Shutdown) -> Result<()> {
        self.with_socket(|s| s.shutdown(how).map_err(|e| Error::io("shutdown() failed", e)))
    }

    // --- option surface -----------------------------------------------

    /// Generic `setsockopt`, for options with no dedicated wrapper.
    #[cfg(unix)]
    pub fn set_option(&self, level: i32, name: i32, value: OptionValue) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let fd = self.with_socket(|s| Ok(s.as_raw_fd()))?;
        let rc = match &value {
            OptionValue::Bool(b) => {
                let iv: i32 = *b as i32;
                unsafe {
                    libc::setsockopt(
                        fd,
                        level,
                        name,
                        &iv as *const i32 as *const libc::c_void,
                        std::mem::size_of::<i32>() as libc::socklen_t,
                    )
                }
            }
            OptionValue::Int(v) => unsafe {
                libc::setsockopt(
                    fd,
                    level,
                    name,
                    v as *const i32 as *const libc::c_void,
                    std::mem::size_of::<i32>() as libc::socklen_t,
                )
            },
            OptionValue::Bytes(bytes) => unsafe {
                libc::setsockopt(
                    fd,
                    level,
                    name,
                    bytes.as_ptr() as *const libc::c_void,
                    bytes.len() as libc::socklen_t,
                )
            },
        };
        if rc != 0 {
            return Err(Error::io("setsockopt() failed", std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(unix)]
    pub fn get_option_int(&self, level: i32, name: i32) -> Result<i32> {
        use std::os::unix::io::AsRawFd;
        let fd = self.with_socket(|s| Ok(s.as_raw_fd()))?;
        let mut value: i32 = 0;
        let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                level,
                name,
                &mut value as *mut i32 as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(Error::io("getsockopt() failed", std::io::Error::last_os_error()));
        }
        Ok(value)
    }

    pub fn reuse_address(&self, flag: bool) -> Result<()> {
        self.with_socket(|s| {
            s.set_reuse_address(flag)
                .map_err(|e| Error::io("set SO_REUSEADDR failed", e))
        })
    }

    /// No-op on platforms without `SO_REUSEPORT` (Windows).
    pub fn reuse_port(&self, flag: bool) -> Result<()> {
        #[cfg(all(unix, not(target_os = "solaris")))]
        {
            self.with_socket(|s| {
                s.set_reuse_port(flag)
                    .map_err(|e| Error::io("set SO_REUSEPORT failed", e))
            })
        }
        #[cfg(not(all(unix, not(target_os = "solaris"))))]
        {
            let _ = flag;
            Ok(())
        }
    }

    #[cfg(unix)]
    pub fn keep_alive(&self, flag: bool) -> Result<()> {
        self.set_option(libc::SOL_SOCKET, libc::SO_KEEPALIVE, OptionValue::Bool(flag))
    }

    pub fn no_delay(&self, flag: bool) -> Result<()> {
        self.with_socket(|s| {
            s.set_nodelay(flag)
                .map_err(|e| Error::io("set TCP_NODELAY failed", e))
        })
    }

    pub fn broadcast(&self, flag: bool) -> Result<()> {
        self.with_socket(|s| {
            s.set_broadcast(flag)
                .map_err(|e| Error::io("set SO_BROADCAST failed", e))
        })
    }

    pub fn linger(&self, duration: Option<Duration>) -> Result<()> {
        self.with_socket(|s| {
            s.set_linger(duration)
                .map_err(|e| Error::io("set SO_LINGER failed", e))
        })
    }

    pub fn send_buffer_size(&self, size: usize) -> Result<()> {
        self.with_socket(|s| {
            s.set_send_buffer_size(size)
                .map_err(|e| Error::io("set SO_SNDBUF failed", e))
        })
    }

    pub fn recv_buffer_size(&self, size: usize) -> Result<()> {
        self.with_socket(|s| {
            s.set_recv_buffer_size(size)
                .map_err(|e| Error::io("set SO_RCVBUF failed", e))
        })
    }

    pub fn send_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.with_socket(|s| {
            s.set_write_timeout(timeout)
                .map_err(|e| Error::io("set SO_SNDTIMEO failed", e))
        })?;
        self.inner.write().unwrap().send_timeout = timeout;
        Ok(())
    }

    pub fn recv_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.with_socket(|s| {
            s.set_read_timeout(timeout)
                .map_err(|e| Error::io("set SO_RCVTIMEO failed", e))
        })?;
        self.inner.write().unwrap().recv_timeout = timeout;
        Ok(())
    }

    pub fn configured_recv_timeout(&self) -> Option<Duration> {
        self.inner.read().unwrap().recv_timeout
    }

    pub fn configured_send_timeout(&self) -> Option<Duration> {
        self.inner.read().unwrap().send_timeout
    }

    pub fn family(&self) -> Option<Family> {
        self.inner.read().unwrap().family
    }

    pub fn kind(&self) -> Option<SockKind> {
        self.inner.read().unwrap().kind
    }

    #[cfg(unix)]
    pub fn as_raw_fd(&self) -> Result<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        self.with_socket(|s| Ok(s.as_raw_fd()))
    }

    /// Gives ownership of the join/leave-group and multicast knobs to
    /// callers that hold the raw socket2 handle (used by `udp::UdpSocket`).
    pub(crate) fn with_raw<T>(&self, f: impl FnOnce(&Socket) -> Result<T>) -> Result<T> {
        self.with_socket(f)
    }

    pub(crate) fn replace(&self, socket: Socket, family: Family, kind: SockKind, connected: bool) {
        let mut g = self.inner.write().unwrap();
        g.socket = Some(socket);
        g.family = Some(family);
        g.kind = Some(kind);
        g.connected = connected;
    }
}

impl Default for SocketCore {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_to_poll_millis(d: Duration) -> i32 {
    if d.is_zero() {
        return 0;
    }
    d.as_millis().min(i32::MAX as u128) as i32
}

fn is_in_progress(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == libc_would_block_code() || code == libc_in_progress_code()
    ) || e.kind() == std::io::ErrorKind::WouldBlock
}

fn is_already_connected(e: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(libc::EISCONN)
    }
    #[cfg(not(unix))]
    {
        let _ = e;
        false
    }
}

#[cfg(unix)]
fn libc_would_block_code() -> i32 {
    libc::EWOULDBLOCK
}
#[cfg(unix)]
fn libc_in_progress_code() -> i32 {
    libc::EINPROGRESS
}
#[cfg(not(unix))]
fn libc_would_block_code() -> i32 {
    0
}
#[cfg(not(unix))]
fn libc_in_progress_code() -> i32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_socket_rejects_io() {
        let core = SocketCore::new();
        assert!(core.is_closed());
        assert!(matches!(core.send(b"x"), Err(Error::Logic(_))));
    }

    #[test]
    fn double_init_is_logic_error() {
        let core = SocketCore::new();
        core.init(Family::V4, SockKind::Dgram).unwrap();
        assert!(matches!(
            core.init(Family::V4, SockKind::Dgram),
            Err(Error::Logic(_))
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let core = SocketCore::new();
        core.init(Family::V4, SockKind::Dgram).unwrap();
        core.close();
        core.close();
        assert!(core.is_closed());
    }

    #[test]
    fn poll_mode_bits() {
        let mode = PollMode::READ | PollMode::ERROR;
        assert!(mode.contains(PollMode::READ));
        assert!(!mode.contains(PollMode::WRITE));
        assert_eq!(mode.bits(), 0b101);
    }
}
