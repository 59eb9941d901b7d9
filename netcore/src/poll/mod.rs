//! Multi-descriptor readiness multiplexer behind one interface, backed by
//! whichever native facility the target platform offers: `epoll` on Linux,
//! `kqueue` on the BSDs and macOS, `select(2)` on other unix targets, and a
//! backend that reports `Unsupported` everywhere else so the crate still
//! builds and loads off the unix family.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(all(
    unix,
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))
))]
mod select;
#[cfg(not(unix))]
mod unsupported;

use crate::error::Result;
use crate::socket::PollMode;
use std::sync::Mutex;
use std::time::Duration;

#[cfg(unix)]
pub type RawFd = std::os::unix::io::RawFd;
#[cfg(not(unix))]
pub type RawFd = i32;

/// One readiness notification returned from [`PollSet::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub fd: RawFd,
    pub mode: PollMode,
}

/// The operations every backend implements. `has`/`get_mode`/`size` are
/// served from the backend's own registration bookkeeping rather than
/// re-querying the kernel, since `epoll`/`kqueue` don't expose a "list what's
/// registered" call.
trait Backend: Send {
    fn add(&mut self, fd: RawFd, mode: PollMode) -> Result<()>;
    fn update(&mut self, fd: RawFd, mode: PollMode) -> Result<()>;
    fn remove(&mut self, fd: RawFd) -> Result<()>;
    fn has(&self, fd: RawFd) -> bool;
    fn get_mode(&self, fd: RawFd) -> Option<PollMode>;
    fn clear(&mut self);
    fn size(&self) -> usize;
    fn poll(&mut self, timeout: Duration, out: &mut Vec<PollEvent>) -> Result<usize>;
    fn name(&self) -> &'static str;
    fn scales_with_fds(&self) -> bool;
}

fn new_backend() -> Box<dyn Backend> {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            Box::new(epoll::EpollBackend::new())
        } else if #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))] {
            Box::new(kqueue::KqueueBackend::new())
        } else if #[cfg(unix)] {
            Box::new(select::SelectBackend::new())
        } else {
            Box::new(unsupported::UnsupportedBackend::new())
        }
    }
}

struct State {
    backend: Box<dyn Backend>,
    last_events: Vec<PollEvent>,
}

/// A registered set of file descriptors and the readiness conditions each is
/// watched for. One `poll` call reports on every registered descriptor at
/// once; the result of the most recent call stays available through
/// [`PollSet::events`] until the next `poll` or an explicit
/// [`PollSet::clear_events`].
pub struct PollSet {
    state: Mutex<State>,
}

impl PollSet {
    pub fn new() -> Self {
        PollSet {
            state: Mutex::new(State {
                backend: new_backend(),
                last_events: Vec::new(),
            }),
        }
    }

    pub fn add(&self, fd: RawFd, mode: PollMode) -> Result<()> {
        self.state.lock().unwrap().backend.add(fd, mode)
    }

    pub fn update(&self, fd: RawFd, mode: PollMode) -> Result<()> {
        self.state.lock().unwrap().backend.update(fd, mode)
    }

    pub fn remove(&self, fd: RawFd) -> Result<()> {
        self.state.lock().unwrap().backend.remove(fd)
    }

    pub fn has(&self, fd: RawFd) -> bool {
        self.state.lock().unwrap().backend.has(fd)
    }

    pub fn get_mode(&self, fd: RawFd) -> Option<PollMode> {
        self.state.lock().unwrap().backend.get_mode(fd)
    }

    pub fn clear(&self) {
        let mut g = self.state.lock().unwrap();
        g.backend.clear();
        g.last_events.clear();
    }

    pub fn size(&self) -> usize {
        self.state.lock().unwrap().backend.size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Waits up to `timeout` for readiness on any registered descriptor.
    /// Returns the number of ready descriptors; the events themselves are
    /// retrieved with [`PollSet::events`].
    pub fn poll(&self, timeout: Duration) -> Result<usize> {
        let mut g = self.state.lock().unwrap();
        let mut events = std::mem::take(&mut g.last_events);
        events.clear();
        let n = g.backend.poll(timeout, &mut events)?;
        g.last_events = events;
        Ok(n)
    }

    /// Same as `poll`, but appends directly into `events_out` instead of the
    /// set's own buffer, avoiding a clone for callers already holding a
    /// reusable `Vec`.
    pub fn poll_into(&self, events_out: &mut Vec<PollEvent>, timeout: Duration) -> Result<usize> {
        let mut g = self.state.lock().unwrap();
        events_out.clear();
        let n = g.backend.poll(timeout, events_out)?;
        g.last_events = events_out.clone();
        Ok(n)
    }

    pub fn events(&self) -> Vec<PollEvent> {
        self.state.lock().unwrap().last_events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().unwrap().last_events.clear();
    }

    /// `"epoll"`, `"kqueue"`, `"select"`, or `"unsupported"`, depending on
    /// which backend this platform compiled in.
    pub fn backend_name(&self) -> &'static str {
        self.state.lock().unwrap().backend.name()
    }

    /// `true` if a `poll` call's cost grows with the number of *registered*
    /// descriptors regardless of how many are ready (the `select(2)`
    /// fallback); `false` for `epoll`/`kqueue`, whose cost tracks the number
    /// of *ready* descriptors.
    pub fn scales_with_fds(&self) -> bool {
        self.state.lock().unwrap().backend.scales_with_fds()
    }
}

impl Default for PollSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn reports_writable_socketpair() {
        let (a, _b) = UnixStream::pair().unwrap();
        let set = PollSet::new();
        set.add(a.as_raw_fd(), PollMode::WRITE).unwrap();
        assert_eq!(set.size(), 1);

        let n = set.poll(Duration::from_millis(200)).unwrap();
        assert_eq!(n, 1);
        let events = set.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, a.as_raw_fd());
        assert!(events[0].mode.contains(PollMode::WRITE));
    }

    #[test]
    fn reports_readable_after_peer_writes() {
        let (a, b) = UnixStream::pair().unwrap();
        let set = PollSet::new();
        set.add(a.as_raw_fd(), PollMode::READ).unwrap();

        let n = set.poll(Duration::from_millis(50)).unwrap();
        assert_eq!(n, 0);

        use std::io::Write;
        let mut b = b;
        b.write_all(b"x").unwrap();

        let n = set.poll(Duration::from_millis(500)).unwrap();
        assert_eq!(n, 1);
        assert!(set.events()[0].mode.contains(PollMode::READ));
    }

    #[test]
    fn remove_drops_registration() {
        let (a, _b) = UnixStream::pair().unwrap();
        let set = PollSet::new();
        set.add(a.as_raw_fd(), PollMode::READ).unwrap();
        assert!(set.has(a.as_raw_fd()));
        set.remove(a.as_raw_fd()).unwrap();
        assert!(!set.has(a.as_raw_fd()));
        assert_eq!(set.size(), 0);
    }

    #[test]
    fn update_changes_watched_mode() {
        let (a, _b) = UnixStream::pair().unwrap();
        let set = PollSet::new();
        set.add(a.as_raw_fd(), PollMode::READ).unwrap();
        set.update(a.as_raw_fd(), PollMode::WRITE).unwrap();
        assert_eq!(set.get_mode(a.as_raw_fd()), Some(PollMode::WRITE));
    }
}
