use super::{Backend, PollEvent, RawFd};
use crate::error::{Error, Result};
use crate::socket::PollMode;
use std::collections::HashMap;
use std::time::Duration;

pub struct EpollBackend {
    epfd: RawFd,
    registered: HashMap<RawFd, PollMode>,
}

impl EpollBackend {
    pub fn new() -> Self {
        let epfd = unsafe { libc::epoll_create1(0) };
        assert!(epfd >= 0, "epoll_create1 failed: {}", std::io::Error::last_os_error());
        EpollBackend {
            epfd,
            registered: HashMap::new(),
        }
    }

    fn ctl(&self, op: i32, fd: RawFd, mode: PollMode) -> Result<()> {
        let mut event = libc::epoll_event {
            events: to_epoll_events(mode),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc != 0 {
            return Err(Error::io("epoll_ctl() failed", std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

fn to_epoll_events(mode: PollMode) -> u32 {
    let mut bits = 0u32;
    if mode.intersects(PollMode::READ) {
        bits |= libc::EPOLLIN as u32;
    }
    if mode.intersects(PollMode::WRITE) {
        bits |= libc::EPOLLOUT as u32;
    }
    if mode.intersects(PollMode::ERROR) {
        bits |= libc::EPOLLERR as u32;
    }
    bits
}

fn from_epoll_events(bits: u32) -> PollMode {
    let mut mode = PollMode::NONE;
    if bits & (libc::EPOLLIN as u32) != 0 {
        mode |= PollMode::READ;
    }
    if bits & (libc::EPOLLOUT as u32) != 0 {
        mode |= PollMode::WRITE;
    }
    if bits & ((libc::EPOLLERR | libc::EPOLLHUP) as u32) != 0 {
        mode |= PollMode::ERROR;
    }
    mode
}

impl Backend for EpollBackend {
    fn add(&mut self, fd: RawFd, mode: PollMode) -> Result<()> {
        if self.registered.contains_key(&fd) {
            return Err(Error::Logic("file descriptor is already registered"));
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, mode)?;
        self.registered.insert(fd, mode);
        Ok(())
    }

    fn update(&mut self, fd: RawFd, mode: PollMode) -> Result<()> {
        if !self.registered.contains_key(&fd) {
            return Err(Error::Logic("file descriptor is not registered"));
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, mode)?;
        self.registered.insert(fd, mode);
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        if self.registered.remove(&fd).is_none() {
            return Err(Error::Logic("file descriptor is not registered"));
        }
        let mut dummy = libc::epoll_event { events: 0, u64: 0 };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut dummy) };
        if rc != 0 {
            return Err(Error::io("epoll_ctl(DEL) failed", std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn has(&self, fd: RawFd) -> bool {
        self.registered.contains_key(&fd)
    }

    fn get_mode(&self, fd: RawFd) -> Option<PollMode> {
        self.registered.get(&fd).copied()
    }

    fn clear(&mut self) {
        for fd in self.registered.keys().copied().collect::<Vec<_>>() {
            let mut dummy = libc::epoll_event { events: 0, u64: 0 };
            unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut dummy) };
        }
        self.registered.clear();
    }

    fn size(&self) -> usize {
        self.registered.len()
    }

    fn poll(&mut self, timeout: Duration, out: &mut Vec<PollEvent>) -> Result<usize> {
        let mut raw = vec![libc::epoll_event { events: 0, u64: 0 }; self.registered.len().max(1)];
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        let rc = unsafe { libc::epoll_wait(self.epfd, raw.as_mut_ptr(), raw.len() as i32, millis) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(Error::io("epoll_wait() failed", err));
        }
        for ev in &raw[..rc as usize] {
            out.push(PollEvent {
                fd: ev.u64 as RawFd,
                mode: from_epoll_events(ev.events),
            });
        }
        Ok(rc as usize)
    }

    fn name(&self) -> &'static str {
        "epoll"
    }

    fn scales_with_fds(&self) -> bool {
        false
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}
