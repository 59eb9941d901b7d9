use super::{Backend, PollEvent, RawFd};
use crate::error::{Error, Result};
use crate::socket::PollMode;
use std::collections::HashMap;
use std::time::Duration;

/// `select(2)`-based fallback for unix targets with neither `epoll` nor
/// `kqueue`. Unlike those two, `select` has no kernel-side registration to
/// incrementally update: every poll rebuilds the three fd sets from the
/// registration table from scratch, so cost scales with the highest
/// registered descriptor number rather than with how many are ready.
pub struct SelectBackend {
    registered: HashMap<RawFd, PollMode>,
}

impl SelectBackend {
    pub fn new() -> Self {
        SelectBackend {
            registered: HashMap::new(),
        }
    }

    fn rebuild_fd_sets(&self) -> (libc::fd_set, libc::fd_set, libc::fd_set, RawFd) {
        let mut read_fds = unsafe { std::mem::zeroed::<libc::fd_set>() };
        let mut write_fds = unsafe { std::mem::zeroed::<libc::fd_set>() };
        let mut error_fds = unsafe { std::mem::zeroed::<libc::fd_set>() };
        unsafe {
            libc::FD_ZERO(&mut read_fds);
            libc::FD_ZERO(&mut write_fds);
            libc::FD_ZERO(&mut error_fds);
        }

        let mut max_fd: RawFd = -1;
        for (&fd, &mode) in &self.registered {
            if mode.intersects(PollMode::READ) {
                unsafe { libc::FD_SET(fd, &mut read_fds) };
            }
            if mode.intersects(PollMode::WRITE) {
                unsafe { libc::FD_SET(fd, &mut write_fds) };
            }
            if mode.intersects(PollMode::ERROR) {
                unsafe { libc::FD_SET(fd, &mut error_fds) };
            }
            if fd > max_fd {
                max_fd = fd;
            }
        }
        (read_fds, write_fds, error_fds, max_fd)
    }
}

impl Backend for SelectBackend {
    fn add(&mut self, fd: RawFd, mode: PollMode) -> Result<()> {
        if self.registered.contains_key(&fd) {
            return Err(Error::Logic("file descriptor is already registered"));
        }
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            return Err(Error::Logic(
                "file descriptor exceeds FD_SETSIZE for the select() backend",
            ));
        }
        self.registered.insert(fd, mode);
        Ok(())
    }

    fn update(&mut self, fd: RawFd, mode: PollMode) -> Result<()> {
        if !self.registered.contains_key(&fd) {
            return Err(Error::Logic("file descriptor is not registered"));
        }
        self.registered.insert(fd, mode);
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        if self.registered.remove(&fd).is_none() {
            return Err(Error::Logic("file descriptor is not registered"));
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
        self.registered.clear();
    }

    fn size(&self) -> usize {
        self.registered.len()
    }

    fn poll(&mut self, timeout: Duration, out: &mut Vec<PollEvent>) -> Result<usize> {
        if self.registered.is_empty() {
            return Ok(0);
        }

        let (mut read_fds, mut write_fds, mut error_fds, max_fd) = self.rebuild_fd_sets();

        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        let rc = unsafe {
            libc::select(
                max_fd + 1,
                &mut read_fds,
                &mut write_fds,
                &mut error_fds,
                &mut tv,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(Error::io("select() failed", err));
        }

        let mut count = 0;
        for &fd in self.registered.keys() {
            let mut mode = PollMode::NONE;
            unsafe {
                if libc::FD_ISSET(fd, &read_fds) {
                    mode |= PollMode::READ;
                }
                if libc::FD_ISSET(fd, &write_fds) {
                    mode |= PollMode::WRITE;
                }
                if libc::FD_ISSET(fd, &error_fds) {
                    mode |= PollMode::ERROR;
                }
            }
            if mode != PollMode::NONE {
                out.push(PollEvent { fd, mode });
                count += 1;
            }
        }
        Ok(count)
    }

    fn name(&self) -> &'static str {
        "select"
    }

    fn scales_with_fds(&self) -> bool {
        true
    }
}
