use super::{Backend, PollEvent, RawFd};
use crate::error::{Error, Result};
use crate::socket::PollMode;
use std::collections::HashMap;
use std::time::Duration;

pub struct KqueueBackend {
    kq: RawFd,
    registered: HashMap<RawFd, PollMode>,
}

impl KqueueBackend {
    pub fn new() -> Self {
        let kq = unsafe { libc::kqueue() };
        assert!(kq >= 0, "kqueue() failed: {}", std::io::Error::last_os_error());
        KqueueBackend {
            kq,
            registered: HashMap::new(),
        }
    }

    fn apply(&self, changes: &mut [libc::kevent]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let rc = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as i32,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            return Err(Error::io("kevent() register failed", std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

fn kevent_change(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
    libc::kevent {
        ident: fd as usize,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}

/// Diffs `old` against `new` and returns the `EVFILT_READ`/`EVFILT_WRITE`
/// add/delete changes needed to move the kernel's registration from one to
/// the other. `ERROR` has no dedicated kqueue filter; read/write
/// registrations already surface `EV_EOF`/`EV_ERROR` on their own.
fn diff_changes(fd: RawFd, old: PollMode, new: PollMode) -> Vec<libc::kevent> {
    let mut changes = Vec::with_capacity(2);
    let wants_read = new.intersects(PollMode::READ);
    let had_read = old.intersects(PollMode::READ);
    if wants_read && !had_read {
        changes.push(kevent_change(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ENABLE));
    } else if !wants_read && had_read {
        changes.push(kevent_change(fd, libc::EVFILT_READ, libc::EV_DELETE));
    }

    let wants_write = new.intersects(PollMode::WRITE);
    let had_write = old.intersects(PollMode::WRITE);
    if wants_write && !had_write {
        changes.push(kevent_change(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_ENABLE));
    } else if !wants_write && had_write {
        changes.push(kevent_change(fd, libc::EVFILT_WRITE, libc::EV_DELETE));
    }
    changes
}

impl Backend for KqueueBackend {
    fn add(&mut self, fd: RawFd, mode: PollMode) -> Result<()> {
        if self.registered.contains_key(&fd) {
            return Err(Error::Logic("file descriptor is already registered"));
        }
        let mut changes = diff_changes(fd, PollMode::NONE, mode);
        self.apply(&mut changes)?;
        self.registered.insert(fd, mode);
        Ok(())
    }

    fn update(&mut self, fd: RawFd, mode: PollMode) -> Result<()> {
        let old = *self
            .registered
            .get(&fd)
            .ok_or(Error::Logic("file descriptor is not registered"))?;
        let mut changes = diff_changes(fd, old, mode);
        self.apply(&mut changes)?;
        self.registered.insert(fd, mode);
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        let old = self
            .registered
            .remove(&fd)
            .ok_or(Error::Logic("file descriptor is not registered"))?;
        let mut changes = diff_changes(fd, old, PollMode::NONE);
        self.apply(&mut changes)
    }

    fn has(&self, fd: RawFd) -> bool {
        self.registered.contains_key(&fd)
    }

    fn get_mode(&self, fd: RawFd) -> Option<PollMode> {
        self.registered.get(&fd).copied()
    }

    fn clear(&mut self) {
        for (fd, mode) in self.registered.clone() {
            let mut changes = diff_changes(fd, mode, PollMode::NONE);
            let _ = self.apply(&mut changes);
        }
        self.registered.clear();
    }

    fn size(&self) -> usize {
        self.registered.len()
    }

    fn poll(&mut self, timeout: Duration, out: &mut Vec<PollEvent>) -> Result<usize> {
        let mut raw = vec![kevent_change(0, 0, 0); self.registered.len().max(1)];
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let rc = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                raw.as_mut_ptr(),
                raw.len() as i32,
                &ts,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(Error::io("kevent() poll failed", err));
        }

        let mut merged: HashMap<RawFd, PollMode> = HashMap::new();
        for ev in &raw[..rc as usize] {
            let fd = ev.ident as RawFd;
            let mut mode = match ev.filter {
                libc::EVFILT_READ => PollMode::READ,
                libc::EVFILT_WRITE => PollMode::WRITE,
                _ => PollMode::NONE,
            };
            if ev.flags & libc::EV_EOF != 0 {
                mode |= PollMode::ERROR;
            }
            *merged.entry(fd).or_insert(PollMode::NONE) |= mode;
        }
        let n = merged.len();
        out.extend(merged.into_iter().map(|(fd, mode)| PollEvent { fd, mode }));
        Ok(n)
    }

    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn scales_with_fds(&self) -> bool {
        false
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}
