use super::{Backend, PollEvent, RawFd};
use crate::error::{Error, Result};
use crate::socket::PollMode;
use std::time::Duration;

/// Stand-in used on targets outside the unix family, where none of
/// `epoll`/`kqueue`/`select` apply. `PollSet` still builds and loads here;
/// every operation that would need a real backend reports `Unsupported`
/// instead of the crate failing to compile.
pub struct UnsupportedBackend;

impl UnsupportedBackend {
    pub fn new() -> Self {
        UnsupportedBackend
    }
}

fn unsupported() -> Error {
    Error::Unsupported("no poll backend is available on this platform")
}

impl Backend for UnsupportedBackend {
    fn add(&mut self, _fd: RawFd, _mode: PollMode) -> Result<()> {
        Err(unsupported())
    }

    fn update(&mut self, _fd: RawFd, _mode: PollMode) -> Result<()> {
        Err(unsupported())
    }

    fn remove(&mut self, _fd: RawFd) -> Result<()> {
        Err(unsupported())
    }

    fn has(&self, _fd: RawFd) -> bool {
        false
    }

    fn get_mode(&self, _fd: RawFd) -> Option<PollMode> {
        None
    }

    fn clear(&mut self) {}

    fn size(&self) -> usize {
        0
    }

    fn poll(&mut self, _timeout: Duration, _out: &mut Vec<PollEvent>) -> Result<usize> {
        Err(unsupported())
    }

    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn scales_with_fds(&self) -> bool {
        false
    }
}
