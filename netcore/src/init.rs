//! Process-wide platform initialization.
//!
//! Unix sockets need no per-process setup, but callers that want to write
//! code portable to platforms that do (Winsock's `WSAStartup`/`WSACleanup`)
//! can route through here: a reference-counted, idempotent init/teardown
//! pair rather than a raw one-shot call, so nested libraries each calling
//! `init`/`shutdown` don't tear the stack down out from under each other.

use std::sync::atomic::{AtomicUsize, Ordering};

static REFCOUNT: AtomicUsize = AtomicUsize::new(0);

/// Marks one more user of the networking stack. Call once per subsystem
/// that needs it; pair with [`shutdown`].
pub fn init() {
    let previous = REFCOUNT.fetch_add(1, Ordering::AcqRel);
    if previous == 0 {
        #[cfg(feature = "tracing")]
        tracing::debug!("netcore platform stack initialized");
        platform_init();
    }
}

/// Releases one reference taken by [`init`]. The platform stack is only
/// torn down once the count reaches zero; calling this more times than
/// `init` was called is a no-op past zero rather than underflowing.
pub fn shutdown() {
    let previous = REFCOUNT.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
        if n == 0 {
            None
        } else {
            Some(n - 1)
        }
    });
    if previous == Ok(1) {
        #[cfg(feature = "tracing")]
        tracing::debug!("netcore platform stack torn down");
        platform_shutdown();
    }
}

/// Number of outstanding `init` calls not yet matched by `shutdown`.
pub fn ref_count() -> usize {
    REFCOUNT.load(Ordering::Acquire)
}

#[cfg(unix)]
fn platform_init() {}
#[cfg(unix)]
fn platform_shutdown() {}

#[cfg(not(unix))]
fn platform_init() {}
#[cfg(not(unix))]
fn platform_shutdown() {}

#[cfg(test)]
mod tests {
    // Both cases share the crate-wide `REFCOUNT` static, so they run as one
    // test rather than two independent `#[test]` functions that `cargo
    // test`'s default parallelism could interleave.
    use super::*;

    #[test]
    fn refcounted_init_and_shutdown() {
        assert_eq!(ref_count(), 0);
        init();
        init();
        assert_eq!(ref_count(), 2);
        shutdown();
        assert_eq!(ref_count(), 1);
        shutdown();
        assert_eq!(ref_count(), 0);

        // Shutdown past zero does not underflow.
        shutdown();
        assert_eq!(ref_count(), 0);
    }
}
