use crate::inet::Address;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Per-packet processing logic run by a [`super::UdpServer`] worker thread.
///
/// `handle_packet` is the only method a caller must implement; the default
/// `process_packet` wraps it with validation, before/after hooks, exception
/// isolation, and counters the way the worker pool expects.
pub trait UdpHandler: Send + Sync {
    /// Caps how large a datagram this handler will accept; larger ones are
    /// dropped by `process_packet` before `handle_packet` ever sees them.
    fn max_packet_size(&self) -> usize {
        crate::udp::MAX_DATAGRAM_SIZE
    }

    /// Returns `false` to reject a packet before `handle_packet` runs, e.g.
    /// a magic-byte or minimum-length check.
    fn validate_packet(&self, _data: &[u8], _from: Address) -> bool {
        true
    }

    /// Left for implementations that want to shard work by source address
    /// across multiple handlers; `UdpServer` never calls this itself.
    fn can_handle_address(&self, _from: Address) -> bool {
        true
    }

    fn before_packet(&self, _data: &[u8], _from: Address) {}

    fn handle_packet(&self, data: &[u8], from: Address);

    fn after_packet(&self, _data: &[u8], _from: Address) {}

    fn on_exception(&self, _from: Address, _message: &str) {}
}

/// Counters a [`super::UdpServer`] maintains for the handler(s) it drives.
///
/// Tracks the same fields regardless of whether the server was built with a
/// single shared handler or a per-packet factory: in the shared case these
/// describe that one instance's lifetime; in the factory case they describe
/// the server's aggregate view across every short-lived instance it creates.
pub(crate) struct HandlerStats {
    pub received_total: AtomicU64,
    pub processed_total: AtomicU64,
    pub dropped_total: AtomicU64,
    pub exceptions_total: AtomicU64,
    pub bytes_processed: AtomicU64,
    pub creation_time: Instant,
    pub last_packet_time: Mutex<Option<Instant>>,
}

impl HandlerStats {
    pub fn new() -> Self {
        HandlerStats {
            received_total: AtomicU64::new(0),
            processed_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            exceptions_total: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            creation_time: Instant::now(),
            last_packet_time: Mutex::new(None),
        }
    }

    /// Zeroes every counter and clears `last_packet_time`, without resetting
    /// `creation_time`.
    pub fn reset(&self) {
        self.received_total.store(0, Ordering::Relaxed);
        self.processed_total.store(0, Ordering::Relaxed);
        self.dropped_total.store(0, Ordering::Relaxed);
        self.exceptions_total.store(0, Ordering::Relaxed);
        self.bytes_processed.store(0, Ordering::Relaxed);
        *self.last_packet_time.lock().unwrap() = None;
    }
}

impl Default for HandlerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `handler.handle_packet` with validation, hooks, and panic isolation,
/// updating `stats` as it goes. A handler panic is caught so one bad packet
/// can't take down the worker thread.
pub(crate) fn process_packet(handler: &dyn UdpHandler, stats: &HandlerStats, data: &[u8], from: Address) {
    stats.received_total.fetch_add(1, Ordering::Relaxed);

    if data.len() > handler.max_packet_size() || !handler.validate_packet(data, from) {
        stats.dropped_total.fetch_add(1, Ordering::Relaxed);
        return;
    }

    handler.before_packet(data, from);
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        handler.handle_packet(data, from)
    }));
    match outcome {
        Ok(()) => {
            stats.processed_total.fetch_add(1, Ordering::Relaxed);
            stats.bytes_processed.fetch_add(data.len() as u64, Ordering::Relaxed);
            *stats.last_packet_time.lock().unwrap() = Some(Instant::now());
        }
        Err(_) => {
            stats.exceptions_total.fetch_add(1, Ordering::Relaxed);
            handler.on_exception(from, "handle_packet panicked");
        }
    }
    handler.after_packet(data, from);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inet::Family;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    struct Counting(Arc<AtomicUsize>);
    impl UdpHandler for Counting {
        fn handle_packet(&self, _data: &[u8], _from: Address) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn oversized_packet_is_dropped_before_handling() {
        struct TinyHandler;
        impl UdpHandler for TinyHandler {
            fn max_packet_size(&self) -> usize {
                4
            }
            fn handle_packet(&self, _data: &[u8], _from: Address) {
                panic!("must not be called for oversized packets");
            }
        }

        let stats = HandlerStats::new();
        let from = Address::new(Family::V4, "127.0.0.1", 9).unwrap();
        process_packet(&TinyHandler, &stats, b"too long", from);
        assert_eq!(stats.dropped_total.load(Ordering::SeqCst), 1);
        assert_eq!(stats.processed_total.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_handler_is_isolated_and_counted() {
        struct Panicky;
        impl UdpHandler for Panicky {
            fn handle_packet(&self, _data: &[u8], _from: Address) {
                panic!("boom");
            }
        }
        let stats = HandlerStats::new();
        let from = Address::new(Family::V4, "127.0.0.1", 9).unwrap();
        process_packet(&Panicky, &stats, b"x", from);
        assert_eq!(stats.exceptions_total.load(Ordering::SeqCst), 1);
        assert_eq!(stats.processed_total.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn valid_packet_is_processed_and_counted() {
        let hits = Arc::new(AtomicUsize::new(0));
        let handler = Counting(hits.clone());
        let stats = HandlerStats::new();
        let from = Address::new(Family::V4, "127.0.0.1", 9).unwrap();
        process_packet(&handler, &stats, b"ping", from);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(stats.processed_total.load(Ordering::SeqCst), 1);
        assert_eq!(stats.bytes_processed.load(Ordering::SeqCst), 4);
        assert!(stats.last_packet_time.lock().unwrap().is_some());
    }

    #[test]
    fn reset_clears_counters_but_not_creation_time() {
        let hits = Arc::new(AtomicUsize::new(0));
        let handler = Counting(hits);
        let stats = HandlerStats::new();
        let from = Address::new(Family::V4, "127.0.0.1", 9).unwrap();
        process_packet(&handler, &stats, b"ping", from);
        let created = stats.creation_time;

        stats.reset();
        assert_eq!(stats.processed_total.load(Ordering::SeqCst), 0);
        assert_eq!(stats.bytes_processed.load(Ordering::SeqCst), 0);
        assert!(stats.last_packet_time.lock().unwrap().is_none());
        assert_eq!(stats.creation_time, created);
    }

    #[test]
    fn creation_time_is_in_the_past_relative_to_now() {
        let stats = HandlerStats::new();
        std::thread::sleep(Duration::from_millis(5));
        assert!(stats.creation_time.elapsed() >= Duration::from_millis(5));
    }
}
