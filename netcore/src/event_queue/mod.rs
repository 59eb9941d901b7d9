//! A bounded, multi-producer/single-consumer ring of type-erased closures,
//! drained by the thread that owns it.
//!
//! Each queued callable is stored inline in a fixed-size byte buffer rather
//! than boxed onto the heap: the constructor compares the callable's size
//! and alignment against the buffer at compile time and refuses to build if
//! it doesn't fit, rather than silently falling back to an allocation. This
//! keeps `enqueue` allocation-free on the hot path, at the cost of a hard
//! ceiling on how much a connected slot is allowed to capture.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

/// Default ring capacity.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Maximum size, in bytes, of a callable that can be enqueued without
/// heap-allocating. Exceeding this is a compile error at the `enqueue` call
/// site, not a runtime fallback.
pub const EVENT_SBO_SIZE: usize = 128;

/// Inline storage alignment. Large enough for anything the standard
/// allocator itself guarantees (`max_align_t`-equivalent on common
/// platforms); a capture requiring more than this is rejected at compile
/// time the same way an oversized capture is.
const SBO_ALIGN: usize = 16;

#[repr(align(16))]
struct SboStorage([MaybeUninit<u8>; EVENT_SBO_SIZE]);

impl SboStorage {
    fn uninit() -> Self {
        SboStorage([MaybeUninit::uninit(); EVENT_SBO_SIZE])
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr() as *mut u8
    }
}

/// Forces a compile-time failure, at the `enqueue` call site, when `F`
/// doesn't fit the inline buffer. Referencing the associated consts inside
/// a generic function makes them evaluate (and potentially panic) during
/// monomorphization rather than at runtime.
struct FitsSbo<F>(PhantomData<F>);

impl<F> FitsSbo<F> {
    const SIZE_OK: () = assert!(
        mem::size_of::<F>() <= EVENT_SBO_SIZE,
        "callable exceeds EVENT_SBO_SIZE; reduce what it captures or box the \
         payload and capture a pointer-sized handle instead",
    );
    const ALIGN_OK: () = assert!(
        mem::align_of::<F>() <= SBO_ALIGN,
        "callable's alignment exceeds the event queue's inline storage alignment",
    );
}

/// A single deferred call, type-erased and stored without a heap
/// allocation. `invoke` and `drop_in_place` are function pointers
/// monomorphized for the original closure type; the byte buffer is moved
/// around by ordinary Rust moves (a bitwise copy), so no move thunk is
/// needed the way a C++ equivalent would require one.
struct Job {
    storage: SboStorage,
    invoke: unsafe fn(*mut u8),
    drop_in_place: unsafe fn(*mut u8),
}

unsafe impl Send for Job {}

impl Job {
    fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let () = FitsSbo::<F>::SIZE_OK;
        let () = FitsSbo::<F>::ALIGN_OK;

        let mut storage = SboStorage::uninit();
        unsafe {
            (storage.as_mut_ptr() as *mut F).write(f);
        }

        unsafe fn invoke_impl<F: FnOnce()>(ptr: *mut u8) {
            let f = std::ptr::read(ptr as *const F);
            f();
        }
        unsafe fn drop_impl<F>(ptr: *mut u8) {
            std::ptr::drop_in_place(ptr as *mut F);
        }

        Job {
            storage,
            invoke: invoke_impl::<F>,
            drop_in_place: drop_impl::<F>,
        }
    }

    /// Consumes and runs the stored callable exactly once.
    fn call(self) {
        let mut this = mem::ManuallyDrop::new(self);
        unsafe { (this.invoke)(this.storage.as_mut_ptr()) };
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        unsafe { (self.drop_in_place)(self.storage.as_mut_ptr()) };
    }
}

/// A single-consumer, multi-producer bounded queue of deferred invocations.
///
/// The thread that constructs the queue is its owner; only that thread
/// should call [`EventQueue::process_pending`]. Any thread may `enqueue`.
pub struct EventQueue {
    owner: ThreadId,
    capacity: usize,
    inner: Mutex<VecDeque<Job>>,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` must be a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "EventQueue capacity must be a power of two");
        EventQueue {
            owner: std::thread::current().id(),
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues a no-argument callable. Returns `false` (and bumps
    /// `dropped_count`) if the queue is full; the item is discarded, never
    /// retried ("drop newest").
    ///
    /// `F` must fit in [`EVENT_SBO_SIZE`] bytes at an alignment no coarser
    /// than the queue's inline storage; a callable that doesn't fit fails
    /// to compile here rather than falling back to a heap allocation.
    pub fn enqueue<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Job::new(job);
        let mut q = self.inner.lock().unwrap();
        if q.len() >= self.capacity {
            drop(q);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            #[cfg(feature = "tracing")]
            tracing::debug!(dropped_total = self.dropped.load(Ordering::Relaxed), "event queue full, dropping item");
            return false;
        }
        q.push_back(job);
        true
    }

    /// Drains and invokes queued items in enqueue order, up to `max` items
    /// (or until empty if `max` is `None`). Must be called from the owner
    /// thread; returns the number of items processed.
    pub fn process_pending(&self, max: Option<usize>) -> usize {
        debug_assert!(
            self.is_owner_thread(),
            "EventQueue::process_pending called from a non-owner thread"
        );

        let mut processed = 0;
        loop {
            if let Some(limit) = max {
                if processed >= limit {
                    break;
                }
            }
            let job = {
                let mut q = self.inner.lock().unwrap();
                q.pop_front()
            };
            match job {
                Some(job) => {
                    job.call();
                    processed += 1;
                }
                None => break,
            }
        }
        processed
    }

    pub fn is_owner_thread(&self) -> bool {
        std::thread::current().id() == self.owner
    }

    pub fn owner_thread(&self) -> ThreadId {
        self.owner
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_count() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Arc<EventQueue>>> = const { std::cell::RefCell::new(None) };
}

/// Returns the calling thread's process-wide `EventQueue`, creating it on
/// first use.
pub fn current() -> Arc<EventQueue> {
    CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(Arc::new(EventQueue::new()));
        }
        slot.as_ref().unwrap().clone()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn drains_in_fifo_order() {
        let q = EventQueue::with_capacity(16);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            q.enqueue(move || order.lock().unwrap().push(i));
        }
        assert_eq!(q.process_pending(None), 5);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn drops_newest_when_full() {
        let q = EventQueue::with_capacity(2);
        assert!(q.enqueue(|| {}));
        assert!(q.enqueue(|| {}));
        assert!(!q.enqueue(|| {}));
        assert_eq!(q.dropped_count(), 1);
        assert_eq!(q.process_pending(None), 2);
    }

    #[test]
    fn cross_thread_enqueue_processed_by_owner() {
        let q = Arc::new(EventQueue::with_capacity(16));
        let ran = Arc::new(AtomicUsize::new(0));

        let q2 = q.clone();
        let ran2 = ran.clone();
        let handle = std::thread::spawn(move || {
            q2.enqueue(move || {
                ran2.fetch_add(7, Ordering::SeqCst);
            });
        });
        handle.join().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(q.process_pending(None), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn large_capture_within_sbo_runs_correctly() {
        let q = EventQueue::with_capacity(4);
        let buf = [7u8; 64];
        let sum = Arc::new(AtomicUsize::new(0));
        let sum2 = sum.clone();
        q.enqueue(move || {
            sum2.fetch_add(buf.iter().map(|&b| b as usize).sum(), Ordering::SeqCst);
        });
        assert_eq!(q.process_pending(None), 1);
        assert_eq!(sum.load(Ordering::SeqCst), 7 * 64);
    }

    #[test]
    fn dropping_an_unprocessed_job_runs_its_destructor() {
        let dropped = Arc::new(AtomicUsize::new(0));
        struct Bump(Arc<AtomicUsize>);
        impl Drop for Bump {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let q = EventQueue::with_capacity(4);
        let guard = Bump(dropped.clone());
        q.enqueue(move || {
            let _keep_alive = &guard;
        });
        drop(q);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }
}
