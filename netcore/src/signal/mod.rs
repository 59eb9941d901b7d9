//! Priority-ordered, copy-on-write signal/slot dispatch with direct,
//! queued, and automatic cross-thread delivery.
//!
//! A typed emitter invokes a runtime, priority-ordered list of slots that
//! can be connected and disconnected while the program runs, rather than a
//! compile-time fixed set of listeners.

mod connection;
mod slot;

pub use connection::{Blocker, Connection, ConnectionGuard, ScopedConnection};
pub use slot::Delivery;

use crate::event_queue::EventQueue;
use slot::{Slot, SlotControl};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Priority constants. Any `i32` in `[-1000, 1000]` is valid; ties break by
/// ascending slot id.
pub struct Priority;

impl Priority {
    pub const LOWEST: i32 = -1000;
    pub const LOW: i32 = -100;
    pub const NORMAL: i32 = 0;
    pub const HIGH: i32 = 100;
    pub const HIGHEST: i32 = 1000;
}

type Filter<A> = Box<dyn Fn(&A) -> bool + Send + Sync>;

/// A typed emitter. `A` bundles the signal's argument(s) — pass `()` for a
/// no-argument signal, a single type for one argument, a tuple for several.
///
/// `A: Clone` is required so every connected slot observes its own
/// independent copy of the emitted value rather than racing over a shared
/// reference or, worse, only the first slot in priority order getting a
/// live value and the rest getting nothing. Requiring `Clone` uniformly
/// sidesteps that move-only edge case instead of reproducing it.
///
/// Construction is cheap. Signals are not `Clone`; build one per logical
/// event and share it by reference (`&Signal<A>` or inside an `Arc`), the
/// way the rest of this crate's types do.
pub struct Signal<A> {
    next_id: AtomicU64,
    mutation: Mutex<()>,
    snapshot: RwLock<Arc<Vec<Arc<Slot<A>>>>>,
}

impl<A> Signal<A>
where
    A: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Signal {
            next_id: AtomicU64::new(1),
            mutation: Mutex::new(()),
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Connects a slot for direct delivery at `priority`.
    pub fn connect(&self, priority: i32, f: impl Fn(A) + Send + Sync + 'static) -> Connection {
        self.connect_with(priority, Delivery::Direct, None, f)
    }

    /// Connects a slot whose invocations are posted to `queue` and run on
    /// the queue's owner thread.
    pub fn connect_queued(
        &self,
        priority: i32,
        queue: Arc<EventQueue>,
        f: impl Fn(A) + Send + Sync + 'static,
    ) -> Connection {
        self.connect_with(priority, Delivery::Queued(queue), None, f)
    }

    /// Connects a slot delivered directly when the emitter runs on
    /// `queue`'s owner thread, queued otherwise.
    pub fn connect_automatic(
        &self,
        priority: i32,
        queue: Arc<EventQueue>,
        f: impl Fn(A) + Send + Sync + 'static,
    ) -> Connection {
        self.connect_with(priority, Delivery::Automatic(queue), None, f)
    }

    /// Connects a slot that only runs when `filter` returns `true` for the
    /// emitted arguments.
    pub fn connect_filtered(
        &self,
        priority: i32,
        delivery: Delivery,
        filter: impl Fn(&A) -> bool + Send + Sync + 'static,
        f: impl Fn(A) + Send + Sync + 'static,
    ) -> Connection {
        self.connect_with(priority, delivery, Some(Box::new(filter)), f)
    }

    fn connect_with(
        &self,
        priority: i32,
        delivery: Delivery,
        filter: Option<Filter<A>>,
        f: impl Fn(A) + Send + Sync + 'static,
    ) -> Connection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            id,
            priority,
            active: AtomicBool::new(true),
            blocked: AtomicBool::new(false),
            delivery,
            filter,
            invoke: Box::new(f),
        });
        let control: Arc<dyn SlotControl> = slot.clone();

        let _mutation = self.mutation.lock().unwrap();
        let mut slots: Vec<Arc<Slot<A>>> = (**self.snapshot.read().unwrap()).clone();

        // Compact before adding if more than half of the existing slots are
        // dead weight.
        if !slots.is_empty() {
            let inactive = slots.iter().filter(|s| !s.is_active()).count();
            if inactive * 2 > slots.len() {
                slots.retain(|s| s.is_active());
            }
        }

        slots.push(slot);
        slots.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        *self.snapshot.write().unwrap() = Arc::new(slots);

        Connection { slot: control }
    }

    /// Forces compaction of deactivated slots right now.
    pub fn cleanup(&self) {
        let _mutation = self.mutation.lock().unwrap();
        let slots: Vec<_> = self
            .snapshot
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        *self.snapshot.write().unwrap() = Arc::new(slots);
    }

    /// Deactivates every currently-connected slot. A subsequent `emit`
    /// invokes zero slots.
    pub fn disconnect_all(&self) {
        let snapshot = self.snapshot.read().unwrap().clone();
        for slot in snapshot.iter() {
            slot.set_active(false);
        }
    }

    /// Number of slots in the current snapshot, active or not.
    pub fn slot_count(&self) -> usize {
        self.snapshot.read().unwrap().len()
    }

    /// `true` if no slot is currently connected and active. Emitting in
    /// this state is a no-op; check this before doing expensive argument
    /// construction if that matters to a caller.
    pub fn is_empty(&self) -> bool {
        self.snapshot
            .read()
            .unwrap()
            .iter()
            .all(|s| !s.is_active())
    }

    /// Broadcasts `args` to every active, unblocked slot in priority order.
    /// A no-op, and fast, when no slot is connected.
    pub fn emit(&self, args: A) {
        let snapshot = self.snapshot.read().unwrap().clone();
        if snapshot.is_empty() {
            return;
        }

        let current_thread = std::thread::current().id();

        for slot in snapshot.iter() {
            if !slot.is_active() || slot.is_blocked() {
                continue;
            }
            if let Some(filter) = &slot.filter {
                if !filter(&args) {
                    continue;
                }
            }

            match &slot.delivery {
                Delivery::Direct => (slot.invoke)(args.clone()),
                Delivery::Queued(queue) => {
                    post(slot.clone(), queue.clone(), args.clone());
                }
                Delivery::Automatic(queue) => {
                    if queue.owner_thread() == current_thread {
                        (slot.invoke)(args.clone());
                    } else {
                        post(slot.clone(), queue.clone(), args.clone());
                    }
                }
            }
        }
    }
}

fn post<A: Send + 'static>(slot: Arc<Slot<A>>, queue: Arc<EventQueue>, args: A) {
    queue.enqueue(move || {
        if slot.is_active() && !slot.is_blocked() {
            (slot.invoke)(args);
        }
    });
}

impl<A> Default for Signal<A>
where
    A: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_queue::EventQueue;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn priority_order_ties_break_by_id() {
        let signal: Signal<i32> = Signal::new();
        let buffer = Arc::new(StdMutex::new(String::new()));

        let b1 = buffer.clone();
        signal.connect(Priority::LOW, move |_| b1.lock().unwrap().push('a'));
        let b2 = buffer.clone();
        signal.connect(Priority::NORMAL, move |_| b2.lock().unwrap().push('b'));
        let b3 = buffer.clone();
        signal.connect(Priority::HIGH, move |_| b3.lock().unwrap().push('c'));

        signal.emit(42);
        assert_eq!(*buffer.lock().unwrap(), "cba");
    }

    #[test]
    fn disconnect_all_then_emit_invokes_nothing() {
        let signal: Signal<()> = Signal::new();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits2 = hits.clone();
        signal.connect(Priority::NORMAL, move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        signal.disconnect_all();
        signal.emit(());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn emit_with_no_slots_is_a_noop() {
        let signal: Signal<()> = Signal::new();
        signal.emit(()); // must not panic
    }

    #[test]
    fn blocked_slot_is_skipped() {
        let signal: Signal<()> = Signal::new();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits2 = hits.clone();
        let conn = signal.connect(Priority::NORMAL, move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        conn.block();
        signal.emit(());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        conn.unblock();
        signal.emit(());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queued_delivery_runs_on_drain() {
        let queue = Arc::new(EventQueue::with_capacity(16));
        let signal = Arc::new(Signal::<i32>::new());
        let seen = Arc::new(StdMutex::new(None));
        let seen2 = seen.clone();
        signal.connect_queued(Priority::NORMAL, queue.clone(), move |v| {
            *seen2.lock().unwrap() = Some(v);
        });

        let signal2 = signal.clone();
        let handle = std::thread::spawn(move || {
            signal2.emit(7);
        });
        handle.join().unwrap();

        assert!(seen.lock().unwrap().is_none());
        assert_eq!(queue.process_pending(None), 1);
        assert_eq!(*seen.lock().unwrap(), Some(7));
    }

    #[test]
    fn compaction_drops_disconnected_slots_once_majority_inactive() {
        let signal: Signal<()> = Signal::new();
        let mut conns = Vec::new();
        for _ in 0..4 {
            conns.push(signal.connect(Priority::NORMAL, |_| {}));
        }
        for c in &conns[..3] {
            c.disconnect();
        }
        assert_eq!(signal.slot_count(), 4);
        // adding one more slot crosses the 50% inactive threshold and
        // triggers compaction of the existing list before the new slot is
        // appended.
        signal.connect(Priority::NORMAL, |_| {});
        assert_eq!(signal.slot_count(), 2);
    }
}
