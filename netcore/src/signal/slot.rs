use crate::event_queue::EventQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Where a slot's invocation runs.
#[derive(Clone)]
pub enum Delivery {
    /// Runs synchronously in the emitting thread.
    Direct,
    /// Posted to `queue`; runs on the queue's owner thread whenever it next
    /// drains. Overflow is handled by the queue's own drop-newest policy.
    Queued(Arc<EventQueue>),
    /// Direct if the emitting thread is `queue`'s owner thread, queued
    /// otherwise.
    Automatic(Arc<EventQueue>),
}

/// A registered callable plus its metadata. Type-erased over the trait
/// object below so a `Connection` can reference a slot without knowing the
/// signal's argument type.
pub(crate) trait SlotControl: Send + Sync {
    fn id(&self) -> u64;
    fn priority(&self) -> i32;
    fn is_active(&self) -> bool;
    fn is_blocked(&self) -> bool;
    fn set_active(&self, value: bool);
    fn set_blocked(&self, value: bool);
}

pub(crate) struct Slot<A> {
    pub id: u64,
    pub priority: i32,
    pub active: AtomicBool,
    pub blocked: AtomicBool,
    pub delivery: Delivery,
    pub filter: Option<Box<dyn Fn(&A) -> bool + Send + Sync>>,
    pub invoke: Box<dyn Fn(A) + Send + Sync>,
}

impl<A> SlotControl for Slot<A>
where
    A: Send + 'static,
{
    fn id(&self) -> u64 {
        self.id
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    fn set_active(&self, value: bool) {
        self.active.store(value, Ordering::Release);
    }

    fn set_blocked(&self, value: bool) {
        self.blocked.store(value, Ordering::Release);
    }
}
