use netcore::event_queue::EventQueue;
use netcore::signal::{Priority, Signal};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

#[test]
fn automatic_delivery_runs_direct_on_owner_thread_and_queued_elsewhere() {
    let queue = Arc::new(EventQueue::new());
    let signal = Arc::new(Signal::<&'static str>::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let seen_clone = seen.clone();
    signal.connect_automatic(Priority::NORMAL, queue.clone(), move |v| {
        seen_clone.lock().unwrap().push(v);
    });

    // Emitted from the queue's own owner thread: runs immediately.
    signal.emit("direct");
    assert_eq!(*seen.lock().unwrap(), vec!["direct"]);

    // Emitted from another thread: deferred until the owner drains.
    let signal2 = signal.clone();
    thread::spawn(move || signal2.emit("queued")).join().unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["direct"]);

    queue.process_pending(None);
    assert_eq!(*seen.lock().unwrap(), vec!["direct", "queued"]);
}

#[test]
fn priority_order_spans_many_slots() {
    let signal: Signal<()> = Signal::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for (priority, label) in [
        (Priority::LOWEST, 0),
        (Priority::LOW, 1),
        (Priority::NORMAL, 2),
        (Priority::HIGH, 3),
        (Priority::HIGHEST, 4),
    ] {
        let order = order.clone();
        signal.connect(priority, move |_| order.lock().unwrap().push(label));
    }

    signal.emit(());
    assert_eq!(*order.lock().unwrap(), vec![4, 3, 2, 1, 0]);
}

#[test]
fn filtered_slot_only_fires_when_predicate_matches() {
    use netcore::signal::Delivery;

    let signal: Signal<i32> = Signal::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    signal.connect_filtered(Priority::NORMAL, Delivery::Direct, |v| *v % 2 == 0, move |_| {
        hits2.fetch_add(1, Ordering::SeqCst);
    });

    for v in 0..5 {
        signal.emit(v);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3); // 0, 2, 4
}
