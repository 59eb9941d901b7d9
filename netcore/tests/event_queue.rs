use netcore::event_queue::EventQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn many_producers_one_consumer_drains_everything_that_fits() {
    let queue = Arc::new(EventQueue::with_capacity(1024));
    let producers = 8;
    let per_producer = 100;
    let barrier = Arc::new(Barrier::new(producers));

    let handles: Vec<_> = (0..producers)
        .map(|_| {
            let queue = queue.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..per_producer {
                    queue.enqueue(|| {});
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let total = producers * per_producer;
    assert_eq!(queue.pending_count() + queue.dropped_count() as usize, total);
    let processed = queue.process_pending(None);
    assert_eq!(processed as u64 + queue.dropped_count(), total as u64);
    assert!(queue.is_empty());
}

#[test]
fn drop_newest_counts_overflow_without_blocking_producers() {
    let queue = EventQueue::with_capacity(4);
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let ran = ran.clone();
        assert!(queue.enqueue(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for _ in 0..6 {
        assert!(!queue.enqueue(|| {}));
    }
    assert_eq!(queue.dropped_count(), 6);
    assert_eq!(queue.process_pending(None), 4);
    assert_eq!(ran.load(Ordering::SeqCst), 4);
}
