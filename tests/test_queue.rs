use proptest::prelude::*;
use reservoir::{OverflowPolicy, Queue, QueueError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_bounded_close_drain_scenario() {
    let queue = Queue::bounded("scenario", 5, OverflowPolicy::Block);
    let producer = queue.producer().unwrap();
    producer.put("a").unwrap();
    producer.put("b").unwrap();
    producer.put("c").unwrap();
    assert_eq!(queue.len(), 3);

    assert_eq!(queue.get().unwrap(), "a");
    assert_eq!(queue.len(), 2);

    producer.close();
    assert_eq!(producer.put("d"), Err(QueueError::Closed("scenario".into())));
    assert_eq!(queue.len(), 2);

    assert_eq!(queue.get().unwrap(), "b");
    assert_eq!(queue.get().unwrap(), "c");
    assert_eq!(queue.get(), Err(QueueError::Drained("scenario".into())));
    assert_eq!(queue.len(), 0);
}

#[test]
fn test_close_is_idempotent() {
    let queue: Queue<u8> = Queue::unbounded("q");
    let producer = queue.producer().unwrap();
    assert!(!queue.is_closed());
    producer.close();
    assert!(queue.is_closed());
    producer.close();
    assert!(queue.is_closed());
    drop(producer);
    assert!(queue.is_closed());
}

#[test]
fn test_drained_repeats_without_hanging() {
    let queue = Queue::unbounded("q");
    let producer = queue.producer().unwrap();
    for i in 0..3 {
        producer.put(i).unwrap();
    }
    drop(producer);
    assert_eq!(queue.get().unwrap(), 0);
    assert_eq!(queue.get().unwrap(), 1);
    assert_eq!(queue.get().unwrap(), 2);
    for _ in 0..5 {
        assert!(queue.get().unwrap_err().is_drained());
        assert!(queue.try_get().unwrap_err().is_drained());
        assert!(queue
            .get_timeout(Duration::from_secs(5))
            .unwrap_err()
            .is_drained());
    }
}

#[test]
fn test_unbounded_cap_is_invariant() {
    let queue = Queue::unbounded("q");
    let producer = queue.producer().unwrap();
    assert_eq!(queue.cap(), -1);
    for i in 0..1000 {
        producer.put(i).unwrap();
        assert_eq!(queue.cap(), -1);
    }
    while queue.try_get().unwrap().is_some() {}
    assert_eq!(queue.cap(), -1);
}

#[test]
fn test_clear_keeps_cap_and_closed() {
    let queue = Queue::bounded("q", 8, OverflowPolicy::Reject);
    let producer = queue.producer().unwrap();
    for i in 0..6 {
        producer.put(i).unwrap();
    }
    assert_eq!(queue.clear(), 6);
    assert_eq!(queue.len(), 0);
    assert_eq!(queue.cap(), 8);
    assert!(!queue.is_closed());

    producer.put(1).unwrap();
    drop(producer);
    queue.clear();
    assert_eq!(queue.len(), 0);
    assert!(queue.is_closed());
    assert!(queue.get().unwrap_err().is_drained());
}

#[test]
fn test_clear_leaves_blocked_getter_waiting_for_next_put() {
    let queue = Queue::unbounded("q");
    let producer = queue.producer().unwrap();
    let getter = queue.consumer();
    let handle = thread::spawn(move || getter.get());

    thread::sleep(Duration::from_millis(20));
    queue.clear();
    thread::sleep(Duration::from_millis(20));
    assert!(!handle.is_finished());

    producer.put(7).unwrap();
    assert_eq!(handle.join().unwrap(), Ok(7));
}

#[test]
fn test_concurrent_stats_integrity() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 2_000;

    let queue = Queue::bounded("q", 64, OverflowPolicy::Block);
    let producer = Arc::new(queue.producer().unwrap());
    let stop = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let producer = Arc::clone(&producer);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    producer.put(p * PER_PRODUCER + i).unwrap();
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let consumer = queue.consumer();
            thread::spawn(move || {
                let mut got = 0u64;
                while consumer.get().is_ok() {
                    got += 1;
                }
                got
            })
        })
        .collect();

    let clearer = {
        let queue = queue.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                queue.clear_stats();
                let stats = queue.stats();
                assert!(stats.put <= PRODUCERS * PER_PRODUCER);
                assert!(stats.got <= PRODUCERS * PER_PRODUCER);
                assert!(stats.depth <= 64);
                thread::yield_now();
            }
        })
    };

    for writer in writers {
        writer.join().unwrap();
    }
    drop(producer);
    assert!(queue.is_closed());
    let total: u64 = consumers.into_iter().map(|c| c.join().unwrap()).sum();
    stop.store(true, Ordering::Relaxed);
    clearer.join().unwrap();

    assert_eq!(total, PRODUCERS * PER_PRODUCER);

    queue.clear_stats();
    let stats = queue.stats();
    assert_eq!(stats.put, 0);
    assert_eq!(stats.got, 0);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.rejected, 0);
    assert_eq!(stats.depth, 0);
}

#[test]
fn test_multi_consumer_sees_each_item_once() {
    let queue = Queue::unbounded("q");
    let producer = queue.producer().unwrap();
    for i in 0..500u32 {
        producer.put(i).unwrap();
    }
    drop(producer);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let consumer = queue.consumer();
            thread::spawn(move || {
                let mut seen = Vec::new();
                while let Ok(item) = consumer.get() {
                    seen.push(item);
                }
                seen
            })
        })
        .collect();

    let mut all: Vec<u32> = workers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .collect();
    all.sort_unstable();
    assert_eq!(all, (0..500u32).collect::<Vec<_>>());
}

proptest! {
    #[test]
    fn prop_fifo_single_producer_single_consumer(items in proptest::collection::vec(any::<i64>(), 0..200)) {
        let queue = Queue::bounded("fifo", 16, OverflowPolicy::Block);
        let producer = queue.producer().unwrap();
        let consumer = queue.consumer();

        let expected = items.clone();
        let writer = thread::spawn(move || {
            for item in items {
                producer.put(item).unwrap();
            }
            // Dropping the producer closes the queue.
        });

        let mut received = Vec::new();
        while let Ok(item) = consumer.get() {
            received.push(item);
        }
        writer.join().unwrap();
        prop_assert_eq!(received, expected);
    }
}
