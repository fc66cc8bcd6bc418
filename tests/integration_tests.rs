//! Integration tests for poolq.
//!
//! Run with: `cargo test --test integration_tests`
//!
//! These exercise the pool end to end: in-order delivery under
//! adversarial job durations, admission backpressure, flush barriers,
//! shutdown draining, detach/attach, and teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use poolq::{DispatchError, FlushError, Pool, Queue};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_hundred_jobs_delivered_in_order() {
    let pool = Pool::new(4).unwrap();
    let queue: Arc<Queue<u64>> = Arc::new(Queue::new(&pool, 16));

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut results = Vec::with_capacity(100);
            for _ in 0..100 {
                results.push(queue.next_result_wait().expect("one result per job"));
            }
            results
        })
    };

    for i in 0..100u64 {
        queue.dispatch(move || i + 1).unwrap();
    }

    let results = consumer.join().unwrap();
    for (i, r) in results.iter().enumerate() {
        assert_eq!(r.serial(), i as u64);
        assert_eq!(*r.payload(), i as u64 + 1);
    }
}

/// Jobs that finish in reverse wall-clock order must still be delivered
/// in dispatch order.
#[test]
fn test_reverse_completion_order_is_reordered() {
    let pool = Pool::new(2).unwrap();
    let queue: Arc<Queue<usize>> = Arc::new(Queue::new(&pool, 4));

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            (0..10).map(|_| queue.next_result_wait().unwrap()).collect::<Vec<_>>()
        })
    };

    for i in 0..10usize {
        queue
            .dispatch(move || {
                thread::sleep(Duration::from_millis(10 * (10 - i as u64)));
                i
            })
            .unwrap();
    }

    let results = consumer.join().unwrap();
    for (i, r) in results.iter().enumerate() {
        assert_eq!(r.serial(), i as u64);
        assert_eq!(*r.payload(), i);
    }
}

#[test]
fn test_round_robin_across_queues_preserves_per_queue_order() {
    let pool = Pool::new(8).unwrap();
    let queues: Vec<Arc<Queue<usize>>> =
        (0..3).map(|_| Arc::new(Queue::new(&pool, 8))).collect();

    let consumers: Vec<_> = queues
        .iter()
        .enumerate()
        .map(|(qi, queue)| {
            let queue = Arc::clone(queue);
            let expected = (qi..50).step_by(3).count();
            thread::spawn(move || {
                (0..expected).map(|_| queue.next_result_wait().unwrap()).collect::<Vec<_>>()
            })
        })
        .collect();

    for i in 0..50usize {
        let queue = &queues[i % 3];
        queue.dispatch(move || i * 7).unwrap();
        assert!(queue.size() <= 8, "admission bound violated");
    }

    for (qi, consumer) in consumers.into_iter().enumerate() {
        let seen = consumer.join().unwrap();
        for (k, r) in seen.iter().enumerate() {
            assert_eq!(r.serial(), k as u64);
            assert_eq!(*r.payload(), (qi + 3 * k) * 7);
        }
    }
}

/// Completed-but-undrained results count against capacity, so the third
/// nonblocking dispatch must fail no matter how fast the workers are.
#[test]
fn test_try_dispatch_observes_capacity() {
    let pool = Pool::new(2).unwrap();
    let queue: Queue<u32> = Queue::new(&pool, 2);

    queue.try_dispatch(|| 0).unwrap();
    queue.try_dispatch(|| 1).unwrap();
    let err = queue.try_dispatch(|| 2).unwrap_err();
    assert!(err.is_full());

    assert_eq!(queue.next_result_wait().unwrap().into_inner(), 0);
    assert_eq!(queue.next_result_wait().unwrap().into_inner(), 1);
    queue.try_dispatch(err.into_job()).unwrap();
    assert_eq!(queue.next_result_wait().unwrap().into_inner(), 2);
}

#[test]
fn test_discarding_queue_flush_counts_all_side_effects() {
    let pool = Pool::new(4).unwrap();
    let queue: Queue<()> = Queue::new_discarding(&pool, 16);
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..1000 {
        let counter = Arc::clone(&counter);
        queue
            .dispatch(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
    }
    queue.flush().unwrap();

    assert_eq!(counter.load(Ordering::Relaxed), 1000);
    assert!(queue.is_empty());
}

#[test]
fn test_shutdown_stops_admission_and_drains_in_flight() {
    init_logs();
    let pool = Pool::new(4).unwrap();
    let queue: Arc<Queue<usize>> = Arc::new(Queue::new(&pool, 16));

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut drained = Vec::new();
            while let Some(r) = queue.next_result_wait() {
                drained.push(r);
            }
            drained
        })
    };

    for i in 0..20usize {
        queue
            .dispatch(move || {
                thread::sleep(Duration::from_millis(25));
                i
            })
            .unwrap();
    }
    queue.shutdown();

    assert_eq!(queue.dispatch(|| 99), Err(DispatchError::ShutDown));
    assert!(queue.try_dispatch(|| 99).unwrap_err().is_shut_down());
    queue.shutdown(); // idempotent

    let drained = consumer.join().unwrap();
    assert_eq!(drained.len(), 20, "every admitted job is delivered");
    for (i, r) in drained.iter().enumerate() {
        assert_eq!(r.serial(), i as u64);
        assert_eq!(*r.payload(), i);
    }
}

/// The serial gate's trickiest case: many workers holding
/// non-consecutive serials on one broadcast condvar. Randomized short
/// jobs keep several workers parked on the gate at once.
#[test]
fn test_serial_gate_under_randomized_load() {
    use rand::Rng;

    init_logs();
    const JOBS: usize = 2000;
    let pool = Pool::new(8).unwrap();
    let queue: Arc<Queue<usize>> = Arc::new(Queue::new(&pool, 32));

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            for k in 0..JOBS {
                let r = queue.next_result_wait().unwrap();
                assert_eq!(r.serial(), k as u64, "delivery order has a gap or swap");
                assert_eq!(*r.payload(), k ^ 0x5a5a);
            }
            assert!(queue.next_result().is_none());
        })
    };

    let mut rng = rand::rng();
    for i in 0..JOBS {
        let pause = rng.random_range(0..100u64);
        queue
            .dispatch(move || {
                if pause > 50 {
                    thread::sleep(Duration::from_micros(pause));
                }
                i ^ 0x5a5a
            })
            .unwrap();
    }

    consumer.join().unwrap();
}

#[test]
fn test_flush_is_a_completion_barrier() {
    let pool = Pool::new(4).unwrap();
    let queue: Queue<usize> = Queue::new(&pool, 64);

    for i in 0..30usize {
        queue
            .dispatch(move || {
                thread::sleep(Duration::from_millis(5));
                i
            })
            .unwrap();
    }
    queue.flush().unwrap();

    // Nothing queued or processing: every job's result is already out.
    assert_eq!(queue.len(), 30);
    assert_eq!(queue.size(), 30);
    for i in 0..30u64 {
        assert_eq!(queue.next_result().unwrap().serial(), i);
    }
    assert!(queue.is_empty());
}

#[test]
fn test_detached_queue_pauses_until_reattach() {
    let pool = Pool::new(2).unwrap();
    let queue: Queue<usize> = Queue::new(&pool, 8);

    queue.detach();
    for i in 0..5usize {
        queue.dispatch(move || i).unwrap();
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(queue.len(), 0, "no worker may serve a detached queue");
    assert_eq!(queue.size(), 5);

    queue.attach();
    for i in 0..5usize {
        assert_eq!(queue.next_result_wait().unwrap().into_inner(), i);
    }
    assert!(queue.is_empty());
}

/// Detaching while a job is mid-execution: the worker's deposit still
/// finds the queue valid, so the in-flight result surfaces normally,
/// while jobs queued behind it stay unselected until reattach.
#[test]
fn test_detach_with_job_in_flight_still_delivers_result() {
    let pool = Pool::new(2).unwrap();
    let queue: Queue<u32> = Queue::new(&pool, 8);
    let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);

    queue
        .dispatch(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            11
        })
        .unwrap();

    started_rx.recv().unwrap(); // the job is now mid-execution
    queue.detach();
    queue.dispatch(|| 22).unwrap();

    release_tx.send(()).unwrap();
    let r = queue.next_result_wait().expect("in-flight job completes on a detached queue");
    assert_eq!(r.serial(), 0);
    assert_eq!(*r.payload(), 11);

    // The job dispatched after the detach must not have been selected.
    assert!(queue.next_result().is_none());
    assert_eq!(queue.size(), 1);

    queue.attach();
    assert_eq!(queue.next_result_wait().unwrap().into_inner(), 22);
}

#[test]
fn test_heterogeneous_queues_share_one_pool() {
    let pool = Pool::new(4).unwrap();
    let numbers: Queue<u64> = Queue::new(&pool, 8);
    let words: Queue<String> = Queue::new(&pool, 8);

    numbers.dispatch(|| 6 * 7).unwrap();
    words.dispatch(|| "fortytwo".to_uppercase()).unwrap();

    assert_eq!(numbers.next_result_wait().unwrap().into_inner(), 42);
    assert_eq!(words.next_result_wait().unwrap().into_inner(), "FORTYTWO");
}

#[test]
fn test_pool_join_releases_blocked_consumer() {
    let pool = Pool::new(2).unwrap();
    let queue: Arc<Queue<u8>> = Arc::new(Queue::new(&pool, 4));

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.next_result_wait())
    };

    thread::sleep(Duration::from_millis(30));
    pool.join();
    assert!(consumer.join().unwrap().is_none());
}

/// Kill tears the pool down without draining; what already completed (or
/// was in flight) comes out as a contiguous prefix, the rest is dropped.
#[test]
fn test_kill_discards_queued_jobs_but_delivers_a_prefix() {
    let pool = Pool::new(2).unwrap();
    let queue: Arc<Queue<usize>> = Arc::new(Queue::new(&pool, 32));

    for i in 0..30usize {
        queue
            .dispatch(move || {
                thread::sleep(Duration::from_millis(50));
                i
            })
            .unwrap();
    }
    thread::sleep(Duration::from_millis(60));

    let start = Instant::now();
    pool.kill();
    assert!(start.elapsed() < Duration::from_secs(1), "kill must not wait for the backlog");

    let mut delivered = 0u64;
    while let Some(r) = queue.next_result_wait() {
        assert_eq!(r.serial(), delivered, "delivered results form a contiguous prefix");
        delivered += 1;
    }
    assert!(delivered >= 2, "jobs finished before the kill are delivered");
    assert!(delivered <= 30);
}

#[test]
fn test_kill_fails_pending_flush() {
    let pool = Pool::new(2).unwrap();
    let queue: Arc<Queue<()>> = Arc::new(Queue::new_discarding(&pool, 16));

    for _ in 0..8 {
        queue
            .dispatch(move || {
                thread::sleep(Duration::from_millis(300));
            })
            .unwrap();
    }
    let flusher = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.flush())
    };

    thread::sleep(Duration::from_millis(20));
    pool.kill();
    assert_eq!(flusher.join().unwrap(), Err(FlushError::PoolShutDown));
}
