//! The worker pool: thread lifecycle, queue scheduling, and the serial
//! gate that keeps each queue's results in dispatch order.
//!
//! One mutex guards every mutable field of the pool and of every queue
//! attached to it; it is held everywhere except while a worker runs the
//! user's closure. Attached queues form a ring scanned round-robin from
//! the cursor `q_head`, which is advanced both on dispatch (toward the
//! most recently fed queue) and on job selection (past the queue just
//! served). Idle workers park on their own condition variable and record
//! themselves on the free-worker stack so a producer can wake exactly one
//! of them per dispatched job instead of broadcasting.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::queue::{ErasedPayload, QueueSignals, QueueState, RawResult};

/// State shared between the pool handle and its worker threads.
pub(crate) struct PoolShared {
    /// The single pool-wide mutex.
    pub(crate) inner: Mutex<PoolInner>,
    /// One condvar per worker, indexed by worker id, for targeted wakes.
    pub(crate) worker_wakeups: Vec<Condvar>,
}

/// Everything the pool mutex protects, including all queue state.
pub(crate) struct PoolInner {
    /// Queue state by id. Detached and shut-down queues stay here until
    /// their handle is dropped.
    pub(crate) queues: HashMap<u64, QueueState>,
    /// Attached queue ids in attachment order, scanned as a ring.
    pub(crate) ring: Vec<u64>,
    /// Scan cursor into `ring`.
    pub(crate) q_head: usize,
    /// Indices of currently parked workers; every entry names a worker
    /// that is really waiting, so one pop + signal wakes exactly one.
    pub(crate) free_workers: Vec<usize>,
    pub(crate) nwaiting: usize,
    /// Queued inputs summed over attached queues; lets workers skip the
    /// ring scan entirely when there is nothing to do.
    pub(crate) njobs: usize,
    pub(crate) shutdown: bool,
    pub(crate) next_queue_id: u64,
    /// Per-worker accumulated park time.
    pub(crate) worker_wait: Vec<Duration>,
    /// Number of job pickups, and the sum of busy-worker counts sampled
    /// at each pickup; their ratio is the mean load.
    pub(crate) pickups: u64,
    pub(crate) busy_sum: u64,
}

impl PoolInner {
    /// Remove `id` from the ring and repair the cursor.
    pub(crate) fn detach_from_ring(&mut self, id: u64) {
        let Some(pos) = self.ring.iter().position(|&qid| qid == id) else {
            return;
        };
        self.ring.remove(pos);
        if self.ring.is_empty() {
            self.q_head = 0;
        } else {
            if pos < self.q_head {
                self.q_head -= 1;
            }
            if self.q_head >= self.ring.len() {
                self.q_head = 0;
            }
        }
    }
}

/// A consistent snapshot of the pool's load counters.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Number of worker threads.
    pub workers: usize,
    /// Workers currently parked waiting for work.
    pub waiting: usize,
    /// Jobs queued across all attached queues.
    pub queued_jobs: usize,
    /// Queues currently attached to the scan ring.
    pub attached_queues: usize,
    /// Mean number of busy workers observed at job pickup; a low value
    /// against `workers` indicates bursty input rather than sustained
    /// parallelism.
    pub mean_busy: f64,
    /// Total time workers have spent parked, summed over all workers.
    pub total_wait: Duration,
}

/// A fixed-size worker pool serving any number of [`Queue`]s.
///
/// Dropping the pool shuts it down gracefully: workers finish the job
/// they are executing and exit, and every blocked producer, consumer and
/// flusher on an attached queue is released. Queued-but-unstarted jobs do
/// not run. Use [`Queue::flush`] before teardown when every submitted job
/// must complete.
///
/// [`Queue`]: crate::Queue
/// [`Queue::flush`]: crate::Queue::flush
///
/// # Example
///
/// ```
/// use poolq::Pool;
///
/// let pool = Pool::new(4)?;
/// assert_eq!(pool.worker_count(), 4);
/// pool.join();
/// # Ok::<(), std::io::Error>(())
/// ```
pub struct Pool {
    pub(crate) shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Start a pool with `n_workers` threads.
    ///
    /// # Errors
    ///
    /// Returns the spawn error if any worker thread fails to start; the
    /// workers that did start are shut down and joined before returning,
    /// leaving nothing behind.
    ///
    /// # Panics
    ///
    /// Panics if `n_workers` is zero.
    pub fn new(n_workers: usize) -> io::Result<Pool> {
        assert!(n_workers >= 1, "a pool needs at least one worker");
        let shared = Arc::new(PoolShared {
            inner: Mutex::new(PoolInner {
                queues: HashMap::new(),
                ring: Vec::new(),
                q_head: 0,
                free_workers: Vec::with_capacity(n_workers),
                nwaiting: 0,
                njobs: 0,
                shutdown: false,
                next_queue_id: 0,
                worker_wait: vec![Duration::ZERO; n_workers],
                pickups: 0,
                busy_sum: 0,
            }),
            worker_wakeups: (0..n_workers).map(|_| Condvar::new()).collect(),
        });

        debug!("starting pool with {n_workers} workers");
        let mut workers = Vec::with_capacity(n_workers);
        for idx in 0..n_workers {
            let shared_for_worker = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("poolq-worker-{idx}"))
                .spawn(move || worker_loop(&shared_for_worker, idx));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    debug!("worker {idx} failed to spawn, rolling back: {e}");
                    Pool { shared, workers }.join();
                    return Err(e);
                }
            }
        }
        Ok(Pool { shared, workers })
    }

    /// Number of worker threads.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.shared.worker_wakeups.len()
    }

    /// Snapshot the pool's load counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.inner.lock();
        PoolStats {
            workers: self.shared.worker_wakeups.len(),
            waiting: inner.nwaiting,
            queued_jobs: inner.njobs,
            attached_queues: inner.ring.len(),
            mean_busy: if inner.pickups == 0 {
                0.0
            } else {
                inner.busy_sum as f64 / inner.pickups as f64
            },
            total_wait: inner.worker_wait.iter().sum(),
        }
    }

    /// Shut down and wait for every worker to finish its current job and
    /// exit. Equivalent to dropping the pool, spelled out for call sites
    /// where the teardown should be visible.
    pub fn join(self) {
        // Drop does the work.
        drop(self);
    }

    /// Shut down without waiting for workers. Queued-but-unstarted jobs
    /// on attached queues are discarded; workers finish the single job
    /// they are executing and exit on their own. A flush on a queue that
    /// lost queued jobs fails with
    /// [`FlushError::PoolShutDown`](crate::FlushError::PoolShutDown);
    /// flushes waiting only on in-flight jobs still complete.
    pub fn kill(mut self) {
        self.begin_shutdown(true);
        for handle in std::mem::take(&mut self.workers) {
            drop(handle);
        }
    }

    /// Mark the pool (and its attached queues) as shutting down and wake
    /// everyone who could be waiting. Idempotent.
    fn begin_shutdown(&self, kill: bool) {
        let mut inner = self.shared.inner.lock();
        if inner.shutdown {
            return;
        }
        debug!("pool shutting down (kill: {kill})");
        inner.shutdown = true;
        let mut dropped = 0;
        for q in inner.queues.values_mut() {
            if q.attached {
                q.shutdown = true;
                if kill && !q.input.is_empty() {
                    dropped += q.input.len();
                    q.input.clear();
                    q.jobs_discarded = true;
                }
            }
            // Detached queues keep their flags but their waiters must
            // still observe the pool shutdown.
            q.signals.broadcast_all();
        }
        inner.njobs -= dropped;
        if dropped > 0 {
            debug!("discarded {dropped} queued jobs");
        }
        for wakeup in &self.shared.worker_wakeups {
            wakeup.notify_one();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.begin_shutdown(false);
        for handle in std::mem::take(&mut self.workers) {
            // A worker that died in a panicking job is already gone;
            // there is nothing useful to do with its payload here.
            let _ = handle.join();
        }
    }
}

/// Scan the ring from the cursor for a queue a worker may serve next.
fn select_queue(inner: &PoolInner) -> Option<usize> {
    if inner.njobs == 0 || inner.ring.is_empty() {
        return None;
    }
    let n = inner.ring.len();
    (0..n).map(|k| (inner.q_head + k) % n).find(|&pos| {
        let qid = inner.ring[pos];
        inner.queues.get(&qid).is_some_and(QueueState::startable)
    })
}

/// The worker dispatch loop. Holds the pool mutex except while running
/// the user's closure.
fn worker_loop(shared: &PoolShared, idx: usize) {
    let total_workers = shared.worker_wakeups.len();
    let mut inner = shared.inner.lock();
    loop {
        if inner.shutdown {
            break;
        }

        let Some(pos) = select_queue(&inner) else {
            // Nothing runnable: register for a targeted wake and park.
            // Push and wait happen in one critical section, so an entry
            // on the stack always names a worker that is really waiting.
            inner.free_workers.push(idx);
            inner.nwaiting += 1;
            trace!("worker {idx}: parking");
            let parked_at = Instant::now();
            shared.worker_wakeups[idx].wait(&mut inner);
            inner.worker_wait[idx] += parked_at.elapsed();
            inner.nwaiting -= 1;
            continue;
        };

        let (qid, serial, run, signals, discard) = {
            let inner = &mut *inner;
            let qid = inner.ring[pos];
            let q = inner.queues.get_mut(&qid).expect("ring entries are live queues");
            let job = q.input.pop_front().expect("selected queue has input");
            q.n_processing += 1;
            let signals = Arc::clone(&q.signals);
            let discard = q.discard_results;
            if q.input.is_empty() {
                signals.input_empty.notify_one();
            }
            inner.njobs -= 1;
            // Rotate past the queue just served.
            inner.q_head = (pos + 1) % inner.ring.len();
            inner.pickups += 1;
            inner.busy_sum += (total_workers - inner.nwaiting) as u64;
            (qid, job.serial, job.run, signals, discard)
        };

        trace!("worker {idx}: running job {serial} from queue {qid}");
        let payload = MutexGuard::unlocked(&mut inner, move || run());

        if discard {
            complete_suppressed(&mut inner, qid, &signals);
        } else {
            deposit_in_order(&mut inner, qid, serial, payload, &signals);
        }
    }
    trace!("worker {idx}: exiting");
}

/// Account a completed job on an output-suppressed queue.
fn complete_suppressed(inner: &mut MutexGuard<'_, PoolInner>, qid: u64, signals: &QueueSignals) {
    let Some(q) = inner.queues.get_mut(&qid) else {
        return;
    };
    q.n_processing -= 1;
    q.curr_serial += 1;
    signals.input_not_full.notify_one();
    if q.n_processing == 0 {
        signals.none_processing.notify_one();
    }
}

/// Publish a result in serial order, waiting on the gate until every
/// predecessor has been appended.
///
/// The gate waits on the queue's `output_avail` condvar, which is always
/// broadcast: several workers may be parked here holding non-consecutive
/// serials, and a single signal could wake the wrong one forever.
fn deposit_in_order(
    inner: &mut MutexGuard<'_, PoolInner>,
    qid: u64,
    serial: u64,
    payload: ErasedPayload,
    signals: &QueueSignals,
) {
    let mut payload = Some(payload);
    loop {
        let gate_open = match inner.queues.get(&qid) {
            // The queue was destroyed while the job ran: discard, but
            // wake gate-waiting siblings so they recheck.
            None => {
                signals.output_avail.notify_all();
                return;
            }
            Some(q) => serial == q.curr_serial,
        };

        if gate_open {
            let q = inner.queues.get_mut(&qid).expect("checked above");
            q.output.push_back(RawResult {
                serial,
                payload: payload.take().expect("deposited exactly once"),
            });
            q.curr_serial += 1;
            q.n_processing -= 1;
            let none_left = q.n_processing == 0;
            signals.output_avail.notify_all();
            signals.input_not_full.notify_one();
            if none_left {
                signals.none_processing.notify_one();
            }
            return;
        }

        if inner.shutdown {
            // A predecessor was discarded by pool teardown, so the gate
            // can never open; drop the payload and release the slot.
            let q = inner.queues.get_mut(&qid).expect("checked above");
            q.n_processing -= 1;
            let none_left = q.n_processing == 0;
            signals.output_avail.notify_all();
            signals.input_not_full.notify_one();
            if none_left {
                signals.none_processing.notify_one();
            }
            return;
        }

        signals.output_avail.wait(inner);
    }
}
