//! Job queues: bounded input, serially ordered output.
//!
//! A [`Queue`] is one logical stream of work inside a [`Pool`]. Producers
//! dispatch closures into it; workers execute them in parallel; consumers
//! retrieve the results strictly in dispatch order. All mutable queue
//! state lives under the pool's single mutex (see `pool.rs`); the queue's
//! four condition variables live in a shared [`QueueSignals`] so workers
//! can still signal siblings after the state itself is gone.
//!
//! # Capacity
//!
//! `qsize` bounds a queue's total occupancy: queued input plus jobs being
//! processed plus (for result-keeping queues) completed-but-undrained
//! output. At the bound [`Queue::dispatch`] blocks on `input_not_full`
//! and [`Queue::try_dispatch`] hands the closure back.

use std::any::Any;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Condvar;

use crate::error::{DispatchError, FlushError, TryDispatchError};
use crate::pool::{Pool, PoolInner, PoolShared};

/// Type-erased job payload, so heterogeneous queues can share one pool.
pub(crate) type ErasedPayload = Box<dyn Any + Send>;

/// A queued job: the erased closure plus its delivery position.
pub(crate) struct Job {
    pub(crate) serial: u64,
    pub(crate) run: Box<dyn FnOnce() -> ErasedPayload + Send + 'static>,
}

/// A completed job before the consumer's type is restored.
pub(crate) struct RawResult {
    pub(crate) serial: u64,
    pub(crate) payload: ErasedPayload,
}

/// The queue's condition variables, shared between the queue state and
/// every party that may need to signal after the state is dropped.
pub(crate) struct QueueSignals {
    /// A result (or terminal state) became observable on the output side.
    /// Always broadcast: gate-waiting workers and consumers share it.
    pub(crate) output_avail: Condvar,
    /// Occupancy dropped below `qsize`.
    pub(crate) input_not_full: Condvar,
    /// The input list just became empty.
    pub(crate) input_empty: Condvar,
    /// `n_processing` just hit zero.
    pub(crate) none_processing: Condvar,
}

impl QueueSignals {
    fn new() -> Self {
        QueueSignals {
            output_avail: Condvar::new(),
            input_not_full: Condvar::new(),
            input_empty: Condvar::new(),
            none_processing: Condvar::new(),
        }
    }

    /// Release every blocked producer, consumer, flusher and gate-waiter.
    pub(crate) fn broadcast_all(&self) {
        self.output_avail.notify_all();
        self.input_not_full.notify_all();
        self.input_empty.notify_all();
        self.none_processing.notify_all();
    }
}

/// Per-queue state. Lives in the pool's mutex-guarded table; the handle
/// addresses it by id.
pub(crate) struct QueueState {
    pub(crate) input: VecDeque<Job>,
    pub(crate) output: VecDeque<RawResult>,
    /// Jobs currently executing on worker threads (including workers
    /// parked on the serial gate with a finished payload in hand).
    pub(crate) n_processing: usize,
    pub(crate) qsize: usize,
    /// Serial stamped on the next dispatched job.
    pub(crate) next_serial: u64,
    /// Serial of the next result allowed onto the output list.
    pub(crate) curr_serial: u64,
    pub(crate) shutdown: bool,
    pub(crate) discard_results: bool,
    pub(crate) attached: bool,
    /// Set when pool teardown dropped queued jobs from this queue; a
    /// flush barrier over those jobs can never be satisfied.
    pub(crate) jobs_discarded: bool,
    pub(crate) signals: Arc<QueueSignals>,
}

impl QueueState {
    /// Admission check. Completed output counts against capacity unless
    /// the queue discards results.
    pub(crate) fn is_full(&self) -> bool {
        let occupied = self.input.len()
            + self.n_processing
            + if self.discard_results { 0 } else { self.output.len() };
        occupied >= self.qsize
    }

    /// Whether a worker may start a job from this queue: there must be
    /// pending input, and a result-keeping queue must have room on its
    /// output side for the eventual result.
    pub(crate) fn startable(&self) -> bool {
        !self.input.is_empty()
            && (self.discard_results || self.output.len() + self.n_processing < self.qsize)
    }
}

/// The output of one job: its payload plus the serial identifying its
/// position in the queue's delivery order.
///
/// Dropping a `JobResult` frees the payload; [`into_inner`] keeps it.
///
/// [`into_inner`]: JobResult::into_inner
#[derive(Debug)]
pub struct JobResult<T> {
    serial: u64,
    payload: T,
}

impl<T> JobResult<T> {
    /// The job's position in its queue's delivery order, starting at 0.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Borrow the payload.
    #[must_use]
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Take ownership of the payload.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.payload
    }
}

fn downcast_result<T: 'static>(raw: RawResult) -> JobResult<T> {
    // Only Queue<T> can enqueue into its own state, so the payload is
    // always a T.
    let payload = raw
        .payload
        .downcast::<T>()
        .expect("payload type matches the queue's result type");
    JobResult { serial: raw.serial, payload: *payload }
}

/// One job queue attached to a [`Pool`].
///
/// The handle is the queue's identity: share it between producer and
/// consumer threads via `Arc`, and drop the last clone to destroy the
/// queue (remaining jobs and results are freed; workers still executing
/// one of its jobs discard the result on completion).
///
/// # Example
///
/// ```
/// use poolq::{Pool, Queue};
///
/// let pool = Pool::new(2)?;
/// let queue: Queue<usize> = Queue::new(&pool, 4);
///
/// queue.dispatch(|| "abc".len()).expect("queue accepts jobs");
/// let result = queue.next_result_wait().expect("job completes");
/// assert_eq!(result.serial(), 0);
/// assert_eq!(result.into_inner(), 3);
/// # Ok::<(), std::io::Error>(())
/// ```
pub struct Queue<T> {
    pool: Arc<PoolShared>,
    id: u64,
    signals: Arc<QueueSignals>,
    _results: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Queue<T> {
    /// Create a queue that keeps results and delivers them in dispatch
    /// order. `qsize` bounds input + processing + output occupancy.
    ///
    /// # Panics
    ///
    /// Panics if `qsize` is zero.
    #[must_use]
    pub fn new(pool: &Pool, qsize: usize) -> Self {
        Self::build(pool, qsize, false)
    }

    /// Create a queue that discards results on completion, for jobs run
    /// purely for their side effects. `qsize` bounds input + processing
    /// occupancy. [`next_result`](Queue::next_result) and
    /// [`next_result_wait`](Queue::next_result_wait) never yield anything
    /// for such a queue; use [`flush`](Queue::flush) as the completion
    /// barrier.
    ///
    /// # Panics
    ///
    /// Panics if `qsize` is zero.
    #[must_use]
    pub fn new_discarding(pool: &Pool, qsize: usize) -> Self {
        Self::build(pool, qsize, true)
    }

    fn build(pool: &Pool, qsize: usize, discard_results: bool) -> Self {
        assert!(qsize >= 1, "queue capacity must be at least 1");
        let signals = Arc::new(QueueSignals::new());
        let shared = Arc::clone(&pool.shared);
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;
        let id = inner.next_queue_id;
        inner.next_queue_id += 1;
        inner.queues.insert(
            id,
            QueueState {
                input: VecDeque::new(),
                output: VecDeque::new(),
                n_processing: 0,
                qsize,
                next_serial: 0,
                curr_serial: 0,
                shutdown: false,
                discard_results,
                attached: true,
                jobs_discarded: false,
                signals: Arc::clone(&signals),
            },
        );
        inner.ring.push(id);
        drop(guard);
        debug!("queue {id}: created (qsize {qsize}, discard_results {discard_results})");
        Queue { pool: shared, id, signals, _results: PhantomData }
    }

    /// Dispatch a job, blocking while the queue is at capacity.
    ///
    /// The closure runs on an arbitrary worker thread. It must not call
    /// this queue's blocking operations (that can deadlock against the
    /// capacity bound), and it must return: a job that never returns
    /// permanently occupies one of the queue's processing slots.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ShutDown`] if the queue or the pool is shutting
    /// down, immediately or while blocked.
    pub fn dispatch<F>(&self, job: F) -> Result<(), DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let mut inner = self.pool.inner.lock();
        loop {
            let q = inner.queues.get(&self.id).expect("queue state outlives its handle");
            if q.shutdown || inner.shutdown {
                return Err(DispatchError::ShutDown);
            }
            if !q.is_full() {
                break;
            }
            self.signals.input_not_full.wait(&mut inner);
        }
        self.enqueue(&mut inner, Box::new(move || Box::new(job()) as ErasedPayload));
        Ok(())
    }

    /// Dispatch a job without blocking.
    ///
    /// # Errors
    ///
    /// [`TryDispatchError::Full`] if the queue is at capacity,
    /// [`TryDispatchError::ShutDown`] if the queue or pool is shutting
    /// down. Both variants return the closure to the caller.
    pub fn try_dispatch<F>(&self, job: F) -> Result<(), TryDispatchError<F>>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let mut inner = self.pool.inner.lock();
        let q = inner.queues.get(&self.id).expect("queue state outlives its handle");
        if q.shutdown || inner.shutdown {
            return Err(TryDispatchError::ShutDown(job));
        }
        if q.is_full() {
            return Err(TryDispatchError::Full(job));
        }
        self.enqueue(&mut inner, Box::new(move || Box::new(job()) as ErasedPayload));
        Ok(())
    }

    /// Append the admitted job and wake one parked worker if any.
    fn enqueue(&self, inner: &mut PoolInner, run: Box<dyn FnOnce() -> ErasedPayload + Send>) {
        let q = inner.queues.get_mut(&self.id).expect("queue state outlives its handle");
        let serial = q.next_serial;
        q.next_serial += 1;
        q.input.push_back(Job { serial, run });
        let attached = q.attached;
        trace!("queue {}: dispatched job {serial}", self.id);
        if attached {
            inner.njobs += 1;
            // Bias the scan cursor toward the most recently fed queue.
            if let Some(pos) = inner.ring.iter().position(|&qid| qid == self.id) {
                inner.q_head = pos;
            }
            if let Some(widx) = inner.free_workers.pop() {
                self.pool.worker_wakeups[widx].notify_one();
            }
        }
    }

    /// Pop the next in-order result if one has been delivered.
    ///
    /// Results are only ever appended in serial order, so the head of the
    /// output list is always the next serial due.
    #[must_use]
    pub fn next_result(&self) -> Option<JobResult<T>> {
        let mut inner = self.pool.inner.lock();
        let q = inner.queues.get_mut(&self.id).expect("queue state outlives its handle");
        let raw = q.output.pop_front()?;
        // Draining output frees admission capacity.
        self.signals.input_not_full.notify_one();
        Some(downcast_result(raw))
    }

    /// Pop the next in-order result, blocking until one is delivered.
    ///
    /// Returns `None` only when no further result can ever arrive: the
    /// queue was shut down and fully drained, or the pool was torn down.
    #[must_use]
    pub fn next_result_wait(&self) -> Option<JobResult<T>> {
        let mut inner = self.pool.inner.lock();
        loop {
            let pool_down = inner.shutdown;
            let q = inner.queues.get_mut(&self.id).expect("queue state outlives its handle");
            if let Some(raw) = q.output.pop_front() {
                self.signals.input_not_full.notify_one();
                return Some(downcast_result(raw));
            }
            let drained = (q.shutdown && q.input.is_empty() && q.n_processing == 0)
                || (pool_down && q.n_processing == 0);
            if drained {
                return None;
            }
            self.signals.output_avail.wait(&mut inner);
        }
    }

    /// Wait until every job dispatched on this queue before the call has
    /// completed. On return the queue has no pending input and no job in
    /// processing; completed results (if kept) remain available.
    ///
    /// A queue shutdown does not fail a flush: admission stops but the
    /// already-submitted jobs still drain. Neither does a pool teardown
    /// that catches this queue with in-flight jobs only: a job a worker
    /// has already picked up always runs to completion and releases its
    /// processing slot.
    ///
    /// # Errors
    ///
    /// [`FlushError::PoolShutDown`] if pool teardown strands jobs this
    /// flush is waiting on: queued input that can no longer be selected
    /// after a graceful shutdown, or queued input discarded outright by
    /// [`Pool::kill`](crate::Pool::kill).
    pub fn flush(&self) -> Result<(), FlushError> {
        let mut inner = self.pool.inner.lock();
        loop {
            let q = inner.queues.get(&self.id).expect("queue state outlives its handle");
            if q.input.is_empty() {
                break;
            }
            // Workers stop selecting jobs once the pool shuts down, so
            // pending input will never drain.
            if inner.shutdown {
                return Err(FlushError::PoolShutDown);
            }
            self.signals.input_empty.wait(&mut inner);
        }
        loop {
            let q = inner.queues.get(&self.id).expect("queue state outlives its handle");
            if q.jobs_discarded {
                return Err(FlushError::PoolShutDown);
            }
            if q.n_processing == 0 {
                break;
            }
            self.signals.none_processing.wait(&mut inner);
        }
        Ok(())
    }

    /// Stop admission on this queue and release every blocked producer,
    /// consumer and flusher. Already-queued and in-flight jobs drain.
    /// Idempotent.
    pub fn shutdown(&self) {
        let mut inner = self.pool.inner.lock();
        let q = inner.queues.get_mut(&self.id).expect("queue state outlives its handle");
        if !q.shutdown {
            debug!("queue {}: shutting down", self.id);
            q.shutdown = true;
        }
        q.signals.broadcast_all();
    }

    /// Reattach a detached queue to the pool's scan ring. Pending jobs
    /// become eligible again and a parked worker is woken for them.
    /// No-op if already attached.
    pub fn attach(&self) {
        let mut guard = self.pool.inner.lock();
        let inner = &mut *guard;
        let q = inner.queues.get_mut(&self.id).expect("queue state outlives its handle");
        if q.attached {
            return;
        }
        q.attached = true;
        let pending = q.input.len();
        inner.ring.push(self.id);
        inner.njobs += pending;
        if pending > 0 {
            if let Some(widx) = inner.free_workers.pop() {
                self.pool.worker_wakeups[widx].notify_one();
            }
        }
        trace!("queue {}: attached with {pending} pending jobs", self.id);
    }

    /// Remove the queue from the pool's scan ring. The queue keeps its
    /// contents and its jobs already being processed complete normally,
    /// but workers select no new jobs from it until it is reattached.
    /// No-op if already detached.
    pub fn detach(&self) {
        let mut guard = self.pool.inner.lock();
        let inner = &mut *guard;
        let q = inner.queues.get_mut(&self.id).expect("queue state outlives its handle");
        if !q.attached {
            return;
        }
        q.attached = false;
        let pending = q.input.len();
        inner.njobs -= pending;
        inner.detach_from_ring(self.id);
        trace!("queue {}: detached with {pending} pending jobs", self.id);
    }

    /// True iff the queue holds no input, no processing job, and no
    /// undrained result.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let inner = self.pool.inner.lock();
        let q = inner.queues.get(&self.id).expect("queue state outlives its handle");
        q.input.is_empty() && q.n_processing == 0 && q.output.is_empty()
    }

    /// Number of completed results awaiting retrieval.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.pool.inner.lock();
        let q = inner.queues.get(&self.id).expect("queue state outlives its handle");
        q.output.len()
    }

    /// Total occupancy: queued input + processing + undrained results.
    #[must_use]
    pub fn size(&self) -> usize {
        let inner = self.pool.inner.lock();
        let q = inner.queues.get(&self.id).expect("queue state outlives its handle");
        q.input.len() + q.n_processing + q.output.len()
    }
}

impl<T> Drop for Queue<T> {
    /// Destroy the queue: release anyone blocked on it, detach it, and
    /// free remaining jobs and results. A worker still executing one of
    /// its jobs discards the result at deposit time.
    fn drop(&mut self) {
        let mut guard = self.pool.inner.lock();
        let inner = &mut *guard;
        let Some(q) = inner.queues.get_mut(&self.id) else {
            return;
        };
        q.signals.broadcast_all();
        let was_attached = q.attached;
        let pending = q.input.len();
        if was_attached {
            inner.njobs -= pending;
            inner.detach_from_ring(self.id);
        }
        inner.queues.remove(&self.id);
        debug!("queue {}: destroyed ({pending} queued jobs dropped)", self.id);
    }
}
