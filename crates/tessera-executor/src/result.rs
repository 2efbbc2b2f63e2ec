//! Aggregation of per-partition outcomes into one logical result.
//!
//! A [`ShardResult`] is shared between the caller and every dispatch task.
//! Tasks record their outcome into a fixed slot and decrement an outstanding
//! counter; the task that observes the counter reach zero finalizes the
//! aggregate. A deadline expiry may finalize earlier, filling the remaining
//! slots with [`ShardError::Timeout`]. Finalization happens exactly once,
//! under the state mutex.
//!
//! ```text
//!            first failure              all slots filled
//!  Running ───────────────▶ Failed ─────────────────────▶ (finalized)
//!     │
//!     └──── all slots filled, no failure ──▶ Done (finalized)
//! ```

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tessera_core::{OperationId, PartitionKey, Result, ShardError};
use tokio::sync::watch;

/// Lifecycle of an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardStatus {
    /// Partitions are still outstanding and none has failed.
    Running,
    /// Every partition succeeded.
    Done,
    /// At least one partition failed, timed out or was cancelled.
    Failed,
}

/// What one partition produced.
#[derive(Debug, Clone)]
pub struct PartitionOutcome<T> {
    pub partition: PartitionKey,
    pub result: Result<T>,
    /// Time spent executing, or the deadline for timed-out partitions.
    pub elapsed: Duration,
}

impl<T> PartitionOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Snapshot of an aggregate's per-partition outcomes.
#[derive(Debug, Clone)]
pub struct AggregateOutcome<T> {
    pub operation_id: OperationId,
    pub status: ShardStatus,
    /// Recorded outcomes in dispatch (partition) order.
    pub partitions: Vec<PartitionOutcome<T>>,
    /// Outcomes that arrived after the aggregate was finalized by a deadline.
    pub late: Vec<PartitionOutcome<T>>,
}

impl<T> AggregateOutcome<T> {
    pub fn contains_failures(&self) -> bool {
        self.partitions.iter().any(|o| !o.is_success())
    }

    pub fn success_count(&self) -> usize {
        self.partitions.iter().filter(|o| o.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.partitions.len() - self.success_count()
    }

    /// Iterates over successful partitions and their values.
    pub fn successes(&self) -> impl Iterator<Item = (&PartitionKey, &T)> {
        self.partitions
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|v| (&o.partition, v)))
    }

    /// Iterates over failed partitions and their errors.
    pub fn failures(&self) -> impl Iterator<Item = (&PartitionKey, &ShardError)> {
        self.partitions
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (&o.partition, e)))
    }

    /// Slowest partition's execution time.
    pub fn max_elapsed(&self) -> Duration {
        self.partitions
            .iter()
            .map(|o| o.elapsed)
            .max()
            .unwrap_or_default()
    }
}

type Listener = Box<dyn FnOnce(ShardStatus) + Send>;

struct Inner<T> {
    slots: Vec<Option<PartitionOutcome<T>>>,
    late: Vec<PartitionOutcome<T>>,
    status: ShardStatus,
    finalized: bool,
    listeners: Vec<Listener>,
}

struct Shared<T> {
    operation_id: OperationId,
    partitions: Vec<PartitionKey>,
    created: Instant,
    outstanding: AtomicUsize,
    cancelled: AtomicBool,
    inner: Mutex<Inner<T>>,
    finished: Condvar,
    done_tx: watch::Sender<bool>,
}

/// Handle to the aggregate result of one dispatched operation.
///
/// Cloning yields another handle to the same aggregate.
pub struct ShardResult<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ShardResult<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for ShardResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardResult")
            .field("operation_id", &self.shared.operation_id)
            .field("partitions", &self.shared.partitions.len())
            .field("outstanding", &self.shared.outstanding.load(Ordering::Acquire))
            .field("status", &self.status())
            .finish()
    }
}

impl<T> ShardResult<T> {
    /// Creates an aggregate expecting one outcome per partition, in order.
    ///
    /// With no partitions the aggregate is immediately `Done`.
    pub(crate) fn new(operation_id: OperationId, partitions: Vec<PartitionKey>) -> Self {
        let n = partitions.len();
        let (done_tx, _) = watch::channel(false);
        let result = Self {
            shared: Arc::new(Shared {
                operation_id,
                created: Instant::now(),
                outstanding: AtomicUsize::new(n),
                cancelled: AtomicBool::new(false),
                inner: Mutex::new(Inner {
                    slots: (0..n).map(|_| None).collect(),
                    late: Vec::new(),
                    status: ShardStatus::Running,
                    finalized: false,
                    listeners: Vec::new(),
                }),
                finished: Condvar::new(),
                done_tx,
                partitions,
            }),
        };
        if n == 0 {
            let inner = result.shared.inner.lock();
            result.shared.finalize(inner);
        }
        result
    }

    pub fn operation_id(&self) -> OperationId {
        self.shared.operation_id
    }

    /// Partitions this aggregate expects, in slot order.
    pub fn partitions(&self) -> &[PartitionKey] {
        &self.shared.partitions
    }

    pub fn status(&self) -> ShardStatus {
        self.shared.inner.lock().status
    }

    /// Returns true once the aggregate is finalized: every partition has
    /// reported, or the deadline expired.
    pub fn is_done(&self) -> bool {
        self.shared.inner.lock().finalized
    }

    /// Number of partitions that have not reported yet.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Blocks the calling thread until the aggregate is finalized.
    ///
    /// Must not be called from inside an async task of the dispatching
    /// runtime; use [`ShardResult::completed`] there.
    pub fn wait(&self) -> ShardStatus {
        let mut inner = self.shared.inner.lock();
        while !inner.finalized {
            self.shared.finished.wait(&mut inner);
        }
        inner.status
    }

    /// Like [`ShardResult::wait`] but gives up after `timeout`, returning
    /// `None` if the aggregate is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ShardStatus> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        while !inner.finalized {
            if self
                .shared
                .finished
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                break;
            }
        }
        inner.finalized.then_some(inner.status)
    }

    /// Resolves once the aggregate is finalized.
    pub async fn completed(&self) -> ShardStatus {
        let mut rx = self.shared.done_tx.subscribe();
        // The sender lives in `shared`, so the channel cannot close under us.
        let _ = rx.wait_for(|done| *done).await;
        self.status()
    }

    /// Registers a callback run exactly once with the final status.
    ///
    /// Runs immediately on the calling thread if the aggregate is already
    /// finalized; otherwise on the thread that finalizes it.
    pub fn on_complete(&self, callback: impl FnOnce(ShardStatus) + Send + 'static) {
        let mut inner = self.shared.inner.lock();
        if inner.finalized {
            let status = inner.status;
            drop(inner);
            callback(status);
        } else {
            inner.listeners.push(Box::new(callback));
        }
    }

    /// Asks tasks that have not started yet to record `Cancelled` instead of
    /// executing. Running tasks are not interrupted.
    pub fn cancel(&self) {
        if !self.shared.cancelled.swap(true, Ordering::AcqRel) {
            tracing::debug!(operation = %self.shared.operation_id, "Cancelling outstanding partitions");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Takes the recorded outcomes out of the aggregate, waiting for it to
    /// finalize first. Other handles observe an empty aggregate afterwards.
    pub fn into_outcome(self) -> AggregateOutcome<T> {
        self.wait();
        let mut inner = self.shared.inner.lock();
        let partitions = std::mem::take(&mut inner.slots).into_iter().flatten().collect();
        AggregateOutcome {
            operation_id: self.shared.operation_id,
            status: inner.status,
            partitions,
            late: std::mem::take(&mut inner.late),
        }
    }

    // =========================================================================
    // Recording (dispatch side)
    // =========================================================================

    /// Records the outcome of the partition in `slot`.
    pub(crate) fn record(&self, slot: usize, result: Result<T>, elapsed: Duration) {
        let partition = self.shared.partitions[slot];
        let outcome = PartitionOutcome {
            partition,
            result,
            elapsed,
        };

        let mut inner = self.shared.inner.lock();
        if inner.finalized {
            tracing::debug!(
                operation = %self.shared.operation_id,
                partition = %partition,
                "Late partition outcome after finalize"
            );
            inner.late.push(outcome);
            return;
        }

        if let Err(err) = &outcome.result {
            tracing::warn!(
                operation = %self.shared.operation_id,
                partition = %partition,
                error = %err,
                "Partition failed"
            );
            if inner.status == ShardStatus::Running {
                inner.status = ShardStatus::Failed;
            }
        }
        inner.slots[slot] = Some(outcome);

        if self.shared.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.finalize(inner);
        }
    }

    /// Marks every unreported partition as timed out and finalizes.
    pub(crate) fn expire(&self, after: Duration) {
        let after_ms = after.as_millis() as u64;
        let closed = self.shared.close_outstanding(after, |partition| ShardError::Timeout {
            partition,
            after_ms,
        });
        if let Some(expired) = closed {
            tracing::warn!(
                operation = %self.shared.operation_id,
                expired,
                after_ms,
                "Deadline expired"
            );
        }
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.shared.inner.lock().finalized
    }

    /// Weak, type-erased handle the dispatcher keeps to close this aggregate
    /// if it shuts down first.
    pub(crate) fn tracker(&self) -> Weak<dyn PendingAggregate>
    where
        T: Send + 'static,
    {
        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        weak
    }
}

/// An aggregate seen without its value type.
pub(crate) trait PendingAggregate: Send + Sync {
    fn is_finalized(&self) -> bool;

    /// Blocks until the aggregate is finalized or `deadline` passes.
    /// Returns whether it is finalized.
    fn wait_until(&self, deadline: Instant) -> bool;

    /// Records every unreported partition as unavailable and finalizes.
    fn abandon(&self, reason: &str);
}

impl<T: Send> PendingAggregate for Shared<T> {
    fn is_finalized(&self) -> bool {
        self.inner.lock().finalized
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        let mut inner = self.inner.lock();
        while !inner.finalized {
            if self.finished.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.finalized
    }

    fn abandon(&self, reason: &str) {
        let closed = self.close_outstanding(Duration::ZERO, |partition| {
            ShardError::PartitionUnavailable {
                partition,
                reason: reason.to_string(),
            }
        });
        if let Some(abandoned) = closed {
            tracing::warn!(
                operation = %self.operation_id,
                abandoned,
                reason,
                "Abandoned outstanding partitions"
            );
        }
    }
}

impl<T> Shared<T> {
    /// Fills every empty slot with `error(partition)`, marks the aggregate
    /// failed and finalizes. Returns `None` if it was already finalized.
    fn close_outstanding(
        &self,
        elapsed: Duration,
        error: impl Fn(PartitionKey) -> ShardError,
    ) -> Option<usize> {
        let mut inner = self.inner.lock();
        if inner.finalized {
            return None;
        }
        let mut closed = 0;
        for (slot, partition) in inner.slots.iter_mut().zip(&self.partitions) {
            if slot.is_none() {
                *slot = Some(PartitionOutcome {
                    partition: *partition,
                    result: Err(error(*partition)),
                    elapsed,
                });
                closed += 1;
            }
        }
        inner.status = ShardStatus::Failed;
        self.finalize(inner);
        Some(closed)
    }

    fn finalize(&self, mut inner: MutexGuard<'_, Inner<T>>) {
        inner.finalized = true;
        if inner.status == ShardStatus::Running {
            inner.status = ShardStatus::Done;
        }
        let status = inner.status;
        let listeners = std::mem::take(&mut inner.listeners);
        drop(inner);

        tracing::debug!(
            operation = %self.operation_id,
            status = ?status,
            elapsed_ms = self.created.elapsed().as_millis() as u64,
            "Aggregate finalized"
        );
        // Listeners run before waiters wake; a panicking one must not keep
        // the others or the wakeups from happening.
        for listener in listeners {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(status))) {
                tracing::error!(
                    operation = %self.operation_id,
                    panic = panic_message(&*payload),
                    "Completion listener panicked"
                );
            }
        }
        self.finished.notify_all();
        self.done_tx.send_replace(true);
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

impl<T: Clone> ShardResult<T> {
    /// Snapshot of the outcomes recorded so far.
    pub fn outcome(&self) -> AggregateOutcome<T> {
        let inner = self.shared.inner.lock();
        AggregateOutcome {
            operation_id: self.shared.operation_id,
            status: inner.status,
            partitions: inner.slots.iter().flatten().cloned().collect(),
            late: inner.late.clone(),
        }
    }

    /// Values of the partitions that succeeded so far, in partition order.
    pub fn successes(&self) -> Vec<(PartitionKey, T)> {
        let inner = self.shared.inner.lock();
        inner
            .slots
            .iter()
            .flatten()
            .filter_map(|o| o.result.as_ref().ok().map(|v| (o.partition, v.clone())))
            .collect()
    }

    /// Errors of the partitions that failed so far, in partition order.
    pub fn failures(&self) -> Vec<(PartitionKey, ShardError)> {
        let inner = self.shared.inner.lock();
        inner
            .slots
            .iter()
            .flatten()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.partition, e.clone())))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tessera_core::{MatrixId, PartitionId};

    fn keys(n: u32) -> Vec<PartitionKey> {
        (0..n)
            .map(|i| {
                PartitionKey::new(
                    MatrixId::new(0),
                    PartitionId::new(i),
                    0,
                    1,
                    i as u64 * 10,
                    i as u64 * 10 + 10,
                )
            })
            .collect()
    }

    fn unavailable(key: PartitionKey) -> ShardError {
        ShardError::PartitionUnavailable {
            partition: key,
            reason: "down".to_string(),
        }
    }

    #[test]
    fn test_all_success_is_done() {
        let result: ShardResult<u32> = ShardResult::new(OperationId::new(1), keys(3));
        assert_eq!(result.status(), ShardStatus::Running);
        for slot in [2, 0, 1] {
            assert!(!result.is_done());
            result.record(slot, Ok(slot as u32), Duration::from_millis(1));
        }
        assert!(result.is_done());
        assert_eq!(result.wait(), ShardStatus::Done);

        let outcome = result.outcome();
        assert_eq!(outcome.success_count(), 3);
        assert!(!outcome.contains_failures());
        let values: Vec<_> = outcome.successes().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![0, 1, 2]);
    }

    #[test]
    fn test_first_failure_latches_but_waits_for_all() {
        let parts = keys(4);
        let result: ShardResult<u32> = ShardResult::new(OperationId::new(2), parts.clone());
        result.record(2, Err(unavailable(parts[2])), Duration::ZERO);
        assert_eq!(result.status(), ShardStatus::Failed);
        assert!(!result.is_done());

        result.record(0, Ok(0), Duration::ZERO);
        result.record(3, Err(unavailable(parts[3])), Duration::ZERO);
        assert_eq!(result.status(), ShardStatus::Failed);
        result.record(1, Ok(1), Duration::ZERO);

        assert_eq!(result.wait(), ShardStatus::Failed);
        assert_eq!(result.successes().len(), 2);
        let failed: Vec<_> = result.failures().into_iter().map(|(k, _)| k).collect();
        assert_eq!(failed, vec![parts[2], parts[3]]);
    }

    #[test]
    fn test_empty_aggregate_is_done() {
        let result: ShardResult<()> = ShardResult::new(OperationId::new(3), Vec::new());
        assert!(result.is_done());
        assert_eq!(result.wait(), ShardStatus::Done);
    }

    #[test]
    fn test_expire_marks_timeouts_and_collects_late() {
        let parts = keys(3);
        let result: ShardResult<u32> = ShardResult::new(OperationId::new(4), parts.clone());
        result.record(0, Ok(10), Duration::ZERO);
        result.expire(Duration::from_millis(50));

        assert!(result.is_done());
        assert_eq!(result.status(), ShardStatus::Failed);
        let failures = result.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(
            failures[0].1,
            ShardError::Timeout {
                partition: parts[1],
                after_ms: 50
            }
        );

        result.record(1, Ok(11), Duration::from_millis(80));
        result.expire(Duration::from_millis(50));
        let outcome = result.into_outcome();
        assert_eq!(outcome.partitions.len(), 3);
        assert_eq!(outcome.late.len(), 1);
        assert_eq!(outcome.late[0].partition, parts[1]);
    }

    #[test]
    fn test_on_complete_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result: ShardResult<u32> = ShardResult::new(OperationId::new(5), keys(2));

        let c = Arc::clone(&calls);
        result.on_complete(move |status| {
            assert_eq!(status, ShardStatus::Done);
            c.fetch_add(1, Ordering::SeqCst);
        });
        result.record(0, Ok(0), Duration::ZERO);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        result.record(1, Ok(1), Duration::ZERO);
        result.expire(Duration::from_millis(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let c = Arc::clone(&calls);
        result.on_complete(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_wait_timeout() {
        let result: ShardResult<u32> = ShardResult::new(OperationId::new(6), keys(1));
        assert_eq!(result.wait_timeout(Duration::from_millis(20)), None);

        let recorder = result.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            recorder.record(0, Ok(1), Duration::from_millis(20));
        });
        assert_eq!(
            result.wait_timeout(Duration::from_secs(5)),
            Some(ShardStatus::Done)
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_blocks_until_other_threads_report() {
        let parts = keys(8);
        let result: ShardResult<usize> = ShardResult::new(OperationId::new(7), parts);
        let handles: Vec<_> = (0..8)
            .map(|slot| {
                let r = result.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis((8 - slot as u64) * 3));
                    r.record(slot, Ok(slot), Duration::ZERO);
                })
            })
            .collect();
        assert_eq!(result.wait(), ShardStatus::Done);
        assert_eq!(result.outstanding(), 0);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stall_waiters() {
        let result: ShardResult<u32> = ShardResult::new(OperationId::new(8), keys(1));
        let calls = Arc::new(AtomicUsize::new(0));
        result.on_complete(|_| panic!("listener failed"));
        let c = Arc::clone(&calls);
        result.on_complete(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let recorder = result.clone();
        std::thread::spawn(move || recorder.record(0, Ok(1), Duration::ZERO))
            .join()
            .unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), result.completed()).await;
        assert_eq!(status.ok(), Some(ShardStatus::Done));
        assert_eq!(
            result.wait_timeout(Duration::from_secs(1)),
            Some(ShardStatus::Done)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abandon_fills_outstanding_slots() {
        let parts = keys(3);
        let result: ShardResult<u32> = ShardResult::new(OperationId::new(9), parts.clone());
        result.record(1, Ok(1), Duration::ZERO);

        let tracker = result.tracker();
        let pending = tracker.upgrade().unwrap();
        assert!(!pending.wait_until(Instant::now() + Duration::from_millis(10)));
        pending.abandon("gone");
        assert!(pending.is_finalized());

        assert_eq!(result.wait(), ShardStatus::Failed);
        let failed: Vec<_> = result.failures().into_iter().map(|(k, _)| k).collect();
        assert_eq!(failed, vec![parts[0], parts[2]]);

        drop(pending);
        drop(result);
        assert!(tracker.upgrade().is_none());
    }
}
