//! Concurrent dispatch of partition sub-requests.
//!
//! Every sub-request becomes an async task that first acquires a permit from
//! a semaphore sized to `max_workers`, then runs the synchronous partition
//! executor on the blocking pool. At most `max_workers` executors run at
//! once; the rest queue on the semaphore. The caller gets a [`ShardResult`]
//! back immediately.

use crate::request::PartitionSubRequest;
use crate::result::{PendingAggregate, ShardResult, panic_message};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tessera_core::{OperationId, PartitionKey, Result, ShardError};
use tessera_storage::config::DispatchConfig;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Semaphore;

/// Error type returned by partition executors.
pub type ExecutorError = Box<dyn std::error::Error + Send + Sync>;

/// Executes one sub-request against the partition that owns it.
///
/// Implementations are called from blocking worker threads and may block.
/// Returning a [`ShardError`] passes it through unchanged; any other error is
/// recorded as [`ShardError::PartitionUnavailable`].
pub trait PartitionExecutor<T>: Send + Sync {
    fn execute(&self, request: &PartitionSubRequest) -> std::result::Result<T, ExecutorError>;
}

impl<T, F> PartitionExecutor<T> for F
where
    F: Fn(&PartitionSubRequest) -> std::result::Result<T, ExecutorError> + Send + Sync,
{
    fn execute(&self, request: &PartitionSubRequest) -> std::result::Result<T, ExecutorError> {
        self(request)
    }
}

/// Submits sub-requests to a bounded worker pool.
pub struct ShardDispatcher {
    runtime: Option<Runtime>,
    handle: Handle,
    permits: Arc<Semaphore>,
    max_workers: usize,
    default_timeout: Option<Duration>,
    /// Aggregates dispatched here that may still be running.
    live: Mutex<Vec<Weak<dyn PendingAggregate>>>,
}

impl ShardDispatcher {
    /// Creates a dispatcher that owns a multi-threaded runtime.
    pub fn new(config: &DispatchConfig) -> Result<Self> {
        let max_workers = config.max_workers.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(max_workers.min(4))
            .max_blocking_threads(max_workers)
            .thread_name(config.thread_name.clone())
            .enable_time()
            .build()
            .map_err(|e| ShardError::Runtime(e.to_string()))?;
        let handle = runtime.handle().clone();

        tracing::info!(
            max_workers,
            thread_name = %config.thread_name,
            "Shard dispatcher started"
        );
        Ok(Self {
            runtime: Some(runtime),
            handle,
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            default_timeout: config.default_timeout(),
            live: Mutex::new(Vec::new()),
        })
    }

    /// Creates a dispatcher that spawns onto an existing runtime.
    pub fn with_handle(handle: Handle, config: &DispatchConfig) -> Self {
        let max_workers = config.max_workers.max(1);
        Self {
            runtime: None,
            handle,
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            default_timeout: config.default_timeout(),
            live: Mutex::new(Vec::new()),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Dispatches with the configured default deadline, if any.
    pub fn dispatch<T: Send + 'static>(
        &self,
        sub_requests: Vec<PartitionSubRequest>,
        executor: Arc<dyn PartitionExecutor<T>>,
    ) -> ShardResult<T> {
        self.submit(sub_requests, executor, self.default_timeout)
    }

    /// Dispatches with an explicit deadline. Partitions still outstanding when
    /// it expires are recorded as [`ShardError::Timeout`].
    pub fn dispatch_with_timeout<T: Send + 'static>(
        &self,
        sub_requests: Vec<PartitionSubRequest>,
        executor: Arc<dyn PartitionExecutor<T>>,
        timeout: Duration,
    ) -> ShardResult<T> {
        self.submit(sub_requests, executor, Some(timeout))
    }

    fn submit<T: Send + 'static>(
        &self,
        sub_requests: Vec<PartitionSubRequest>,
        executor: Arc<dyn PartitionExecutor<T>>,
        timeout: Option<Duration>,
    ) -> ShardResult<T> {
        let operation_id = sub_requests
            .first()
            .map(|s| s.operation_id)
            .unwrap_or_else(OperationId::next);
        let partitions: Vec<PartitionKey> = sub_requests.iter().map(|s| s.partition).collect();
        let result = ShardResult::new(operation_id, partitions);
        {
            let mut live = self.live.lock();
            live.retain(|agg| agg.upgrade().is_some_and(|a| !a.is_finalized()));
            live.push(result.tracker());
        }

        tracing::debug!(
            operation = %operation_id,
            sub_requests = sub_requests.len(),
            timeout_ms = timeout.map(|t| t.as_millis() as u64),
            "Dispatching"
        );

        for (slot, sub) in sub_requests.into_iter().enumerate() {
            let permits = Arc::clone(&self.permits);
            let executor = Arc::clone(&executor);
            let result = result.clone();
            self.handle.spawn(async move {
                let partition = sub.partition;
                let Ok(_permit) = permits.acquire_owned().await else {
                    result.record(
                        slot,
                        Err(ShardError::PartitionUnavailable {
                            partition,
                            reason: "dispatcher is shut down".to_string(),
                        }),
                        Duration::ZERO,
                    );
                    return;
                };
                if result.is_cancelled() {
                    result.record(slot, Err(ShardError::Cancelled { partition }), Duration::ZERO);
                    return;
                }
                if result.is_finalized() {
                    return;
                }

                let started = Instant::now();
                let joined = tokio::task::spawn_blocking(move || executor.execute(&sub)).await;
                let outcome = match joined {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(attribute(partition, err)),
                    Err(join_err) => Err(ShardError::PartitionUnavailable {
                        partition,
                        reason: match join_err.try_into_panic() {
                            Ok(payload) => format!("executor panicked: {}", panic_message(&*payload)),
                            Err(err) => err.to_string(),
                        },
                    }),
                };
                result.record(slot, outcome, started.elapsed());
            });
        }

        if let Some(timeout) = timeout {
            let watcher = result.clone();
            self.handle.spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => watcher.expire(timeout),
                    _ = watcher.completed() => {}
                }
            });
        }

        result
    }

    /// Stops the dispatcher, waiting up to `timeout` for running executors.
    ///
    /// Queued sub-requests are recorded as unavailable without running.
    /// Aggregates still outstanding when `timeout` expires are closed with
    /// [`ShardError::PartitionUnavailable`], so every waiter returns. An
    /// owned runtime is shut down; a borrowed one is left running.
    pub fn shutdown(mut self, timeout: Duration) {
        self.close(timeout);
    }

    fn close(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        self.permits.close();

        let live: Vec<Arc<dyn PendingAggregate>> = self
            .live
            .lock()
            .drain(..)
            .filter_map(|agg| agg.upgrade())
            .collect();
        tracing::info!(
            timeout_ms = timeout.as_millis() as u64,
            in_flight = live.len(),
            "Shutting down shard dispatcher"
        );
        for aggregate in &live {
            if !aggregate.wait_until(deadline) {
                aggregate.abandon("dispatcher shut down before the partition reported");
            }
        }

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(deadline.saturating_duration_since(Instant::now()));
        }
    }
}

impl Drop for ShardDispatcher {
    fn drop(&mut self) {
        // Borrowed runtimes keep driving their tasks after the dispatcher is gone.
        if self.runtime.is_some() {
            self.close(Duration::ZERO);
        }
    }
}

impl std::fmt::Debug for ShardDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardDispatcher")
            .field("max_workers", &self.max_workers)
            .field("available_permits", &self.permits.available_permits())
            .field("owns_runtime", &self.runtime.is_some())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

fn attribute(partition: PartitionKey, err: ExecutorError) -> ShardError {
    match err.downcast::<ShardError>() {
        Ok(shard_err) => *shard_err,
        Err(other) => ShardError::PartitionUnavailable {
            partition,
            reason: other.to_string(),
        },
    }
}

// =============================================================================
// Tests
// =============================================================================
