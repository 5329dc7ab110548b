//! Bounded-concurrency dispatch of one cohort.
//!
//! A cohort's members are chunked into batches and each batch is handed to
//! the transfer executor from its own task. A semaphore caps how many batches
//! run at once. Before a batch is accepted, both before and after waiting for
//! a permit, the run context is consulted: once the deadline has passed, the
//! breaker has tripped or the run was cancelled, no further batch starts.
//! Batches already running are left to finish.

use crate::breaker::CircuitBreaker;
use crate::cohort::Cohort;
use crate::context::{RunContext, StopReason};
use crate::executor::{BatchStatus, TransferExecutor, TransferInvocation};
use crate::progress::CompletionSender;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Pool and batch sizes for one cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchLimits {
    /// Maximum concurrent executor invocations.
    pub max_procs: usize,

    /// Maximum objects per invocation.
    pub max_batch_size: usize,
}

impl DispatchLimits {
    /// Limits for a cohort whose objects use `threads` transfer threads each.
    ///
    /// Concurrency shrinks linearly with the thread count so the total number
    /// of transfer threads stays near `max_threads * multiplier`; batch size
    /// shrinks quadratically so large objects go out in small groups.
    pub fn for_threads(
        threads: usize,
        max_threads: usize,
        multiplier: f64,
        max_objects_per_invocation: usize,
    ) -> Self {
        let threads = threads.max(1);
        let procs = (max_threads as f64 * multiplier / threads as f64).ceil();
        let max_procs = if procs.is_finite() && procs >= 1.0 {
            procs as usize
        } else {
            1
        };
        let max_batch_size = max_objects_per_invocation
            .div_ceil(threads.saturating_mul(threads))
            .max(1);
        Self {
            max_procs,
            max_batch_size,
        }
    }
}

/// What happened while dispatching one cohort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Batches handed to the executor.
    pub dispatched_batches: usize,

    /// Objects in batches the executor actually ran.
    pub attempted: u64,

    /// Batches that ended in any kind of failure.
    pub failed_batches: usize,

    /// Batches the executor declined to start (deadline).
    pub skipped_batches: usize,

    /// Set when dispatch stopped with batches left over.
    pub stopped: Option<StopReason>,
}

/// Runs cohorts through the transfer executor.
pub struct Dispatcher {
    ctx: Arc<RunContext>,
    executor: Arc<dyn TransferExecutor>,
    max_threads: usize,
}

impl Dispatcher {
    /// `max_threads` is the thread count of the largest cohort in the plan.
    pub fn new(ctx: Arc<RunContext>, executor: Arc<dyn TransferExecutor>, max_threads: usize) -> Self {
        Self {
            ctx,
            executor,
            max_threads: max_threads.max(1),
        }
    }

    pub fn limits_for(&self, cohort: &Cohort) -> DispatchLimits {
        DispatchLimits::for_threads(
            cohort.threads,
            self.max_threads,
            self.ctx.settings.get_multiplier(),
            self.ctx.settings.get_max_objects_per_invocation(),
        )
    }

    /// Dispatch every batch of `cohort` and wait for them to finish.
    ///
    /// `completions` is dropped once the last batch returns, which closes the
    /// cohort's completion stream.
    pub async fn run_cohort(&self, cohort: &Cohort, completions: CompletionSender) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        if cohort.is_empty() {
            debug!("Cohort {} is empty, skipping", cohort);
            return outcome;
        }

        let limits = self.limits_for(cohort);
        info!(
            "Cohort {}: {} objects, up to {} per batch, {} concurrent",
            cohort,
            cohort.len(),
            limits.max_batch_size,
            limits.max_procs
        );

        let semaphore = Arc::new(Semaphore::new(limits.max_procs));
        let mut handles = Vec::new();

        for (idx, chunk) in cohort.members.chunks(limits.max_batch_size).enumerate() {
            if let Some(reason) = self.ctx.stop_reason() {
                outcome.stopped = Some(reason);
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = self.ctx.cancel.cancelled() => {
                    outcome.stopped = Some(StopReason::Cancelled);
                    break;
                }
            };

            // The wait may have been long
            if let Some(reason) = self.ctx.stop_reason() {
                outcome.stopped = Some(reason);
                break;
            }

            let invocation = TransferInvocation {
                operation: self.ctx.operation,
                batch_id: idx + 1,
                paths: chunk.iter().map(|c| c.path.clone()).collect(),
                dest_resc: self.ctx.settings.dest_resc.clone(),
                src_resc: self.ctx.settings.src_resc.clone(),
                threads: cohort.threads,
                deadline: self.ctx.deadline.clone(),
            };
            outcome.dispatched_batches += 1;

            let executor = self.executor.clone();
            let breaker = self.ctx.breaker.clone();
            let tx = completions.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let status = run_batch(executor.as_ref(), &invocation, &tx, &breaker).await;
                (invocation.paths.len() as u64, status)
            });
            handles.push(handle);
        }
        drop(completions);

        if let Some(reason) = outcome.stopped {
            warn!("Cohort {}: dispatch stopped ({:?})", cohort, reason);
        }

        for handle in handles {
            match handle.await {
                Ok((_, BatchStatus::Skipped)) => outcome.skipped_batches += 1,
                Ok((objects, status)) => {
                    outcome.attempted += objects;
                    if !status.is_success() {
                        outcome.failed_batches += 1;
                    }
                }
                Err(e) => {
                    error!("Cohort {}: batch task panicked - {}", cohort, e);
                    outcome.failed_batches += 1;
                }
            }
        }

        outcome
    }
}

/// Run one batch and feed the result to the breaker.
async fn run_batch(
    executor: &dyn TransferExecutor,
    invocation: &TransferInvocation,
    completions: &CompletionSender,
    breaker: &CircuitBreaker,
) -> BatchStatus {
    let status = match executor.execute(invocation, completions).await {
        Ok(status) => status,
        Err(e) => BatchStatus::Unreachable {
            message: e.to_string(),
        },
    };

    match &status {
        BatchStatus::Succeeded => {
            debug!("Batch {}: {} objects done", invocation.batch_id, invocation.paths.len());
            breaker.record_reachable();
        }
        BatchStatus::Failed { code, message } => {
            let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
            error!(
                "Batch {} failed (exit {}, {} objects): {}",
                invocation.batch_id,
                code,
                invocation.paths.len(),
                message
            );
            breaker.record_reachable();
        }
        BatchStatus::Unreachable { message } => {
            error!("Batch {} could not reach the grid: {}", invocation.batch_id, message);
            if breaker.record_connection_failure() {
                error!(
                    "Circuit breaker open after {} consecutive connection failures, halting dispatch",
                    breaker.threshold()
                );
            }
        }
        BatchStatus::Skipped => debug!("Batch {} skipped", invocation.batch_id),
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Candidate;
    use crate::cohort::{partition, CohortPolicy};
    use crate::config::ReplicationConfig;
    use crate::deadline::Deadline;
    use crate::error::Result;
    use crate::operation::Operation;
    use crate::progress::{CompletionEvent, NullReporter, ProgressAggregator};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    type Behavior = Box<dyn Fn(&TransferInvocation, &CompletionSender) -> BatchStatus + Send + Sync>;

    /// Executor that records concurrency and delegates the outcome to a closure.
    struct MockExecutor {
        behavior: Behavior,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        batches: Mutex<Vec<usize>>,
    }

    impl MockExecutor {
        fn new(
            behavior: impl Fn(&TransferInvocation, &CompletionSender) -> BatchStatus + Send + Sync + 'static,
        ) -> Self {
            Self {
                behavior: Box::new(behavior),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                batches: Mutex::new(Vec::new()),
            }
        }

        fn succeed_all() -> Self {
            Self::new(|inv, tx| {
                for p in &inv.paths {
                    tx.send(CompletionEvent::new(p.clone())).unwrap();
                }
                BatchStatus::Succeeded
            })
        }
    }

    #[async_trait]
    impl TransferExecutor for MockExecutor {
        async fn execute(
            &self,
            invocation: &TransferInvocation,
            completions: &CompletionSender,
        ) -> Result<BatchStatus> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.batches.lock().unwrap().push(invocation.paths.len());
            tokio::time::sleep(Duration::from_millis(5)).await;
            let status = (self.behavior)(invocation, completions);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(status)
        }
    }

    fn context(settings: ReplicationConfig, deadline: Deadline) -> Arc<RunContext> {
        Arc::new(RunContext::new(
            Operation::Replicate,
            settings,
            deadline,
            CancellationToken::new(),
        ))
    }

    /// One sized cohort with `n` one-byte members.
    fn cohort(n: usize, threads: usize) -> Cohort {
        let candidates = (0..n)
            .map(|i| Candidate::new(format!("/z/obj{}", i), threads as u64 * 10 - 5))
            .collect();
        partition(candidates, &CohortPolicy::new(10, threads)).remove(threads - 1)
    }

    #[test]
    fn test_limits() {
        assert_eq!(
            DispatchLimits::for_threads(1, 16, 1.0, 100),
            DispatchLimits { max_procs: 16, max_batch_size: 100 }
        );
        assert_eq!(
            DispatchLimits::for_threads(4, 16, 1.0, 100),
            DispatchLimits { max_procs: 4, max_batch_size: 7 }
        );
        assert_eq!(
            DispatchLimits::for_threads(16, 16, 1.5, 100),
            DispatchLimits { max_procs: 2, max_batch_size: 1 }
        );
    }

    #[test]
    fn test_limits_never_below_one() {
        let limits = DispatchLimits::for_threads(16, 16, 0.01, 1);
        assert_eq!(limits.max_procs, 1);
        assert_eq!(limits.max_batch_size, 1);

        let limits = DispatchLimits::for_threads(0, 0, 0.0, 0);
        assert_eq!(limits.max_procs, 1);
        assert_eq!(limits.max_batch_size, 1);
    }

    #[tokio::test]
    async fn test_concurrency_capped_at_max_procs() {
        let settings = ReplicationConfig {
            max_objects_per_invocation: Some(64),
            ..Default::default()
        };
        let ctx = context(settings, Deadline::none());
        let executor = Arc::new(MockExecutor::succeed_all());
        let dispatcher = Dispatcher::new(ctx, executor.clone(), 16);

        // 8 threads of 16: 2 concurrent, 1 object per batch
        let c = cohort(10, 8);
        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = dispatcher.run_cohort(&c, tx).await;

        assert_eq!(outcome.dispatched_batches, 10);
        assert_eq!(outcome.attempted, 10);
        assert_eq!(outcome.failed_batches, 0);
        let max = executor.max_in_flight.load(Ordering::SeqCst);
        assert!(max >= 1 && max <= 2, "max in flight was {}", max);
    }

    #[tokio::test]
    async fn test_partial_batch_failure_counts_reported_objects() {
        let ctx = context(ReplicationConfig::default(), Deadline::none());
        let executor = Arc::new(MockExecutor::new(|inv, tx| {
            for p in inv.paths.iter().take(9) {
                tx.send(CompletionEvent::new(p.clone())).unwrap();
            }
            BatchStatus::Failed {
                code: Some(1),
                message: "remote error".into(),
            }
        }));
        let dispatcher = Dispatcher::new(ctx.clone(), executor.clone(), 16);

        let c = cohort(10, 1);
        let (tx, rx) = mpsc::unbounded_channel();
        let aggregator = ProgressAggregator::new(&c, 0, 10, Arc::new(NullReporter));
        let counting = tokio::spawn(aggregator.run(rx));
        let outcome = dispatcher.run_cohort(&c, tx).await;
        let progress = counting.await.unwrap();

        assert_eq!(*executor.batches.lock().unwrap(), vec![10]);
        assert_eq!(outcome.failed_batches, 1);
        assert_eq!(outcome.attempted, 10);
        assert_eq!(progress.completed, 9);
        assert_eq!(progress.global_completed, 9);
        assert!(ctx.breaker.can_dispatch());
    }

    #[tokio::test]
    async fn test_breaker_halts_dispatch() {
        let settings = ReplicationConfig {
            max_threads: Some(1),
            max_objects_per_invocation: Some(1),
            breaker_threshold: Some(3),
            ..Default::default()
        };
        let ctx = context(settings, Deadline::none());
        let executor = Arc::new(MockExecutor::new(|_, _| BatchStatus::Unreachable {
            message: "SYS_SOCK_CONNECT_ERR".into(),
        }));
        let dispatcher = Dispatcher::new(ctx.clone(), executor.clone(), 1);

        let c = cohort(10, 1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = dispatcher.run_cohort(&c, tx).await;

        assert_eq!(executor.batches.lock().unwrap().len(), 3);
        assert_eq!(outcome.failed_batches, 3);
        assert_eq!(outcome.stopped, Some(StopReason::CircuitOpen));
        assert!(ctx.breaker.is_open());
    }

    #[tokio::test]
    async fn test_expired_deadline_dispatches_nothing() {
        let deadline = Deadline::new(Some(Utc::now() - ChronoDuration::seconds(1)));
        let ctx = context(ReplicationConfig::default(), deadline);
        let executor = Arc::new(MockExecutor::succeed_all());
        let dispatcher = Dispatcher::new(ctx, executor.clone(), 16);

        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = dispatcher.run_cohort(&cohort(5, 1), tx).await;

        assert!(executor.batches.lock().unwrap().is_empty());
        assert_eq!(outcome.stopped, Some(StopReason::OutOfTime));
        assert_eq!(outcome.attempted, 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_dispatches_nothing() {
        let ctx = context(ReplicationConfig::default(), Deadline::none());
        ctx.cancel.cancel();
        let executor = Arc::new(MockExecutor::succeed_all());
        let dispatcher = Dispatcher::new(ctx, executor.clone(), 16);

        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = dispatcher.run_cohort(&cohort(5, 1), tx).await;

        assert!(executor.batches.lock().unwrap().is_empty());
        assert_eq!(outcome.stopped, Some(StopReason::Cancelled));
    }

    #[tokio::test]
    async fn test_empty_cohort_never_calls_executor() {
        let ctx = context(ReplicationConfig::default(), Deadline::none());
        let executor = Arc::new(MockExecutor::succeed_all());
        let dispatcher = Dispatcher::new(ctx, executor.clone(), 16);

        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = dispatcher.run_cohort(&cohort(0, 1), tx).await;

        assert_eq!(outcome, DispatchOutcome::default());
        assert!(executor.batches.lock().unwrap().is_empty());
    }
}
