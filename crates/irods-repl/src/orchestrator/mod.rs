//! Run orchestrator - coordinates selection, partitioning and dispatch.

use crate::catalog::{CatalogSource, PgCatalog, SelectionFilter};
use crate::cohort::{partition, Cohort, CohortKind, CohortPolicy};
use crate::config::{validate_for_operation, Config};
use crate::context::{RunContext, StopReason};
use crate::deadline::{Clock, Deadline, SystemClock};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{ReplError, Result};
use crate::executor::{CommandExecutor, TransferExecutor};
use crate::operation::Operation;
use crate::progress::{CohortProgress, NullReporter, ProgressAggregator, Reporter};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Run orchestrator.
pub struct Orchestrator {
    config: Config,
    operation: Operation,
    catalog: Arc<dyn CatalogSource>,
    executor: Arc<dyn TransferExecutor>,
    reporter: Arc<dyn Reporter>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    OutOfTime,
    CircuitOpen,
    Cancelled,
}

impl From<StopReason> for RunStatus {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::OutOfTime => RunStatus::OutOfTime,
            StopReason::CircuitOpen => RunStatus::CircuitOpen,
            StopReason::Cancelled => RunStatus::Cancelled,
        }
    }
}

/// Per-cohort line of the run report.
#[derive(Debug, Clone, Serialize)]
pub struct CohortSummary {
    pub label: String,
    pub kind: CohortKind,
    pub threads: usize,
    pub min_size: u64,
    pub max_size: Option<u64>,
    pub objects: usize,
    pub bytes: u64,
    /// Whether dispatch reached this cohort.
    pub dispatched: bool,
    pub batches: usize,
    pub failed_batches: usize,
    pub skipped_batches: usize,
    pub attempted: u64,
    pub completed: u64,
}

impl CohortSummary {
    fn planned(cohort: &Cohort) -> Self {
        Self {
            label: cohort.label(),
            kind: cohort.kind,
            threads: cohort.threads,
            min_size: cohort.min_size,
            max_size: cohort.max_size,
            objects: cohort.len(),
            bytes: cohort.total_bytes(),
            dispatched: false,
            batches: 0,
            failed_batches: 0,
            skipped_batches: 0,
            attempted: 0,
            completed: 0,
        }
    }

    fn record(&mut self, outcome: &DispatchOutcome, progress: &CohortProgress) {
        self.dispatched = true;
        self.batches = outcome.dispatched_batches;
        self.failed_batches = outcome.failed_batches;
        self.skipped_batches = outcome.skipped_batches;
        self.attempted = outcome.attempted;
        self.completed = progress.completed;
    }
}

/// Result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct ReplResult {
    /// Unique run identifier.
    pub run_id: String,

    pub operation: Operation,

    /// Final status.
    pub status: RunStatus,

    /// Whether this was a plan-only run.
    pub dry_run: bool,

    /// Hash of the scheduling configuration.
    pub config_hash: String,

    pub deadline: Option<DateTime<Utc>>,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Objects selected from the catalog.
    pub candidates: u64,

    /// Objects handed to the executor.
    pub attempted: u64,

    /// Objects the executor reported as done.
    pub completed: u64,

    /// Batches that failed.
    pub failed_batches: usize,

    /// Consecutive connection failures when the run ended.
    pub connection_failures: u32,

    /// Cohort plan and per-cohort counts, in processing order.
    pub cohorts: Vec<CohortSummary>,
}

impl ReplResult {
    /// Convert result to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Map a finished run to the error the process should exit with, if any.
    /// Running out of time is a normal end.
    pub fn check(&self) -> Result<()> {
        match self.status {
            RunStatus::Completed | RunStatus::OutOfTime => Ok(()),
            RunStatus::CircuitOpen => Err(ReplError::CircuitOpen {
                failures: self.connection_failures,
                attempted: self.attempted,
                completed: self.completed,
            }),
            RunStatus::Cancelled => Err(ReplError::Cancelled),
        }
    }
}

/// Result of a connectivity check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub catalog_connected: bool,
    pub catalog_latency_ms: u64,
    pub catalog_error: Option<String>,
    pub executor_program: String,
    pub executor_found: bool,
    pub healthy: bool,
}

impl Orchestrator {
    /// Connect to the catalog and set up the command-line executor.
    pub async fn new(config: Config, operation: Operation) -> Result<Self> {
        let catalog = PgCatalog::new(&config.catalog).await?;
        let executor = CommandExecutor::new(config.executor.clone());
        Ok(Self::with_components(
            config,
            operation,
            Arc::new(catalog),
            Arc::new(executor),
        ))
    }

    /// Build an orchestrator around existing collaborators.
    pub fn with_components(
        config: Config,
        operation: Operation,
        catalog: Arc<dyn CatalogSource>,
        executor: Arc<dyn TransferExecutor>,
    ) -> Self {
        Self {
            config,
            operation,
            catalog,
            executor,
            reporter: Arc::new(NullReporter),
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
        }
    }

    /// Send progress updates to `reporter`.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Measure the deadline and age cutoff against `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Stop dispatching once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Select, partition and dispatch. With `dry_run` only the plan is built.
    pub async fn run(self, dry_run: bool) -> Result<ReplResult> {
        validate_for_operation(&self.config, self.operation)?;

        let settings = &self.config.replication;
        let deadline = Deadline::with_clock(settings.until, self.clock.clone());
        if deadline.is_expired() {
            return Err(ReplError::DeadlinePassed(deadline.to_string()));
        }

        let started_at = Utc::now();
        let timer = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Starting {} run {} (deadline: {})",
            self.operation, run_id, deadline
        );

        // Phase 1: select
        let filter = SelectionFilter::from_config(self.operation, settings, self.clock.now());
        let candidates = self.catalog.select_candidates(&filter).await?;
        let total = candidates.len() as u64;
        info!("Selected {} objects", total);

        // Phase 2: partition
        let max_threads = if self.operation.uses_transfer_threads() {
            settings.get_max_threads()
        } else {
            1
        };
        let policy = CohortPolicy::new(settings.get_buffer_size_bytes(), max_threads);
        let cohorts = partition(candidates, &policy);
        let mut summaries: Vec<CohortSummary> = cohorts.iter().map(CohortSummary::planned).collect();

        let mut result = ReplResult {
            run_id,
            operation: self.operation,
            status: RunStatus::Completed,
            dry_run,
            config_hash: self.config.hash(),
            deadline: deadline.at(),
            started_at,
            completed_at: started_at,
            duration_seconds: 0.0,
            candidates: total,
            attempted: 0,
            completed: 0,
            failed_batches: 0,
            connection_failures: 0,
            cohorts: Vec::new(),
        };

        if dry_run {
            for cohort in cohorts.iter().filter(|c| !c.is_empty()) {
                info!(
                    "[dry-run] {}: {} objects, {} bytes",
                    cohort,
                    cohort.len(),
                    cohort.total_bytes()
                );
            }
            result.cohorts = summaries;
            result.completed_at = Utc::now();
            result.duration_seconds = timer.elapsed().as_secs_f64();
            return Ok(result);
        }

        // Phase 3: dispatch cohorts in order
        let ctx = Arc::new(RunContext::new(
            self.operation,
            settings.clone(),
            deadline,
            self.cancel.clone(),
        ));
        let dispatcher = Dispatcher::new(ctx.clone(), self.executor.clone(), max_threads);
        let mut global_completed = 0u64;

        for (cohort, summary) in cohorts.iter().zip(summaries.iter_mut()) {
            if cohort.is_empty() {
                continue;
            }
            if let Some(reason) = ctx.stop_reason() {
                result.status = reason.into();
                break;
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let aggregator =
                ProgressAggregator::new(cohort, global_completed, total, self.reporter.clone());
            let counting = tokio::spawn(aggregator.run(rx));

            let outcome = dispatcher.run_cohort(cohort, tx).await;
            let progress = counting
                .await
                .map_err(|e| ReplError::Executor(format!("progress aggregator failed: {}", e)))?;

            global_completed = progress.global_completed;
            summary.record(&outcome, &progress);
            result.attempted += outcome.attempted;
            result.failed_batches += outcome.failed_batches;

            info!(
                "Cohort {}: {}/{} completed, {} failed batches",
                cohort, progress.completed, progress.total, outcome.failed_batches
            );

            if let Some(reason) = outcome.stopped {
                result.status = reason.into();
                break;
            }
        }

        // The breaker may trip on the very last batches, and the executor may
        // skip them once the deadline passes mid-cohort
        if result.status == RunStatus::Completed {
            if ctx.breaker.is_open() {
                result.status = RunStatus::CircuitOpen;
            } else if summaries.iter().any(|s| s.skipped_batches > 0) {
                result.status = RunStatus::OutOfTime;
            }
        }

        result.completed = global_completed;
        result.connection_failures = ctx.breaker.consecutive_failures();
        result.cohorts = summaries;
        result.completed_at = Utc::now();
        result.duration_seconds = timer.elapsed().as_secs_f64();

        match result.status {
            RunStatus::Completed => info!(
                "Run {} finished: {}/{} completed",
                result.run_id, result.completed, result.attempted
            ),
            RunStatus::OutOfTime => info!(
                "out of time: {}/{} completed before {}",
                result.completed, result.attempted, ctx.deadline
            ),
            RunStatus::CircuitOpen => error!(
                "Run {} halted by circuit breaker: {}/{} completed",
                result.run_id, result.completed, result.attempted
            ),
            RunStatus::Cancelled => warn!(
                "Run {} cancelled: {}/{} completed",
                result.run_id, result.completed, result.attempted
            ),
        }

        Ok(result)
    }

    /// Check catalog connectivity and that the transfer tool can be found.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let timer = Instant::now();
        let (catalog_connected, catalog_error) = match self.catalog.test_connection().await {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        let catalog_latency_ms = timer.elapsed().as_millis() as u64;

        let executor_program = match self.operation {
            Operation::Replicate => &self.config.executor.replicate_program,
            Operation::Checksum => &self.config.executor.checksum_program,
            Operation::Move => &self.config.executor.move_program,
        }
        .clone();
        let executor_found = program_exists(&executor_program);

        Ok(HealthCheckResult {
            catalog_connected,
            catalog_latency_ms,
            catalog_error,
            healthy: catalog_connected && executor_found,
            executor_program,
            executor_found,
        })
    }
}

/// Whether `program` names an existing file, directly or via `PATH`.
fn program_exists(program: &str) -> bool {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(program).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}
