//! # irods-repl
//!
//! Cohort-batched bulk operations over an iRODS data grid.
//!
//! This library selects data objects from the iRODS catalog that still need
//! an operation, groups them by size into cohorts that share a transfer
//! thread count, and drives the iCommands tools over each cohort with a
//! bounded worker pool:
//!
//! - **Replicate** objects that lack a good replica on a destination resource
//! - **Checksum** replicas whose checksum was never computed
//! - **Move** replicas from one resource to another
//!
//! Runs honour an optional wall-clock deadline, tolerate per-batch failures
//! and stop early when the grid becomes unreachable.
//!
//! ## Example
//!
//! ```rust,no_run
//! use irods_repl::{Config, Operation, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> irods_repl::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config, Operation::Replicate).await?;
//!     let result = orchestrator.run(false).await?;
//!     println!("Completed {}/{} objects", result.completed, result.attempted);
//!     Ok(())
//! }
//! ```

pub mod breaker;
pub mod catalog;
pub mod cohort;
pub mod config;
pub mod context;
pub mod deadline;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod operation;
pub mod orchestrator;
pub mod progress;

// Re-exports for convenient access
pub use catalog::{Candidate, CatalogSource, PgCatalog, SelectionFilter};
pub use cohort::{partition, Cohort, CohortKind, CohortPolicy};
pub use config::{CatalogConfig, Config, ExecutorConfig, ReplicationConfig};
pub use context::{RunContext, StopReason};
pub use deadline::{Clock, Deadline, ManualClock, SystemClock};
pub use error::{ReplError, Result};
pub use executor::{BatchStatus, CommandExecutor, TransferExecutor, TransferInvocation};
pub use operation::Operation;
pub use orchestrator::{CohortSummary, HealthCheckResult, Orchestrator, ReplResult, RunStatus};
pub use progress::{
    CompletionEvent, JsonReporter, LineReporter, LogWriter, NullReporter, ProgressSnapshot,
    Reporter,
};
