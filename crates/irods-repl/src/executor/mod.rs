//! Transfer executor contract.
//!
//! An executor performs one batch. It reports every object it finished
//! successfully on the completion channel as soon as it knows, then returns
//! the batch's overall status. Objects that were not reported are not
//! counted, so a partially successful batch is represented exactly.

mod command;

pub use command::CommandExecutor;

use crate::deadline::Deadline;
use crate::error::Result;
use crate::operation::Operation;
use crate::progress::CompletionSender;
use async_trait::async_trait;

/// Everything an executor needs to run one batch.
#[derive(Debug, Clone)]
pub struct TransferInvocation {
    pub operation: Operation,

    /// Sequence number within the cohort, for log correlation.
    pub batch_id: usize,

    /// Logical paths of the batch members.
    pub paths: Vec<String>,

    pub dest_resc: Option<String>,

    pub src_resc: Option<String>,

    /// Transfer threads per object.
    pub threads: usize,

    /// The run's deadline; executors may re-check it before starting.
    pub deadline: Deadline,
}

/// How a batch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatus {
    /// The tool exited successfully.
    Succeeded,

    /// The tool reached the servers but reported an error.
    Failed { code: Option<i32>, message: String },

    /// The tool could not reach the servers.
    Unreachable { message: String },

    /// Not started because the deadline had passed.
    Skipped,
}

impl BatchStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchStatus::Succeeded)
    }

    /// Whether the failure should count towards the circuit breaker.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, BatchStatus::Unreachable { .. })
    }
}

/// Performs one batch of the operation.
///
/// An `Err` means the executor itself could not run (e.g. the transfer tool
/// could not be started); the dispatcher treats it like an unreachable
/// server.
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    async fn execute(
        &self,
        invocation: &TransferInvocation,
        completions: &CompletionSender,
    ) -> Result<BatchStatus>;
}
