//! Shared state for one run.

use crate::breaker::CircuitBreaker;
use crate::config::ReplicationConfig;
use crate::deadline::Deadline;
use crate::operation::Operation;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Why dispatch stopped before running out of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The deadline passed.
    OutOfTime,
    /// The circuit breaker tripped.
    CircuitOpen,
    /// SIGINT/SIGTERM or an explicit cancel.
    Cancelled,
}

/// Everything the dispatch components share during a run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub operation: Operation,
    pub settings: ReplicationConfig,
    pub deadline: Deadline,
    pub cancel: CancellationToken,
    pub breaker: Arc<CircuitBreaker>,
}

impl RunContext {
    pub fn new(
        operation: Operation,
        settings: ReplicationConfig,
        deadline: Deadline,
        cancel: CancellationToken,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(settings.get_breaker_threshold()));
        Self {
            operation,
            settings,
            deadline,
            cancel,
            breaker,
        }
    }

    /// The first reason to stop dispatching, if any. Cancellation wins over
    /// the breaker, which wins over the deadline.
    pub fn stop_reason(&self) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            Some(StopReason::Cancelled)
        } else if self.breaker.is_open() {
            Some(StopReason::CircuitOpen)
        } else if self.deadline.is_expired() {
            Some(StopReason::OutOfTime)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn context(deadline: Deadline) -> RunContext {
        let settings = ReplicationConfig {
            breaker_threshold: Some(1),
            ..Default::default()
        };
        RunContext::new(Operation::Replicate, settings, deadline, CancellationToken::new())
    }

    #[test]
    fn test_no_stop_reason_by_default() {
        assert_eq!(context(Deadline::none()).stop_reason(), None);
    }

    #[test]
    fn test_stop_reason_precedence() {
        let ctx = context(Deadline::new(Some(Utc::now() - Duration::seconds(5))));
        assert_eq!(ctx.stop_reason(), Some(StopReason::OutOfTime));

        ctx.breaker.record_connection_failure();
        assert_eq!(ctx.stop_reason(), Some(StopReason::CircuitOpen));

        ctx.cancel.cancel();
        assert_eq!(ctx.stop_reason(), Some(StopReason::Cancelled));
    }
}
