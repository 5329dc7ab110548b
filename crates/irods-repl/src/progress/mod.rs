//! Progress aggregation.
//!
//! Workers never touch counters. They send one [`CompletionEvent`] per object
//! that finished successfully, and a single [`ProgressAggregator`] per cohort
//! drains that stream and owns the counters. A new aggregator is started for
//! each cohort with the previous cohort's final global count as its base.

mod reporter;

pub use reporter::{
    JsonReporter, LineReporter, LogWriter, NullReporter, ProgressSnapshot, Reporter,
};

use crate::cohort::Cohort;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Minimum time between two rendered updates.
const RENDER_INTERVAL: Duration = Duration::from_millis(100);

/// One data object finished successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub path: String,
}

impl CompletionEvent {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Sending half of a cohort's completion stream.
pub type CompletionSender = mpsc::UnboundedSender<CompletionEvent>;

/// Receiving half of a cohort's completion stream.
pub type CompletionReceiver = mpsc::UnboundedReceiver<CompletionEvent>;

/// Counters at the end of a cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CohortProgress {
    pub completed: u64,
    pub total: u64,
    /// Global completed count to carry into the next cohort.
    pub global_completed: u64,
}

/// Sole owner of the progress counters for one cohort.
pub struct ProgressAggregator {
    label: String,
    members: HashSet<String>,
    seen: HashSet<String>,
    cohort_total: u64,
    global_completed: u64,
    global_total: u64,
    reporter: Arc<dyn Reporter>,
    last_render: Option<Instant>,
}

impl ProgressAggregator {
    /// Start counting `cohort`, continuing from `global_base` completions.
    pub fn new(
        cohort: &Cohort,
        global_base: u64,
        global_total: u64,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let members: HashSet<String> = cohort.members.iter().map(|c| c.path.clone()).collect();
        Self {
            label: cohort.label(),
            cohort_total: members.len() as u64,
            members,
            seen: HashSet::new(),
            global_completed: global_base.min(global_total),
            global_total,
            reporter,
            last_render: None,
        }
    }

    pub fn cohort_completed(&self) -> u64 {
        self.seen.len() as u64
    }

    pub fn global_completed(&self) -> u64 {
        self.global_completed
    }

    /// Count an event. Returns `false` for duplicates and paths that are not
    /// part of this cohort, which are ignored.
    pub fn record(&mut self, event: CompletionEvent) -> bool {
        if !self.members.contains(&event.path) {
            debug!("Ignoring completion for {} outside cohort {}", event.path, self.label);
            return false;
        }
        if !self.seen.insert(event.path) {
            trace!("Duplicate completion ignored");
            return false;
        }
        if self.global_completed < self.global_total {
            self.global_completed += 1;
        }
        true
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            cohort: self.label.clone(),
            cohort_completed: self.cohort_completed(),
            cohort_total: self.cohort_total,
            global_completed: self.global_completed,
            global_total: self.global_total,
        }
    }

    fn render(&mut self, force: bool) {
        let due = self
            .last_render
            .map_or(true, |at| at.elapsed() >= RENDER_INTERVAL);
        if force || due {
            self.reporter.update(&self.snapshot());
            self.last_render = Some(Instant::now());
        }
    }

    /// Drain `rx` until every sender is dropped, then report the final counts.
    pub async fn run(mut self, mut rx: CompletionReceiver) -> CohortProgress {
        self.render(true);
        while let Some(event) = rx.recv().await {
            if self.record(event) {
                self.render(false);
            }
        }
        self.render(true);
        self.reporter.finish();

        CohortProgress {
            completed: self.cohort_completed(),
            total: self.cohort_total,
            global_completed: self.global_completed,
        }
    }
}
