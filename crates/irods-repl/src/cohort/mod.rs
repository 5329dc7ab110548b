//! Size-banded cohorts.
//!
//! Candidates are split into one cohort per transfer thread count. The cohort
//! for `t` threads holds objects of size `[(t-1)*buffer_size, t*buffer_size)`,
//! the last sized cohort is open-ended, and zero-byte objects form their own
//! cohort which is always processed last: an empty object may still be in the
//! middle of being written, and deferring it gives that write time to land.

use crate::catalog::Candidate;
use serde::Serialize;
use std::fmt;

/// Size-to-thread mapping parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CohortPolicy {
    /// Bytes handled by one transfer thread.
    pub buffer_size: u64,

    /// Thread count of the open-ended cohort.
    pub max_threads: usize,
}

impl CohortPolicy {
    pub fn new(buffer_size: u64, max_threads: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            max_threads: max_threads.max(1),
        }
    }

    /// Thread count for a non-empty object of `size` bytes.
    pub fn threads_for(&self, size: u64) -> usize {
        let band = size / self.buffer_size;
        // Saturate rather than overflow on absurd sizes
        usize::try_from(band)
            .map(|b| b.saturating_add(1))
            .unwrap_or(usize::MAX)
            .min(self.max_threads)
    }
}

/// Which band a cohort covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortKind {
    Sized,
    ZeroByte,
}

/// A group of candidates sharing one transfer thread count.
#[derive(Debug, Clone)]
pub struct Cohort {
    pub kind: CohortKind,

    /// Inclusive lower size bound.
    pub min_size: u64,

    /// Exclusive upper size bound; `None` for the open-ended cohort.
    pub max_size: Option<u64>,

    /// Transfer threads per object.
    pub threads: usize,

    pub members: Vec<Candidate>,
}

impl Cohort {
    fn sized(policy: &CohortPolicy, threads: usize) -> Self {
        let lower = (threads as u64 - 1).saturating_mul(policy.buffer_size);
        let upper = if threads < policy.max_threads {
            Some((threads as u64).saturating_mul(policy.buffer_size))
        } else {
            None
        };
        Self {
            kind: CohortKind::Sized,
            min_size: lower,
            max_size: upper,
            threads,
            members: Vec::new(),
        }
    }

    fn zero_byte() -> Self {
        Self {
            kind: CohortKind::ZeroByte,
            min_size: 0,
            max_size: Some(1),
            threads: 1,
            members: Vec::new(),
        }
    }

    /// Whether an object of `size` bytes belongs in this cohort.
    pub fn contains(&self, size: u64) -> bool {
        match self.kind {
            CohortKind::ZeroByte => size == 0,
            CohortKind::Sized => {
                size > 0 && size >= self.min_size && self.max_size.map_or(true, |max| size < max)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.members.iter().map(|c| c.size).sum()
    }

    /// Short human-readable name used in logs and the status line.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.max_size) {
            (CohortKind::ZeroByte, _) => write!(f, "empty"),
            (CohortKind::Sized, Some(max)) => write!(
                f,
                "{}t [{}, {})",
                self.threads,
                human_size(self.min_size),
                human_size(max)
            ),
            (CohortKind::Sized, None) => {
                write!(f, "{}t [{}, inf)", self.threads, human_size(self.min_size))
            }
        }
    }
}

/// Split `candidates` into the ordered cohort list.
///
/// The result always holds `policy.max_threads` sized cohorts in ascending
/// thread order followed by the zero-byte cohort, whether or not they have
/// members. Each candidate lands in exactly one cohort, and the input order
/// is preserved within a cohort.
pub fn partition(candidates: Vec<Candidate>, policy: &CohortPolicy) -> Vec<Cohort> {
    let mut cohorts: Vec<Cohort> = (1..=policy.max_threads)
        .map(|t| Cohort::sized(policy, t))
        .collect();
    cohorts.push(Cohort::zero_byte());
    let zero_idx = cohorts.len() - 1;

    for candidate in candidates {
        let idx = if candidate.size == 0 {
            zero_idx
        } else {
            policy.threads_for(candidate.size) - 1
        };
        cohorts[idx].members.push(candidate);
    }

    cohorts
}

/// Render a size boundary in the largest binary unit that divides it exactly.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes;
    let mut unit = 0;
    while unit + 1 < UNITS.len() && value >= 1024 && value % 1024 == 0 {
        value /= 1024;
        unit += 1;
    }
    format!("{}{}", value, UNITS[unit])
}
