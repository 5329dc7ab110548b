//! The bulk operations the engine can drive.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A bulk operation performed on every selected data object.
///
/// All three share selection, partitioning and dispatch; they differ only in
/// which replicas the catalog reports and how the executor is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create a replica on the destination resource.
    Replicate,

    /// Compute and register missing checksums.
    Checksum,

    /// Physically move replicas from the source to the destination resource.
    Move,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Replicate => "replicate",
            Operation::Checksum => "checksum",
            Operation::Move => "move",
        }
    }

    /// Whether the operation's transfer tool accepts a thread count.
    ///
    /// Checksumming has no transfer threads, so it is planned with a single
    /// sized cohort.
    pub fn uses_transfer_threads(&self) -> bool {
        !matches!(self, Operation::Checksum)
    }

    /// Whether a destination resource is required.
    pub fn requires_destination(&self) -> bool {
        !matches!(self, Operation::Checksum)
    }

    /// Whether a source resource is required.
    pub fn requires_source(&self) -> bool {
        matches!(self, Operation::Move)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
