//! Catalog selection: which data objects need the operation.
//!
//! The selector reads the iRODS catalog (ICAT) once per run, inside a single
//! repeatable-read transaction, so that "already has a replica" checks stay
//! stable for the whole selection. Any failure here is fatal for the run: a
//! partial candidate set cannot be acted on safely.

mod postgres;
mod query;
mod tls;

pub use postgres::PgCatalog;
pub use query::{CatalogQuery, QueryBuilder};
pub use tls::SslMode;

use crate::config::ReplicationConfig;
use crate::error::Result;
use crate::operation::Operation;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A data object selected for the operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    /// Absolute logical path, unique within the zone.
    pub path: String,

    /// Object size in bytes.
    pub size: u64,
}

impl Candidate {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }
}

/// Filters applied when selecting candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionFilter {
    pub operation: Operation,

    /// Only objects created before this instant are selected.
    pub created_before: DateTime<Utc>,

    /// Restrict selection to this collection and everything below it.
    pub collection: Option<String>,

    /// Source root resource (for checksum: the resource to restrict to).
    pub src_resc: Option<String>,

    /// Destination root resource.
    pub dest_resc: Option<String>,
}

impl SelectionFilter {
    /// Build the filter for `operation` from the scheduling config, with the
    /// age cutoff measured back from `now`.
    pub fn from_config(operation: Operation, config: &ReplicationConfig, now: DateTime<Utc>) -> Self {
        let non_empty = |s: &Option<String>| s.clone().filter(|v| !v.is_empty());
        Self {
            operation,
            created_before: now - Duration::days(i64::from(config.get_age_days())),
            // "/" means the whole zone, which is the same as no restriction
            collection: non_empty(&config.collection)
                .map(|c| c.trim_end_matches('/').to_string())
                .filter(|c| !c.is_empty()),
            src_resc: non_empty(&config.src_resc),
            dest_resc: non_empty(&config.dest_resc),
        }
    }
}

/// Read access to the object catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Select every candidate matching `filter` in one consistent snapshot.
    async fn select_candidates(&self, filter: &SelectionFilter) -> Result<Vec<Candidate>>;

    /// Check connectivity and credentials.
    async fn test_connection(&self) -> Result<()>;
}
