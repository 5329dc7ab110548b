//! Configuration type definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default per-thread transfer unit in MiB.
pub const DEFAULT_BUFFER_SIZE_MIB: u64 = 32;
/// Default maximum transfer threads for a single object.
pub const DEFAULT_MAX_THREADS: usize = 16;
/// Default object count for a single-threaded batch.
pub const DEFAULT_MAX_OBJECTS_PER_INVOCATION: usize = 100;
/// Default consecutive connection failures before dispatch halts.
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 3;
/// Upper bound for `max_threads`; one cohort is planned per thread count.
pub const MAX_THREADS_LIMIT: usize = 256;
/// Upper bound for `buffer_size_mib` (1 TiB).
pub const MAX_BUFFER_SIZE_MIB: u64 = 1024 * 1024;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Catalog (ICAT) database configuration.
    pub catalog: CatalogConfig,

    /// Selection and scheduling configuration.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// External transfer tool configuration.
    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// Catalog (ICAT PostgreSQL) connection configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name (default: "ICAT").
    #[serde(default = "default_icat")]
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// SSL mode (default: "disable").
    #[serde(default = "default_disable")]
    pub ssl_mode: String,

    /// Maximum pooled catalog connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,
}

impl fmt::Debug for CatalogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

impl CatalogConfig {
    pub fn get_pool_size(&self) -> usize {
        self.pool_size.unwrap_or(4)
    }
}

/// Selection filters and scheduling knobs.
///
/// Tunables use `Option<T>` to distinguish "not set" (use the default) from
/// "explicitly set"; CLI flags override whatever the file provides.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicationConfig {
    /// Destination root resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_resc: Option<String>,

    /// Source root resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_resc: Option<String>,

    /// Restrict selection to this collection subtree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,

    /// Only select objects created at least this many days ago (default: 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_days: Option<u32>,

    /// Scales the number of concurrent executor invocations (default: 1.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,

    /// Maximum transfer threads for one object (default: 16).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_threads: Option<usize>,

    /// Bytes handled by one transfer thread, in MiB (default: 32).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size_mib: Option<u64>,

    /// Objects per invocation for single-threaded transfers (default: 100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_objects_per_invocation: Option<usize>,

    /// Consecutive connection failures that halt dispatch (default: 3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker_threshold: Option<u32>,

    /// Stop dispatching new batches at this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

impl ReplicationConfig {
    pub fn get_age_days(&self) -> u32 {
        self.age_days.unwrap_or(1)
    }

    pub fn get_multiplier(&self) -> f64 {
        self.multiplier.unwrap_or(1.0)
    }

    pub fn get_max_threads(&self) -> usize {
        self.max_threads.unwrap_or(DEFAULT_MAX_THREADS)
    }

    pub fn get_buffer_size_bytes(&self) -> u64 {
        self.buffer_size_mib
            .unwrap_or(DEFAULT_BUFFER_SIZE_MIB)
            .saturating_mul(1024 * 1024)
    }

    pub fn get_max_objects_per_invocation(&self) -> usize {
        self.max_objects_per_invocation
            .unwrap_or(DEFAULT_MAX_OBJECTS_PER_INVOCATION)
    }

    pub fn get_breaker_threshold(&self) -> u32 {
        self.breaker_threshold.unwrap_or(DEFAULT_BREAKER_THRESHOLD)
    }
}

/// External transfer tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Program used to replicate a batch (default: "irepl").
    #[serde(default = "default_irepl")]
    pub replicate_program: String,

    /// Program used to checksum a batch (default: "ichksum").
    #[serde(default = "default_ichksum")]
    pub checksum_program: String,

    /// Program used to move a batch (default: "iphymv").
    #[serde(default = "default_iphymv")]
    pub move_program: String,

    /// Extra arguments inserted before the object paths.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Stderr fragments that mark a failure as connection-level.
    #[serde(default = "default_connection_markers")]
    pub connection_error_markers: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            replicate_program: default_irepl(),
            checksum_program: default_ichksum(),
            move_program: default_iphymv(),
            extra_args: Vec::new(),
            connection_error_markers: default_connection_markers(),
        }
    }
}

// Default value functions for serde
fn default_pg_port() -> u16 {
    5432
}

fn default_icat() -> String {
    "ICAT".to_string()
}

fn default_disable() -> String {
    "disable".to_string()
}

fn default_irepl() -> String {
    "irepl".to_string()
}

fn default_ichksum() -> String {
    "ichksum".to_string()
}

fn default_iphymv() -> String {
    "iphymv".to_string()
}

fn default_connection_markers() -> Vec<String> {
    [
        "SYS_SOCK_CONNECT_ERR",
        "USER_SOCK_CONNECT_ERR",
        "SYS_SOCK_READ_TIMEDOUT",
        "CAT_CONNECT_ERR",
        "connectToRhost",
        "Connection refused",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
