//! Configuration validation.

use super::{Config, MAX_BUFFER_SIZE_MIB, MAX_THREADS_LIMIT};
use crate::catalog::SslMode;
use crate::error::{ReplError, Result};
use crate::operation::Operation;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Catalog validation
    if config.catalog.host.is_empty() {
        return Err(ReplError::Config("catalog.host is required".into()));
    }
    if config.catalog.database.is_empty() {
        return Err(ReplError::Config("catalog.database is required".into()));
    }
    if config.catalog.user.is_empty() {
        return Err(ReplError::Config("catalog.user is required".into()));
    }
    SslMode::parse(&config.catalog.ssl_mode)?;
    if let Some(0) = config.catalog.pool_size {
        return Err(ReplError::Config(
            "catalog.pool_size must be at least 1".into(),
        ));
    }

    // Scheduling validation - only check if explicitly set
    let repl = &config.replication;
    if let Some(m) = repl.multiplier {
        if !m.is_finite() || m <= 0.0 {
            return Err(ReplError::Config(format!(
                "replication.multiplier must be a positive number, got {}",
                m
            )));
        }
    }
    if let Some(n) = repl.max_threads {
        if n == 0 || n > MAX_THREADS_LIMIT {
            return Err(ReplError::Config(format!(
                "replication.max_threads must be between 1 and {}, got {}",
                MAX_THREADS_LIMIT, n
            )));
        }
    }
    if let Some(mib) = repl.buffer_size_mib {
        if mib == 0 || mib > MAX_BUFFER_SIZE_MIB {
            return Err(ReplError::Config(format!(
                "replication.buffer_size_mib must be between 1 and {}, got {}",
                MAX_BUFFER_SIZE_MIB, mib
            )));
        }
    }
    if let Some(0) = repl.max_objects_per_invocation {
        return Err(ReplError::Config(
            "replication.max_objects_per_invocation must be at least 1".into(),
        ));
    }
    if let Some(0) = repl.breaker_threshold {
        return Err(ReplError::Config(
            "replication.breaker_threshold must be at least 1".into(),
        ));
    }
    if let Some(ref coll) = repl.collection {
        if !coll.starts_with('/') {
            return Err(ReplError::Config(format!(
                "replication.collection must be an absolute path, got '{}'",
                coll
            )));
        }
    }

    if config.executor.replicate_program.is_empty()
        || config.executor.checksum_program.is_empty()
        || config.executor.move_program.is_empty()
    {
        return Err(ReplError::Config(
            "executor programs must not be empty".into(),
        ));
    }

    Ok(())
}

/// Validate the resource settings an operation needs.
pub fn validate_for_operation(config: &Config, operation: Operation) -> Result<()> {
    let repl = &config.replication;
    let dest = repl.dest_resc.as_deref().filter(|s| !s.is_empty());
    let src = repl.src_resc.as_deref().filter(|s| !s.is_empty());

    if operation.requires_destination() && dest.is_none() {
        return Err(ReplError::Config(format!(
            "{} requires a destination resource (--dest-resc or replication.dest_resc)",
            operation
        )));
    }
    if operation.requires_source() && src.is_none() {
        return Err(ReplError::Config(format!(
            "{} requires a source resource (--src-resc or replication.src_resc)",
            operation
        )));
    }
    if operation.requires_destination() && dest.is_some() && dest == src {
        return Err(ReplError::Config(
            "source and destination resources cannot be the same".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CatalogConfig, ExecutorConfig, ReplicationConfig};

    fn valid_config() -> Config {
        Config {
            catalog: CatalogConfig {
                host: "localhost".to_string(),
                port: 5432,
                database: "ICAT".to_string(),
                user: "irods".to_string(),
                password: "password".to_string(),
                ssl_mode: "disable".to_string(),
                pool_size: None,
            },
            replication: ReplicationConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_catalog_host() {
        let mut config = valid_config();
        config.catalog.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_ssl_mode() {
        let mut config = valid_config();
        config.catalog.ssl_mode = "sometimes".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_non_positive_multiplier() {
        let mut config = valid_config();
        config.replication.multiplier = Some(0.0);
        assert!(validate(&config).is_err());
        config.replication.multiplier = Some(f64::NAN);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_max_threads() {
        let mut config = valid_config();
        config.replication.max_threads = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_max_threads_upper_bound() {
        let mut config = valid_config();
        config.replication.max_threads = Some(MAX_THREADS_LIMIT);
        assert!(validate(&config).is_ok());
        config.replication.max_threads = Some(usize::MAX);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_buffer_size_bounds() {
        let mut config = valid_config();
        config.replication.buffer_size_mib = Some(0);
        assert!(validate(&config).is_err());
        config.replication.buffer_size_mib = Some(MAX_BUFFER_SIZE_MIB);
        assert!(validate(&config).is_ok());
        config.replication.buffer_size_mib = Some(u64::MAX / 1024);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_huge_buffer_size_saturates() {
        let mut repl = ReplicationConfig::default();
        repl.buffer_size_mib = Some(u64::MAX / 1024);
        assert_eq!(repl.get_buffer_size_bytes(), u64::MAX);
    }

    #[test]
    fn test_relative_collection() {
        let mut config = valid_config();
        config.replication.collection = Some("home/alice".into());
        assert!(validate(&config).is_err());
        config.replication.collection = Some("/iplant/home/alice".into());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_replicate_requires_destination() {
        let mut config = valid_config();
        assert!(validate_for_operation(&config, Operation::Replicate).is_err());
        config.replication.dest_resc = Some("taccRes".into());
        assert!(validate_for_operation(&config, Operation::Replicate).is_ok());
    }

    #[test]
    fn test_move_requires_both_resources() {
        let mut config = valid_config();
        config.replication.dest_resc = Some("taccRes".into());
        assert!(validate_for_operation(&config, Operation::Move).is_err());
        config.replication.src_resc = Some("taccRes".into());
        assert!(validate_for_operation(&config, Operation::Move).is_err());
        config.replication.src_resc = Some("cyverseRes".into());
        assert!(validate_for_operation(&config, Operation::Move).is_ok());
    }

    #[test]
    fn test_checksum_needs_no_resources() {
        let config = valid_config();
        assert!(validate_for_operation(&config, Operation::Checksum).is_ok());
    }

    #[test]
    fn test_catalog_config_debug_redacts_password() {
        let mut config = valid_config();
        config.catalog.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.catalog);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_123"));
    }
}
