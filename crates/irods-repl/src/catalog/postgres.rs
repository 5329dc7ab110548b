//! ICAT (PostgreSQL) catalog access.

use super::{Candidate, CatalogSource, QueryBuilder, SelectionFilter, SslMode};
use crate::config::CatalogConfig;
use crate::error::{ReplError, Result};
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Instant;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Config as PgConfig, IsolationLevel};
use tracing::{debug, info, warn};

/// Pooled connection to the iRODS catalog database.
pub struct PgCatalog {
    pool: Pool,
}

impl PgCatalog {
    /// Connect to the catalog and verify the credentials work.
    pub async fn new(config: &CatalogConfig) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("irods-repl");

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match SslMode::parse(&config.ssl_mode)?.connector() {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => {
                warn!("Catalog TLS is disabled. Credentials will be transmitted in plaintext.");
                Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
            }
        };

        let pool = Pool::builder(mgr)
            .max_size(config.get_pool_size())
            .build()
            .map_err(|e| ReplError::pool(e, "creating catalog pool"))?;

        let catalog = Self { pool };
        catalog.test_connection().await?;

        info!(
            "Connected to catalog: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(catalog)
    }
}

#[async_trait]
impl CatalogSource for PgCatalog {
    async fn select_candidates(&self, filter: &SelectionFilter) -> Result<Vec<Candidate>> {
        let query = QueryBuilder::new().selection(filter);
        debug!("Selection query:\n{}\nparams: {:?}", query.sql, query.params);

        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| ReplError::pool(e, "getting connection for candidate selection"))?;

        let started = Instant::now();
        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .await?;

        let params: Vec<&(dyn ToSql + Sync)> = query
            .params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect();
        let rows = tx.query(query.sql.as_str(), &params).await?;
        tx.commit().await?;

        let candidates: Vec<Candidate> = rows
            .iter()
            .map(|row| {
                let size: Option<i64> = row.get(0);
                Candidate::new(row.get::<_, String>(1), size.unwrap_or(0).max(0) as u64)
            })
            .collect();

        info!(
            "Selected {} candidates for {} in {:.1}s",
            candidates.len(),
            filter.operation,
            started.elapsed().as_secs_f64()
        );
        Ok(candidates)
    }

    async fn test_connection(&self) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| ReplError::pool(e, "testing catalog connection"))?;

        // Fails on missing privileges, not just connectivity
        client
            .simple_query("SELECT 1 FROM r_data_main LIMIT 1")
            .await?;
        Ok(())
    }
}
