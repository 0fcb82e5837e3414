pub mod archive;
pub mod health;

use std::sync::Arc;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;
use crate::migrate::{ClickHouseMigrator, Migrator};

pub use archive::{Archive, ClickHouseArchive};
use health::HealthMetrics;

/// Manages the ClickHouse native TCP connection pool of the archive.
///
/// Wraps `clickhouse-rs` Pool with LZ4 compression and a small pool
/// (min=2, max=5).
pub struct ClickHouseWriter {
    cfg: ClickHouseConfig,
    pool: Option<Pool>,
}

impl ClickHouseWriter {
    /// Creates a new writer with the given configuration.
    pub fn new(cfg: ClickHouseConfig) -> Self {
        Self { cfg, pool: None }
    }

    /// Opens the connection pool, verifies connectivity with a ping and
    /// applies archive migrations when enabled.
    pub async fn start(&mut self) -> Result<()> {
        let dsn = self.build_dsn();
        let pool = Pool::new(dsn);

        let mut handle = pool
            .get_handle()
            .await
            .context("opening ClickHouse connection")?;

        handle.ping().await.context("pinging ClickHouse")?;

        tracing::info!(endpoint = %self.cfg.endpoint, "ClickHouse writer connected");

        if self.cfg.migrations.enabled {
            ClickHouseMigrator::new(pool.clone())
                .up()
                .await
                .context("migrating archive")?;
        }

        self.pool = Some(pool);

        Ok(())
    }

    /// Returns the connection pool, if started.
    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    /// Archive handle over the started pool.
    pub fn archive(&self, health: Arc<HealthMetrics>) -> Result<ClickHouseArchive> {
        let pool = self
            .pool
            .clone()
            .context("ClickHouse writer is not started")?;
        Ok(ClickHouseArchive::new(pool, self.cfg.database.clone(), health))
    }

    /// Closes the connection pool.
    pub async fn stop(&mut self) -> Result<()> {
        self.pool.take();
        Ok(())
    }

    /// Builds a clickhouse-rs compatible TCP DSN from configuration.
    ///
    /// Format: `tcp://[user[:pass]@]host:port/database?options`
    fn build_dsn(&self) -> String {
        let mut dsn = "tcp://".to_string();

        if !self.cfg.username.is_empty() {
            dsn.push_str(&self.cfg.username);
            if !self.cfg.password.is_empty() {
                dsn.push(':');
                dsn.push_str(&self.cfg.password);
            }
            dsn.push('@');
        }

        dsn.push_str(&self.cfg.endpoint);
        dsn.push('/');
        dsn.push_str(&self.cfg.database);
        dsn.push_str("?compression=lz4&pool_min=2&pool_max=5");

        dsn
    }
}
