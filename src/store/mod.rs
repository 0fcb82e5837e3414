//! Hot store: SQLite tables for raw epochs, bucket rollups, rolling windows
//! and pipeline state.

pub mod buckets;
pub mod gaps;
pub mod metadata;
pub mod partition;
pub mod rows;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::config::StoreConfig;
use crate::migrate::{Migrator, SqliteMigrator};

pub use buckets::{BucketRecord, BucketStore};
pub use gaps::GapDetector;
pub use metadata::{EpochMetadata, EpochMetadataStore, Stage};
pub use partition::{Level, Partition, PartitionManager};

/// Shared handle to the hot store pool.
#[derive(Debug, Clone)]
pub struct HotStore {
    pool: SqlitePool,
}

impl HotStore {
    /// Opens (creating if needed) the SQLite database.
    pub async fn open(cfg: &StoreConfig) -> Result<Self> {
        if let Some(parent) = cfg.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating store directory {}", parent.display()))?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(&cfg.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(cfg.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(cfg.acquire_timeout)
            .connect_with(opts)
            .await
            .with_context(|| format!("opening hot store {}", cfg.path.display()))?;

        tracing::info!(
            path = %cfg.path.display(),
            max_connections = cfg.max_connections,
            "hot store opened"
        );

        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Applies pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        SqliteMigrator::new(self.pool.clone())
            .up()
            .await
            .context("migrating hot store")
    }

    pub fn metadata(&self) -> EpochMetadataStore {
        EpochMetadataStore::new(self.pool.clone())
    }

    pub fn buckets(&self) -> BucketStore {
        BucketStore::new(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Epochs and entity ids are stored as SQLite integers.
pub(crate) fn sql_epoch(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn epoch_from_sql(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::export::health::HealthMetrics;

    /// A pool over a fresh database file with no schema.
    pub async fn empty_pool() -> (TempDir, SqlitePool) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = StoreConfig {
            path: dir.path().join("hot.db"),
            acquire_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let store = HotStore::open(&cfg).await.expect("open store");
        (dir, store.pool)
    }

    /// A migrated store over a fresh database file.
    pub async fn store() -> (TempDir, HotStore) {
        let (dir, pool) = empty_pool().await;
        let store = HotStore::from_pool(pool);
        store.migrate().await.expect("migrate");
        (dir, store)
    }

    pub fn health() -> Arc<HealthMetrics> {
        Arc::new(HealthMetrics::new("127.0.0.1:0").expect("metrics"))
    }

    /// Writes `rows` and marks their epochs inserted as one batch.
    pub async fn insert_rows(store: &HotStore, parts: &PartitionManager, rows: &[crate::schema::MetricRow]) {
        let mut epochs: Vec<u64> = rows.iter().map(|r| r.epoch).collect();
        epochs.sort_unstable();
        epochs.dedup();
        let (Some(&low), Some(&high)) = (epochs.first(), epochs.last()) else {
            return;
        };
        parts
            .ensure_covering(crate::schema::EpochRange::inclusive(low, high))
            .await
            .expect("partitions");

        let batch = uuid::Uuid::new_v4();
        let meta: Vec<EpochMetadata> = epochs
            .iter()
            .map(|&e| EpochMetadata::new(e).with_batch(Stage::Insert, batch))
            .collect();
        store.metadata().push(&meta).await.expect("assign");

        let buf: crate::schema::ColumnarBuffer = rows.iter().copied().collect();
        let mut tx = store.pool().begin().await.expect("tx");
        rows::upsert_columns(&mut tx, parts, &buf).await.expect("rows");
        EpochMetadataStore::mark_successful(&mut tx, Stage::Insert, batch, &epochs, chrono::Utc::now())
            .await
            .expect("mark");
        tx.commit().await.expect("commit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_epoch_conversion() {
        assert_eq!(sql_epoch(42), 42);
        assert_eq!(sql_epoch(u64::MAX), i64::MAX);
        assert_eq!(epoch_from_sql(42), 42);
        assert_eq!(epoch_from_sql(-1), 0);
    }

    #[tokio::test]
    async fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = StoreConfig {
            path: dir.path().join("nested/deeper/hot.db"),
            ..Default::default()
        };
        let store = HotStore::open(&cfg).await.expect("open");
        store.migrate().await.expect("migrate");
        assert!(cfg.path.exists());
        store.close().await;
    }
}
