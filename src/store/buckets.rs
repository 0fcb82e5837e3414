use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::{epoch_from_sql, sql_epoch, Level};
use crate::schema::EpochRange;

/// Progress of one fixed-grain bucket.
///
/// A bucket is complete once its source rows up to `range.end` have been
/// rolled up; before that `covered_end` marks how far it got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRecord {
    pub level: Level,
    pub range: EpochRange,
    pub covered_end: u64,
}

impl BucketRecord {
    pub fn is_complete(&self) -> bool {
        self.covered_end >= self.range.end
    }

    /// First epoch the aggregator still has to look at for this bucket.
    pub fn resume_from(&self) -> u64 {
        if self.is_complete() {
            self.range.end
        } else {
            self.range.start
        }
    }

    fn from_row(level: Level, row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            level,
            range: EpochRange::new(
                epoch_from_sql(row.try_get("bucket_start")?),
                epoch_from_sql(row.try_get("bucket_end")?),
            ),
            covered_end: epoch_from_sql(row.try_get("covered_end")?),
        })
    }
}

/// Reads and writes `bucket_metadata`.
#[derive(Debug, Clone)]
pub struct BucketStore {
    pool: SqlitePool,
}

impl BucketStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn one(&self, level: Level, order: &str) -> Result<Option<BucketRecord>> {
        let row = sqlx::query(&format!(
            "SELECT bucket_start, bucket_end, covered_end FROM bucket_metadata
             WHERE level = ? ORDER BY bucket_start {order} LIMIT 1"
        ))
        .bind(level.as_str())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("reading {level} bucket progress"))?;

        row.map(|r| BucketRecord::from_row(level, &r)).transpose()
    }

    /// Most recent bucket recorded for `level`.
    pub async fn last(&self, level: Level) -> Result<Option<BucketRecord>> {
        self.one(level, "DESC").await
    }

    /// Oldest bucket still recorded for `level`.
    pub async fn first(&self, level: Level) -> Result<Option<BucketRecord>> {
        self.one(level, "ASC").await
    }

    /// Buckets of `level` starting inside `range`, ascending.
    pub async fn in_range(&self, level: Level, range: EpochRange) -> Result<Vec<BucketRecord>> {
        let rows = sqlx::query(
            "SELECT bucket_start, bucket_end, covered_end FROM bucket_metadata
             WHERE level = ? AND bucket_start >= ? AND bucket_start < ?
             ORDER BY bucket_start",
        )
        .bind(level.as_str())
        .bind(sql_epoch(range.start))
        .bind(sql_epoch(range.end))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("reading {level} buckets in {range}"))?;

        rows.iter()
            .map(|r| BucketRecord::from_row(level, r))
            .collect()
    }

    /// Records bucket progress on the caller's transaction.
    pub async fn record(conn: &mut SqliteConnection, record: &BucketRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO bucket_metadata (level, bucket_start, bucket_end, covered_end, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(level, bucket_start) DO UPDATE SET
                bucket_end = excluded.bucket_end,
                covered_end = excluded.covered_end,
                updated_at = excluded.updated_at",
        )
        .bind(record.level.as_str())
        .bind(sql_epoch(record.range.start))
        .bind(sql_epoch(record.range.end))
        .bind(sql_epoch(record.covered_end))
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .with_context(|| format!("recording {} bucket {}", record.level, record.range))?;

        Ok(())
    }
}
