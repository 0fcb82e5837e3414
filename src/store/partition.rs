use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Deserialize;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use super::{epoch_from_sql, sql_epoch};
use crate::export::health::HealthMetrics;
use crate::schema::query::create_range_table;
use crate::schema::EpochRange;

/// Aggregation level of a stored table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// One row per entity and epoch.
    Epoch,
    /// One row per entity and UTC hour.
    Hourly,
    /// One row per entity and UTC day.
    Daily,
}

impl Level {
    pub const ALL: [Level; 3] = [Level::Epoch, Level::Hourly, Level::Daily];

    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Epoch => "epoch",
            Level::Hourly => "hourly",
            Level::Daily => "daily",
        }
    }

    /// Wall-clock length of one bucket. Raw epochs have none.
    pub const fn bucket_duration(self) -> Duration {
        match self {
            Level::Epoch => Duration::ZERO,
            Level::Hourly => Duration::from_secs(3_600),
            Level::Daily => Duration::from_secs(86_400),
        }
    }

    /// The level this one is rolled up from.
    pub const fn source(self) -> Option<Level> {
        match self {
            Level::Epoch => None,
            Level::Hourly => Some(Level::Epoch),
            Level::Daily => Some(Level::Hourly),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical table holding one level's rows for an epoch range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub range: EpochRange,
    pub table: String,
}

/// Creates and drops the time-bucketed tables of one level.
///
/// A row lives in the partition containing its `epoch_start`. Partitions
/// are listed in the `partitions` catalog so readers never probe for
/// tables that do not exist.
pub struct PartitionManager {
    pool: SqlitePool,
    level: Level,
    width: u64,
    known: parking_lot::Mutex<HashSet<u64>>,
    health: Arc<HealthMetrics>,
}

impl fmt::Debug for PartitionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionManager")
            .field("level", &self.level)
            .field("width", &self.width)
            .finish()
    }
}

impl PartitionManager {
    /// `width` is the number of epochs covered by one partition.
    pub fn new(
        pool: SqlitePool,
        level: Level,
        width: u64,
        health: Arc<HealthMetrics>,
    ) -> Result<Self> {
        if width == 0 {
            bail!("{level} partition width must be > 0");
        }

        Ok(Self {
            pool,
            level,
            width,
            known: parking_lot::Mutex::new(HashSet::new()),
            health,
        })
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Partition range containing `epoch`.
    pub fn partition_for(&self, epoch: u64) -> EpochRange {
        let start = epoch / self.width * self.width;
        EpochRange::new(start, start + self.width)
    }

    pub fn table_name(&self, range: EpochRange) -> String {
        format!("{}_{}_{}", self.level, range.start, range.end)
    }

    /// Creates the partition if needed. Safe to call repeatedly and
    /// concurrently.
    pub async fn ensure_partition(&self, range: EpochRange) -> Result<String> {
        if range != self.partition_for(range.start) {
            bail!("{range} is not a {} partition boundary", self.level);
        }

        let table = self.table_name(range);
        if self.known.lock().contains(&range.start) {
            return Ok(table);
        }

        let mut tx = self.pool.begin().await.context("beginning partition create")?;

        sqlx::query(&create_range_table(&table))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("creating partition table {table}"))?;

        let created = sqlx::query(
            "INSERT OR IGNORE INTO partitions (level, bucket_start, bucket_end, table_name, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(self.level.as_str())
        .bind(sql_epoch(range.start))
        .bind(sql_epoch(range.end))
        .bind(&table)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("registering partition {table}"))?
        .rows_affected();

        tx.commit().await.context("committing partition create")?;

        if created > 0 {
            info!(level = %self.level, %range, table = %table, "created partition");
            self.health
                .partitions_created
                .with_label_values(&[self.level.as_str()])
                .inc();
        }

        self.known.lock().insert(range.start);

        Ok(table)
    }

    /// Ensures every partition overlapping `range` exists.
    pub async fn ensure_covering(&self, range: EpochRange) -> Result<Vec<String>> {
        let mut tables = Vec::new();
        if range.is_empty() {
            return Ok(tables);
        }

        let mut start = self.partition_for(range.start).start;
        while start < range.end {
            let part = EpochRange::new(start, start + self.width);
            tables.push(self.ensure_partition(part).await?);
            start = part.end;
        }

        Ok(tables)
    }

    /// Registered partitions overlapping `range`, ascending.
    pub async fn overlapping(&self, range: EpochRange) -> Result<Vec<Partition>> {
        let rows = sqlx::query(
            "SELECT bucket_start, bucket_end, table_name FROM partitions
             WHERE level = ? AND bucket_end > ? AND bucket_start < ?
             ORDER BY bucket_start",
        )
        .bind(self.level.as_str())
        .bind(sql_epoch(range.start))
        .bind(sql_epoch(range.end))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing {} partitions in {range}", self.level))?;

        rows.iter()
            .map(|row| -> Result<Partition> {
                Ok(Partition {
                    range: EpochRange::new(
                        epoch_from_sql(row.try_get("bucket_start")?),
                        epoch_from_sql(row.try_get("bucket_end")?),
                    ),
                    table: row.try_get("table_name")?,
                })
            })
            .collect()
    }

    /// Table names of the partitions overlapping `range`.
    pub async fn tables_overlapping(&self, range: EpochRange) -> Result<Vec<String>> {
        Ok(self
            .overlapping(range)
            .await?
            .into_iter()
            .map(|p| p.table)
            .collect())
    }

    /// Start of the oldest registered partition.
    pub async fn lowest_start(&self) -> Result<Option<u64>> {
        let start: Option<i64> =
            sqlx::query_scalar("SELECT MIN(bucket_start) FROM partitions WHERE level = ?")
                .bind(self.level.as_str())
                .fetch_one(&self.pool)
                .await
                .context("reading lowest partition")?;

        Ok(start.map(epoch_from_sql))
    }

    /// Drops a partition with its catalog entry and bucket progress.
    pub async fn drop_partition(&self, range: EpochRange) -> Result<()> {
        let table = self.table_name(range);
        let mut tx = self.pool.begin().await.context("beginning partition drop")?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("dropping partition table {table}"))?;

        sqlx::query("DELETE FROM partitions WHERE level = ? AND bucket_start = ?")
            .bind(self.level.as_str())
            .bind(sql_epoch(range.start))
            .execute(&mut *tx)
            .await
            .context("deleting partition catalog entry")?;

        sqlx::query(
            "DELETE FROM bucket_metadata WHERE level = ? AND bucket_start >= ? AND bucket_start < ?",
        )
        .bind(self.level.as_str())
        .bind(sql_epoch(range.start))
        .bind(sql_epoch(range.end))
        .execute(&mut *tx)
        .await
        .context("deleting bucket progress")?;

        tx.commit().await.context("committing partition drop")?;

        self.known.lock().remove(&range.start);
        self.health
            .partitions_dropped
            .with_label_values(&[self.level.as_str()])
            .inc();
        info!(level = %self.level, %range, table = %table, "dropped partition");

        Ok(())
    }

    /// Drops every partition that ends at or before `cutoff`.
    pub async fn drop_older_than(&self, cutoff: u64) -> Result<Vec<EpochRange>> {
        let expired: Vec<EpochRange> = self
            .overlapping(EpochRange::new(0, cutoff))
            .await?
            .into_iter()
            .map(|p| p.range)
            .filter(|r| r.end <= cutoff)
            .collect();

        for range in &expired {
            self.drop_partition(*range).await?;
        }

        if !expired.is_empty() {
            debug!(level = %self.level, cutoff, dropped = expired.len(), "retention sweep");
        }

        Ok(expired)
    }
}
