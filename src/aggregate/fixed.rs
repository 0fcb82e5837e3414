use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::Tier;
use crate::export::health::HealthMetrics;
use crate::schema::query::{source_union, AggregateSql};
use crate::schema::EpochRange;
use crate::store::{BucketRecord, BucketStore, EpochMetadataStore, GapDetector, HotStore, Level};

/// Knobs of one fixed-grain level.
#[derive(Debug, Clone, Copy)]
pub struct FixedSettings {
    /// Buckets written per cycle.
    pub max_buckets_per_cycle: usize,
    /// Source epochs kept behind the last completed bucket.
    pub prune_buffer: u64,
    /// Never drop raw epochs that are not transferred yet.
    pub hold_untransferred: bool,
    /// Also apply the target level's own retention. Set on the top level,
    /// which no other aggregator reads from.
    pub prune_target: bool,
}

impl Default for FixedSettings {
    fn default() -> Self {
        Self {
            max_buckets_per_cycle: 48,
            prune_buffer: 0,
            hold_untransferred: false,
            prune_target: false,
        }
    }
}

/// Result of one aggregation cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FixedCycle {
    /// Buckets written, complete or partial.
    pub buckets: usize,
    /// Highest epoch covered at the target level after the cycle.
    pub frontier: Option<u64>,
    /// Partitions dropped by the retention sweep.
    pub pruned: Vec<EpochRange>,
}

/// Rolls one level up into the next coarser one, bucket by bucket.
///
/// Buckets are written in order. A bucket whose source is only partly
/// present is written with what is there and recomputed on later cycles
/// until it is complete. Each write and its progress record share one
/// transaction.
pub struct FixedGrainAggregator {
    source: Tier,
    target: Tier,
    pool: SqlitePool,
    metadata: EpochMetadataStore,
    buckets: BucketStore,
    gaps: GapDetector,
    settings: FixedSettings,
    health: Arc<HealthMetrics>,
}

impl FixedGrainAggregator {
    pub fn new(
        source: Tier,
        target: Tier,
        store: &HotStore,
        gaps: GapDetector,
        settings: FixedSettings,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            source,
            target,
            pool: store.pool().clone(),
            metadata: store.metadata(),
            buckets: store.buckets(),
            gaps,
            settings,
            health,
        }
    }

    pub fn level(&self) -> Level {
        self.target.level
    }

    /// Aggregates whatever new source data there is, then applies
    /// retention.
    pub async fn run_cycle(&self) -> Result<FixedCycle> {
        let started = Instant::now();
        let mut cycle = FixedCycle::default();

        let Some(source_low) = self.source_lowest().await? else {
            debug!(level = %self.target.level, "no source data yet");
            return Ok(cycle);
        };

        let last = self.buckets.last(self.target.level).await?;
        let mut bucket = match last {
            Some(r) if r.is_complete() => self.target.grain.bucket(r.range.end),
            Some(r) => r.range,
            None => self.target.grain.bucket(source_low),
        };
        if bucket.end <= source_low {
            // Source data before `source_low` is gone; skip ahead.
            bucket = self.target.grain.bucket(source_low);
        }
        let mut previous = last.filter(|r| r.range == bucket);
        let mut source_frontier = None;

        while cycle.buckets < self.settings.max_buckets_per_cycle {
            let scan_from = bucket.start.max(source_low);
            let Some(frontier) = self.source.frontier(&self.gaps, scan_from).await? else {
                break;
            };
            source_frontier = Some(frontier);

            let covered_end = bucket.end.min(frontier + 1);
            if covered_end <= scan_from {
                break;
            }
            if previous.is_some_and(|p| p.covered_end >= covered_end) {
                // Nothing new since the last write.
                break;
            }

            let record = BucketRecord {
                level: self.target.level,
                range: bucket,
                covered_end,
            };
            self.write_bucket(&record).await?;
            cycle.buckets += 1;
            cycle.frontier = Some(covered_end - 1);

            if !record.is_complete() {
                break;
            }
            bucket = self.target.grain.bucket(bucket.end);
            previous = None;
        }

        if cycle.buckets > 0 {
            self.health.observe_stage("aggregate", self.target.level.as_str(), started);
        }

        cycle.pruned = self.prune(source_frontier).await?;
        Ok(cycle)
    }

    /// Lowest source position that can still be read.
    async fn source_lowest(&self) -> Result<Option<u64>> {
        match self.source.level {
            Level::Epoch => {
                let inserted = self.metadata.lowest_inserted().await?;
                let stored = self.source.partitions.lowest_start().await?;
                Ok(match (inserted, stored) {
                    (Some(i), Some(s)) => Some(i.max(s)),
                    _ => None,
                })
            }
            level => Ok(self.buckets.first(level).await?.map(|r| r.range.start)),
        }
    }

    async fn write_bucket(&self, record: &BucketRecord) -> Result<()> {
        let read = EpochRange::new(record.range.start, record.covered_end);
        let tables = self.source.partitions.tables_overlapping(read).await?;
        let Some(source) = source_union(&tables, read) else {
            bail!(
                "no {} partitions cover {read} although the frontier says they should",
                self.source.level
            );
        };

        let target_table = self
            .target
            .partitions
            .ensure_partition(self.target.partitions.partition_for(record.range.start))
            .await?;
        let sql = AggregateSql::over(source).upsert_into(&target_table, read);

        let mut tx = self.pool.begin().await.context("beginning bucket write")?;
        sqlx::query(&sql)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("aggregating {} bucket {}", record.level, record.range))?;
        BucketStore::record(&mut tx, record).await?;
        tx.commit().await.context("committing bucket write")?;

        let level = record.level.as_str();
        self.health.buckets_written.with_label_values(&[level]).inc();
        self.health
            .bucket_frontier
            .with_label_values(&[level])
            .set((record.covered_end - 1) as f64);

        if record.is_complete() {
            info!(level, bucket = %record.range, "bucket complete");
        } else {
            debug!(
                level,
                bucket = %record.range,
                covered_end = record.covered_end,
                "partial bucket written"
            );
        }
        Ok(())
    }

    /// Drops source partitions that are fully rolled up and out of
    /// retention.
    async fn prune(&self, source_frontier: Option<u64>) -> Result<Vec<EpochRange>> {
        let Some(last) = self.buckets.last(self.target.level).await? else {
            return Ok(Vec::new());
        };
        let done_end = last.resume_from();
        let mut pruned = Vec::new();

        if let Some(retention) = self.source.retention {
            let frontier = source_frontier.unwrap_or(done_end.saturating_sub(1));
            let mut cutoff = done_end
                .saturating_sub(self.settings.prune_buffer)
                .min((frontier + 1).saturating_sub(retention));

            if self.source.level == Level::Epoch && self.settings.hold_untransferred {
                if let Some(untransferred) = self.metadata.first_untransferred().await? {
                    cutoff = cutoff.min(untransferred);
                }
            }
            pruned.extend(self.source.partitions.drop_older_than(cutoff).await?);
        }

        if self.settings.prune_target {
            if let Some(retention) = self.target.retention {
                let cutoff = done_end.saturating_sub(retention);
                pruned.extend(self.target.partitions.drop_older_than(cutoff).await?);
            }
        }

        Ok(pruned)
    }
}
