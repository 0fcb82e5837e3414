//! Full rebuilds of rolling windows from stored buckets.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Instant;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::info;

use super::rolling::Width;
use super::Tier;
use crate::error::PipelineError;
use crate::pipeline::fan_out;
use crate::schema::{AggregateRow, EpochRange};
use crate::store::rows::{aggregate_range, insert_aggregates};
use crate::store::{BucketStore, GapDetector};

/// Shared handles a bootstrap needs besides its source tier.
#[derive(Debug, Clone)]
pub struct BootstrapContext {
    pub pool: SqlitePool,
    pub buckets: BucketStore,
    pub gaps: GapDetector,
    /// Source partitions read concurrently.
    pub parts_in_parallel: usize,
}

/// How a rolling table is rebuilt when incremental maintenance is not
/// possible or would cost more than starting over.
pub trait BootstrapStrategy: Send + Sync {
    /// Rebuilds `table` for a window of `width` ending at `head` and
    /// returns the range the table now covers.
    fn bootstrap(
        &self,
        ctx: &BootstrapContext,
        table: &str,
        width: Width,
        head: u64,
    ) -> impl Future<Output = Result<EpochRange>> + Send;

    /// Range a rebuild at `epoch` aims for, before clamping to the data
    /// actually stored. `epoch` is the exclusive end of the wanted window.
    fn bootstrap_bounds(&self, epoch: u64, width: Width) -> EpochRange;

    /// Lag between the window end and the head that forces a rebuild.
    fn bootstrap_threshold(&self) -> u64;

    /// How far before the nominal tail incremental removal may reach.
    fn bootstrap_offset(&self) -> u64;
}

/// Rebuilds a bounded window from one bucket level.
#[derive(Debug, Clone)]
pub struct WindowBootstrap {
    source: Tier,
    threshold: u64,
}

impl WindowBootstrap {
    /// `threshold` of `None` uses two source buckets.
    pub fn new(source: Tier, threshold: Option<u64>) -> Self {
        let threshold = threshold.unwrap_or_else(|| 2 * source.grain.max_width());
        Self { source, threshold }
    }
}

impl BootstrapStrategy for WindowBootstrap {
    async fn bootstrap(
        &self,
        ctx: &BootstrapContext,
        table: &str,
        width: Width,
        head: u64,
    ) -> Result<EpochRange> {
        let bounds = self.bootstrap_bounds(head + 1, width);
        rebuild(ctx, &self.source, table, bounds).await
    }

    fn bootstrap_bounds(&self, epoch: u64, width: Width) -> EpochRange {
        let end = self.source.grain.bucket(epoch).start;
        let tail = match width {
            Width::Epochs(w) => self.source.grain.bucket(end.saturating_sub(w)).start,
            Width::Unbounded => 0,
        };
        EpochRange::new(tail, end)
    }

    fn bootstrap_threshold(&self) -> u64 {
        self.threshold
    }

    fn bootstrap_offset(&self) -> u64 {
        self.threshold + self.source.grain.max_width()
    }
}

/// Rebuilds the all-time window from the coarsest level.
#[derive(Debug, Clone)]
pub struct TotalBootstrap {
    source: Tier,
    threshold: u64,
}

impl TotalBootstrap {
    pub fn new(source: Tier, threshold: u64) -> Self {
        Self { source, threshold }
    }
}

impl BootstrapStrategy for TotalBootstrap {
    async fn bootstrap(
        &self,
        ctx: &BootstrapContext,
        table: &str,
        _width: Width,
        head: u64,
    ) -> Result<EpochRange> {
        let bounds = self.bootstrap_bounds(head + 1, Width::Unbounded);
        rebuild(ctx, &self.source, table, bounds).await
    }

    fn bootstrap_bounds(&self, epoch: u64, _width: Width) -> EpochRange {
        EpochRange::new(0, self.source.grain.bucket(epoch).start)
    }

    fn bootstrap_threshold(&self) -> u64 {
        self.threshold
    }

    fn bootstrap_offset(&self) -> u64 {
        self.threshold + self.source.grain.max_width()
    }
}

/// Every bootstrap strategy, dispatched statically.
#[derive(Debug, Clone)]
pub enum Bootstrap {
    Window(WindowBootstrap),
    Total(TotalBootstrap),
}

impl BootstrapStrategy for Bootstrap {
    async fn bootstrap(
        &self,
        ctx: &BootstrapContext,
        table: &str,
        width: Width,
        head: u64,
    ) -> Result<EpochRange> {
        match self {
            Bootstrap::Window(s) => s.bootstrap(ctx, table, width, head).await,
            Bootstrap::Total(s) => s.bootstrap(ctx, table, width, head).await,
        }
    }

    fn bootstrap_bounds(&self, epoch: u64, width: Width) -> EpochRange {
        match self {
            Bootstrap::Window(s) => s.bootstrap_bounds(epoch, width),
            Bootstrap::Total(s) => s.bootstrap_bounds(epoch, width),
        }
    }

    fn bootstrap_threshold(&self) -> u64 {
        match self {
            Bootstrap::Window(s) => s.bootstrap_threshold(),
            Bootstrap::Total(s) => s.bootstrap_threshold(),
        }
    }

    fn bootstrap_offset(&self) -> u64 {
        match self {
            Bootstrap::Window(s) => s.bootstrap_offset(),
            Bootstrap::Total(s) => s.bootstrap_offset(),
        }
    }
}

/// Replaces the content of `table` with the aggregate of `source` over
/// `bounds`, clamped to the buckets actually stored.
async fn rebuild(
    ctx: &BootstrapContext,
    source: &Tier,
    table: &str,
    bounds: EpochRange,
) -> Result<EpochRange> {
    let started = Instant::now();
    let not_ready = |reason: String| PipelineError::SourceNotReady {
        what: format!("{} buckets for {table}", source.level),
        reason,
    };

    let Some(first) = ctx.buckets.first(source.level).await? else {
        return Err(not_ready("no buckets recorded".to_string()).into());
    };
    let tail = bounds.start.max(first.range.start);
    let Some(frontier) = source.frontier(&ctx.gaps, tail).await? else {
        return Err(not_ready(format!("no contiguous buckets from epoch {tail}")).into());
    };
    let range = EpochRange::new(tail, bounds.end.min(frontier + 1));
    if range.is_empty() {
        return Err(not_ready(format!("nothing stored inside {bounds}")).into());
    }

    let parts: Vec<(String, EpochRange)> = source
        .partitions
        .overlapping(range)
        .await?
        .into_iter()
        .map(|p| {
            let part = EpochRange::new(p.range.start.max(range.start), p.range.end.min(range.end));
            (p.table, part)
        })
        .collect();

    let pool = ctx.pool.clone();
    let pieces = fan_out(parts, ctx.parts_in_parallel, move |(table, part)| {
        let pool = pool.clone();
        async move { aggregate_range(&pool, &[table], part).await }
    })
    .await?;

    let mut folded: BTreeMap<u64, AggregateRow> = BTreeMap::new();
    for piece in pieces {
        for row in piece {
            match folded.get_mut(&row.entity) {
                Some(acc) => acc.merge_later(&row),
                None => {
                    folded.insert(row.entity, row);
                }
            }
        }
    }
    let rows: Vec<AggregateRow> = folded.into_values().collect();

    let mut tx = ctx.pool.begin().await.context("beginning bootstrap")?;
    sqlx::query(&format!("DELETE FROM {table}"))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("clearing {table}"))?;
    insert_aggregates(&mut tx, table, &rows, range).await?;
    tx.commit().await.context("committing bootstrap")?;

    info!(
        table,
        source = %source.level,
        %range,
        entities = rows.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "bootstrapped rolling window"
    );
    Ok(range)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::aggregate::Grain;
    use crate::store::{testutil, Level, PartitionManager};

    async fn tier(grain: Grain) -> (tempfile::TempDir, Tier) {
        let (dir, store) = testutil::store().await;
        let parts = PartitionManager::new(store.pool().clone(), Level::Hourly, 8, testutil::health())
            .expect("parts");
        (dir, Tier::new(Level::Hourly, grain, Arc::new(parts), None))
    }

    #[tokio::test]
    async fn test_window_bounds_cover_at_least_the_width() {
        let (_dir, source) = tier(Grain::epochs(2, 0).expect("grain")).await;
        let strategy = WindowBootstrap::new(source, None);

        assert_eq!(strategy.bootstrap_bounds(10, Width::Epochs(4)), EpochRange::new(6, 10));
        assert_eq!(strategy.bootstrap_bounds(11, Width::Epochs(4)), EpochRange::new(6, 10));
        assert_eq!(strategy.bootstrap_bounds(11, Width::Epochs(5)), EpochRange::new(4, 10));
        assert_eq!(strategy.bootstrap_bounds(3, Width::Epochs(8)), EpochRange::new(0, 2));
        assert_eq!(strategy.bootstrap_threshold(), 4);
        assert_eq!(strategy.bootstrap_offset(), 6);
    }

    #[tokio::test]
    async fn test_total_bounds_start_at_zero() {
        let (_dir, source) = tier(Grain::epochs(3, 0).expect("grain")).await;
        let strategy = Bootstrap::Total(TotalBootstrap::new(source, 9));

        assert_eq!(strategy.bootstrap_bounds(100, Width::Epochs(4)), EpochRange::new(0, 99));
        assert_eq!(strategy.bootstrap_threshold(), 9);
        assert_eq!(strategy.bootstrap_offset(), 12);
    }
}
