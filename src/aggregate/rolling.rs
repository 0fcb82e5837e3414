use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::bootstrap::{Bootstrap, BootstrapContext, BootstrapStrategy};
use crate::export::health::HealthMetrics;
use crate::pipeline::fan_out;
use crate::schema::query::{
    create_rolling_table, delete_departed, is_identifier, overwrite_start_snapshots, source_union,
    AggregateSql,
};
use crate::schema::EpochRange;
use crate::store::{epoch_from_sql, sql_epoch, EpochMetadataStore, HotStore, PartitionManager};

/// Length of a rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Epochs(u64),
    /// Everything since the oldest stored bucket.
    Unbounded,
}

/// What one maintenance step did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Range the table covers afterwards, if it holds anything.
    pub window: Option<EpochRange>,
    pub bootstrapped: bool,
    /// Epochs folded in at the head.
    pub added: u64,
    /// Epochs taken out at the tail.
    pub removed: u64,
}

/// Keeps one `rolling_{name}` table equal to the aggregate of the last
/// `width` inserted epochs.
///
/// Normally the window slides by adding new epochs at the head and
/// subtracting expired ones at the tail, both read from raw epoch rows.
/// When the table is empty or has fallen too far behind it is rebuilt by
/// its [`Bootstrap`] strategy.
pub struct RollingAggregator {
    table: String,
    width: Width,
    strategy: Bootstrap,
    ctx: BootstrapContext,
    epochs: Arc<PartitionManager>,
    pool: SqlitePool,
    lock: Mutex<()>,
    health: Arc<HealthMetrics>,
}

impl RollingAggregator {
    /// Creates the backing table if needed.
    pub async fn create(
        name: &str,
        width: Width,
        strategy: Bootstrap,
        ctx: BootstrapContext,
        epochs: Arc<PartitionManager>,
        health: Arc<HealthMetrics>,
    ) -> Result<Self> {
        let table = format!("rolling_{name}");
        if !is_identifier(&table) {
            bail!("invalid rolling window name {name:?}");
        }
        if width == Width::Epochs(0) {
            bail!("rolling window {name} must be at least one epoch wide");
        }

        sqlx::query(&create_rolling_table(&table))
            .execute(&ctx.pool)
            .await
            .with_context(|| format!("creating {table}"))?;

        Ok(Self {
            table,
            width,
            pool: ctx.pool.clone(),
            strategy,
            ctx,
            epochs,
            lock: Mutex::new(()),
            health,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn width(&self) -> Width {
        self.width
    }

    /// Range currently covered by the table.
    pub async fn state(&self) -> Result<Option<EpochRange>> {
        let (start, end): (Option<i64>, Option<i64>) = sqlx::query_as(&format!(
            "SELECT MIN(epoch_start), MAX(epoch_end) FROM {}",
            self.table
        ))
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("reading bounds of {}", self.table))?;

        Ok(match (start, end) {
            (Some(s), Some(e)) => Some(EpochRange::new(epoch_from_sql(s), epoch_from_sql(e))),
            _ => None,
        })
    }

    /// Brings the window up to `head` inclusive.
    ///
    /// Fails with a not-ready error when epochs needed at the head or the
    /// tail are not inserted; the table is left untouched in that case.
    pub async fn maintain_to(&self, head: u64) -> Result<CycleOutcome> {
        let _guard = self.lock.lock().await;
        let started = Instant::now();
        let end = head + 1;
        let mut outcome = CycleOutcome::default();

        let mut state = self.state().await?;
        let stale = state.map_or(true, |s| {
            end.saturating_sub(s.end) >= self.strategy.bootstrap_threshold()
        });
        if stale {
            let built = self
                .strategy
                .bootstrap(&self.ctx, &self.table, self.width, head)
                .await?;
            self.health
                .rolling_bootstraps
                .with_label_values(&[self.table.as_str()])
                .inc();
            debug!(table = %self.table, range = %built, "bootstrap finished");
            outcome.bootstrapped = true;
            state = self.state().await?;
        }

        let Some(state) = state else {
            return Ok(outcome);
        };
        if state.end > end {
            debug!(table = %self.table, window = %state, head, "window already past head");
            outcome.window = Some(state);
            return Ok(outcome);
        }

        let add = EpochRange::new(state.end, end);
        let (remove, start) = self.tail_move(state, end);
        let window = EpochRange::new(start, end);
        if add.is_empty() && remove.is_empty() {
            outcome.window = Some(state);
            self.observe(state, head);
            return Ok(outcome);
        }

        self.ctx.gaps.ensure_complete("epoch", add).await?;
        self.ctx.gaps.ensure_complete("epoch", remove).await?;
        let add_source = self.epoch_source(add).await?;
        let remove_source = self.epoch_source(remove).await?;
        let (snapshot_table, kept_tables) = if remove.is_empty() {
            (None, Vec::new())
        } else {
            let kept = self.epochs.tables_overlapping(window).await?;
            let first = self
                .epochs
                .tables_overlapping(EpochRange::new(start, start + 1))
                .await?
                .into_iter()
                .next();
            (first, kept)
        };

        let mut tx = self.pool.begin().await.context("beginning rolling update")?;
        if let Some(source) = add_source {
            sqlx::query(&AggregateSql::over(source).merge_into(&self.table, add))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("adding {add} to {}", self.table))?;
        }
        if let Some(source) = remove_source {
            let evict = delete_departed(&self.table, &source, &kept_tables, window);
            sqlx::query(&AggregateSql::over(source).subtract_from(&self.table))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("removing {remove} from {}", self.table))?;
            // Entities with no epoch left in the window.
            let evicted = sqlx::query(&evict)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("evicting departed entities from {}", self.table))?
                .rows_affected();
            if evicted > 0 {
                debug!(table = %self.table, evicted, "entities left the window");
            }

            match snapshot_table
                .as_deref()
                .and_then(|t| overwrite_start_snapshots(&self.table, t, start))
            {
                Some(sql) => {
                    sqlx::query(&sql)
                        .execute(&mut *tx)
                        .await
                        .with_context(|| format!("moving start snapshots of {}", self.table))?;
                }
                None => warn!(table = %self.table, start, "no epoch rows for the new window start"),
            }
        }
        sqlx::query(&format!(
            "UPDATE {} SET epoch_start = ?, epoch_end = ?",
            self.table
        ))
        .bind(sql_epoch(window.start))
        .bind(sql_epoch(window.end))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("moving bounds of {}", self.table))?;
        tx.commit().await.context("committing rolling update")?;

        self.observe(window, head);
        self.health.observe_stage("rolling", &self.table, started);
        info!(
            table = %self.table,
            %window,
            added = add.len(),
            removed = remove.len(),
            "window advanced"
        );

        outcome.window = Some(window);
        outcome.added = add.len();
        outcome.removed = remove.len();
        Ok(outcome)
    }

    /// Epochs to subtract and the new window start for a window ending at
    /// `end`. Removal never reaches further back than the bootstrap offset.
    fn tail_move(&self, state: EpochRange, end: u64) -> (EpochRange, u64) {
        let Width::Epochs(width) = self.width else {
            return (EpochRange::new(state.start, state.start), state.start);
        };

        let cut = end.saturating_sub(width);
        if cut <= state.start {
            // Narrower than the width; keep everything.
            return (EpochRange::new(state.start, state.start), state.start);
        }

        let floor = cut.saturating_sub(self.strategy.bootstrap_offset());
        if state.start < floor {
            warn!(
                table = %self.table,
                start = state.start,
                floor,
                "tail lags beyond the bootstrap offset; clipping removal"
            );
        }
        (EpochRange::new(state.start.max(floor), cut), cut)
    }

    async fn epoch_source(&self, range: EpochRange) -> Result<Option<String>> {
        if range.is_empty() {
            return Ok(None);
        }
        let tables = self.epochs.tables_overlapping(range).await?;
        match source_union(&tables, range) {
            Some(sql) => Ok(Some(sql)),
            None => bail!("epochs {range} are marked inserted but no partition holds them"),
        }
    }

    fn observe(&self, window: EpochRange, head: u64) {
        let label = [self.table.as_str()];
        self.health.rolling_start.with_label_values(&label).set(window.start as f64);
        self.health.rolling_end.with_label_values(&label).set(window.end as f64);
        self.health
            .rolling_lag
            .with_label_values(&label)
            .set((head + 1).saturating_sub(window.end) as f64);
    }

    /// Epochs between the window end and `head` that are not inserted and
    /// still inside epoch retention.
    pub async fn missing_head_epochs(&self, head: u64) -> Result<Vec<u64>> {
        match self.state().await? {
            Some(state) => self.ctx.gaps.gaps_between(state.end, head).await,
            None => Ok(Vec::new()),
        }
    }

    /// Epochs the next tail move at `head` would subtract that are not
    /// inserted.
    pub async fn missing_tail_epochs(&self, head: u64) -> Result<Vec<u64>> {
        let Some(state) = self.state().await? else {
            return Ok(Vec::new());
        };
        let (remove, _) = self.tail_move(state, head + 1);
        match remove.last() {
            Some(last) => self.ctx.gaps.gaps_between(remove.start, last).await,
            None => Ok(Vec::new()),
        }
    }
}

/// Every rolling window, maintained together.
pub struct RollingGroup {
    aggregators: Vec<Arc<RollingAggregator>>,
    metadata: EpochMetadataStore,
    in_parallel: usize,
}

impl RollingGroup {
    pub fn new(aggregators: Vec<Arc<RollingAggregator>>, store: &HotStore, in_parallel: usize) -> Self {
        Self {
            aggregators,
            metadata: store.metadata(),
            in_parallel,
        }
    }

    pub fn aggregators(&self) -> &[Arc<RollingAggregator>] {
        &self.aggregators
    }

    /// Advances every window to the latest inserted epoch. Windows run
    /// concurrently; the first failure is returned after all finished.
    pub async fn run_cycle(&self) -> Result<Vec<(String, CycleOutcome)>> {
        let Some(head) = self.metadata.latest_inserted().await? else {
            return Ok(Vec::new());
        };

        fan_out(self.aggregators.clone(), self.in_parallel, move |agg| async move {
            let outcome = agg.maintain_to(head).await?;
            Ok((agg.table().to_string(), outcome))
        })
        .await
    }

    /// Epochs the windows are blocked on at `head`, for the insert pipeline
    /// to fetch first.
    pub async fn repair_priorities(&self, head: u64) -> Result<BTreeSet<u64>> {
        let mut wanted = BTreeSet::new();
        for agg in &self.aggregators {
            wanted.extend(agg.missing_head_epochs(head).await?);
            wanted.extend(agg.missing_tail_epochs(head).await?);
        }
        Ok(wanted)
    }
}
