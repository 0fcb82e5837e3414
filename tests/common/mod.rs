//! Hot store stack wired through the public API: a scripted source feeding
//! the insert pipeline, hourly and daily rollups, and rolling windows on top.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use epochroll::aggregate::{
    Bootstrap, BootstrapContext, FixedGrainAggregator, FixedSettings, Grain, RollingAggregator,
    Tier, Width,
};
use epochroll::config::{InsertConfig, StoreConfig};
use epochroll::export::health::HealthMetrics;
use epochroll::pipeline::InsertPipeline;
use epochroll::schema::{AggregateRow, EpochRange, Field, MetricRow};
use epochroll::source::EpochSource;
use epochroll::store::rows::read_table;
use epochroll::store::{GapDetector, HotStore, Level, PartitionManager};

pub const ENTITIES: u64 = 3;

/// Deterministic metrics for one validator at one epoch.
pub fn row(epoch: u64, entity: u64) -> MetricRow {
    let (e, v) = (epoch as i64, entity as i64);
    MetricRow::new(epoch, entity)
        .with(Field::AttestationsScheduled, 1)
        .with(Field::AttestationsExecuted, i64::from((epoch + entity) % 4 != 0))
        .with(Field::AttestationReward, 10 * e + v)
        .with(Field::SyncReward, e % 3)
        .with(Field::BalanceStart, 32_000 + 10 * e + v)
        .with(Field::BalanceEnd, 32_000 + 10 * (e + 1) + v)
        .with(Field::LastAttestationEpoch, e)
}

/// What any level must hold for `epochs`, folded straight from raw rows.
pub fn expected(epochs: Range<u64>) -> Vec<AggregateRow> {
    (0..ENTITIES)
        .map(|v| {
            let mut rows = epochs.clone().map(|e| AggregateRow::from(&row(e, v)));
            let mut acc = rows.next().expect("non-empty range");
            for later in rows {
                acc.merge_later(&later);
            }
            acc
        })
        .collect()
}

pub struct ScriptedSource {
    safe: AtomicU64,
}

impl EpochSource for ScriptedSource {
    async fn fetch_epoch_range(&self, low: u64, high: u64) -> Result<Vec<MetricRow>> {
        Ok((low..=high)
            .flat_map(|e| (0..ENTITIES).map(move |v| row(e, v)))
            .collect())
    }

    async fn safe_epoch(&self) -> Result<u64> {
        Ok(self.safe.load(Ordering::SeqCst))
    }
}

pub fn insert_cfg(fetch: usize) -> InsertConfig {
    InsertConfig {
        fetch_at_once_limit: fetch,
        insert_at_once_limit: 8,
        insert_in_parallel: 2,
        ..Default::default()
    }
}

/// Epoch tier with 8-epoch partitions, hourly buckets of 4 epochs and
/// daily buckets of 12.
pub struct Stack {
    _dir: tempfile::TempDir,
    pub store: HotStore,
    pub health: Arc<HealthMetrics>,
    pub source: Arc<ScriptedSource>,
    pub epoch: Tier,
    pub hourly: Tier,
    pub daily: Tier,
    pub gaps: GapDetector,
}

impl Stack {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HotStore::open(&StoreConfig {
            path: dir.path().join("hot.db"),
            acquire_timeout: Duration::from_secs(10),
            ..Default::default()
        })
        .await
        .expect("open store");
        store.migrate().await.expect("migrate");

        let health = Arc::new(HealthMetrics::new("127.0.0.1:0").expect("metrics"));
        let tier = |level: Level, grain: Grain, width: u64| {
            let parts = PartitionManager::new(store.pool().clone(), level, width, Arc::clone(&health))
                .expect("partitions");
            Tier::new(level, grain, Arc::new(parts), None)
        };

        Self {
            epoch: tier(Level::Epoch, Grain::RAW, 8),
            hourly: tier(Level::Hourly, Grain::epochs(4, 0).expect("grain"), 12),
            daily: tier(Level::Daily, Grain::epochs(12, 0).expect("grain"), 24),
            gaps: GapDetector::new(store.pool().clone(), None),
            source: Arc::new(ScriptedSource {
                safe: AtomicU64::new(0),
            }),
            health,
            store,
            _dir: dir,
        }
    }

    /// One insert cycle with `safe` as the source's safe epoch.
    pub async fn insert(&self, safe: u64, fetch: usize, priority: BTreeSet<u64>) -> usize {
        self.source.safe.store(safe, Ordering::SeqCst);
        let pipeline = InsertPipeline::new(
            Arc::clone(&self.source),
            &self.store,
            Arc::clone(&self.epoch.partitions),
            insert_cfg(fetch),
            None,
            Arc::clone(&self.health),
        );
        pipeline.set_priority(priority);
        pipeline.run_cycle().await.expect("insert cycle")
    }

    pub fn hourly_aggregator(&self) -> FixedGrainAggregator {
        FixedGrainAggregator::new(
            self.epoch.clone(),
            self.hourly.clone(),
            &self.store,
            self.gaps.clone(),
            FixedSettings::default(),
            Arc::clone(&self.health),
        )
    }

    pub fn daily_aggregator(&self) -> FixedGrainAggregator {
        FixedGrainAggregator::new(
            self.hourly.clone(),
            self.daily.clone(),
            &self.store,
            self.gaps.clone(),
            FixedSettings::default(),
            Arc::clone(&self.health),
        )
    }

    /// Runs the hourly then the daily rollup once. Returns the buckets
    /// written by each.
    pub async fn roll(&self) -> (usize, usize) {
        let hourly = self.hourly_aggregator().run_cycle().await.expect("hourly");
        let daily = self.daily_aggregator().run_cycle().await.expect("daily");
        (hourly.buckets, daily.buckets)
    }

    /// Inserts everything up to `safe` and rolls it up.
    pub async fn advance(&self, safe: u64) {
        self.insert(safe, 64, BTreeSet::new()).await;
        self.roll().await;
    }

    pub fn context(&self) -> BootstrapContext {
        BootstrapContext {
            pool: self.store.pool().clone(),
            buckets: self.store.buckets(),
            gaps: self.gaps.clone(),
            parts_in_parallel: 2,
        }
    }

    pub async fn window(&self, name: &str, width: Width, strategy: Bootstrap) -> RollingAggregator {
        RollingAggregator::create(
            name,
            width,
            strategy,
            self.context(),
            Arc::clone(&self.epoch.partitions),
            Arc::clone(&self.health),
        )
        .await
        .expect("create window")
    }

    /// Every stored row of a bucket tier, ordered by entity then start.
    pub async fn tier_rows(&self, tier: &Tier) -> Vec<AggregateRow> {
        let mut rows = Vec::new();
        let tables = tier
            .partitions
            .tables_overlapping(EpochRange::new(0, 1_000))
            .await
            .expect("tables");
        for table in tables {
            rows.extend(read_table(self.store.pool(), &table).await.expect("read"));
        }
        rows.sort_by_key(|r| (r.entity, r.range.start));
        rows
    }

    pub async fn window_rows(&self, window: &RollingAggregator) -> Vec<AggregateRow> {
        read_table(self.store.pool(), window.table())
            .await
            .expect("read window")
    }
}
