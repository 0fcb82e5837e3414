use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use super::{fan_out, fetch_spans, plan_batches, regroup, Batch};
use crate::config::InsertConfig;
use crate::error::PipelineError;
use crate::export::health::HealthMetrics;
use crate::schema::{ColumnarBuffer, EpochRange, MetricRow};
use crate::source::EpochSource;
use crate::store::rows::upsert_columns;
use crate::store::{EpochMetadataStore, HotStore, PartitionManager, Stage};

const PIPELINE: &str = "insert";

/// Moves finalized epochs from the source into the epoch partitions.
///
/// Every epoch is assigned to a batch before any work starts. A batch's rows
/// and its completion marker are committed in one transaction, so a crash at
/// any point leaves either nothing or the whole batch, and the next cycle
/// resumes unfinished batches under their original ids.
pub struct InsertPipeline<S> {
    source: Arc<S>,
    pool: SqlitePool,
    metadata: EpochMetadataStore,
    partitions: Arc<PartitionManager>,
    cfg: InsertConfig,
    retention: Option<u64>,
    priority: parking_lot::Mutex<BTreeSet<u64>>,
    health: Arc<HealthMetrics>,
}

impl<S: EpochSource + 'static> InsertPipeline<S> {
    /// `retention` is the epoch-level retention in epochs; nothing older
    /// than that behind the safe epoch is scheduled.
    pub fn new(
        source: Arc<S>,
        store: &HotStore,
        partitions: Arc<PartitionManager>,
        cfg: InsertConfig,
        retention: Option<u64>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            source,
            pool: store.pool().clone(),
            metadata: store.metadata(),
            partitions,
            cfg,
            retention,
            priority: parking_lot::Mutex::new(BTreeSet::new()),
            health,
        }
    }

    /// Replaces the set of epochs scheduled ahead of everything else.
    pub fn set_priority(&self, epochs: BTreeSet<u64>) {
        *self.priority.lock() = epochs;
    }

    /// One loop iteration: resume unfinished batches, then schedule new
    /// ones. Returns the number of epochs committed.
    ///
    /// A batch that keeps failing does not hold back new epochs: pending
    /// epochs are scheduled even when resuming failed, and the resume error
    /// is returned afterwards.
    pub async fn run_cycle(&self) -> Result<usize> {
        let resumed = self.handle_incomplete().await;
        let fresh = self.handle_pending().await;

        if let Some(latest) = self.metadata.latest_inserted().await? {
            self.health.latest_inserted.set(latest as f64);
        }

        if let (Err(e), Err(_)) = (&resumed, &fresh) {
            warn!(error = %format!("{e:#}"), "resuming insert batches failed");
        }
        Ok(fresh? + resumed?)
    }

    /// Reruns batches that were assigned but never committed.
    pub async fn handle_incomplete(&self) -> Result<usize> {
        let incomplete = self.metadata.get_incomplete_insert().await?;
        if incomplete.is_empty() {
            return Ok(0);
        }

        let batches = regroup(&incomplete, Stage::Insert);
        info!(
            batches = batches.len(),
            epochs = incomplete.len(),
            "resuming incomplete insert batches"
        );
        self.run_batches(batches).await
    }

    /// Schedules and runs the next unscheduled epochs up to the safe epoch.
    pub async fn handle_pending(&self) -> Result<usize> {
        let safe = self.source.safe_epoch().await.context("reading safe epoch")?;
        self.health.safe_epoch.set(safe as f64);

        let low = match self.retention {
            Some(r) => self.cfg.start_epoch.max((safe + 1).saturating_sub(r)),
            None => self.cfg.start_epoch,
        };

        let selected = self.select_pending(low, safe).await?;
        if selected.is_empty() {
            debug!(safe, low, "no pending epochs");
            return Ok(0);
        }

        let batches = plan_batches(&selected, self.cfg.insert_at_once_limit);
        self.assign(&batches).await?;

        debug!(
            safe,
            epochs = selected.len(),
            batches = batches.len(),
            "scheduled insert batches"
        );
        self.run_batches(batches).await
    }

    async fn select_pending(&self, low: u64, safe: u64) -> Result<Vec<u64>> {
        if low > safe {
            return Ok(Vec::new());
        }

        let limit = self.cfg.fetch_at_once_limit;
        let priority: Vec<u64> = self
            .priority
            .lock()
            .range(low..=safe)
            .copied()
            .collect();

        if priority.is_empty() {
            return self.metadata.get_pending_insert(safe, limit, low).await;
        }

        let unscheduled = self.metadata.unscheduled_between(low, safe).await?;
        Ok(prioritize(&unscheduled, &priority, limit))
    }

    /// Persists the batch assignment before any work on it starts.
    async fn assign(&self, batches: &[Batch]) -> Result<()> {
        let (Some(first), Some(last)) = (batches.first(), batches.last()) else {
            return Ok(());
        };
        let span = EpochRange::new(first.range().start, last.range().end);

        let current: BTreeMap<u64, _> = self
            .metadata
            .get_range(span)
            .await?
            .into_iter()
            .map(|m| (m.epoch, m))
            .collect();

        let rows: Vec<_> = batches
            .iter()
            .flat_map(|b| b.assignment(Stage::Insert, &current))
            .collect();
        self.metadata.push(&rows).await
    }

    async fn run_batches(&self, batches: Vec<Batch>) -> Result<usize> {
        if batches.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let mut rows = Vec::new();
        for span in fetch_spans(&batches) {
            let Some(high) = span.last() else { continue };
            rows.extend(
                self.source
                    .fetch_epoch_range(span.start, high)
                    .await
                    .with_context(|| format!("fetching epochs {span}"))?,
            );
        }
        self.health.observe_stage(PIPELINE, "fetch", started);

        let started = Instant::now();
        let total = batches.len();
        let Processed {
            ready: work,
            rejected,
        } = process(batches, rows)?;
        self.health.observe_stage(PIPELINE, "process", started);
        for e in &rejected {
            warn!(error = %e, "insert batch rejected");
        }

        for (batch, _) in &work {
            self.partitions.ensure_covering(batch.range()).await?;
        }

        let started = Instant::now();
        let epochs: usize = work.iter().map(|(b, _)| b.len()).sum();
        let pool = self.pool.clone();
        let partitions = Arc::clone(&self.partitions);
        let health = Arc::clone(&self.health);
        fan_out(work, self.cfg.insert_in_parallel, move |(batch, buf)| {
            let pool = pool.clone();
            let partitions = Arc::clone(&partitions);
            let health = Arc::clone(&health);
            async move {
                commit_batch(&pool, &partitions, &batch, &buf).await?;
                health.record_commit(PIPELINE, batch.len());
                info!(
                    batch_id = %batch.id,
                    range = %batch.range(),
                    rows = buf.len(),
                    "inserted batch"
                );
                Ok(())
            }
        })
        .await?;
        self.health.observe_stage(PIPELINE, "write", started);

        let rejected_count = rejected.len();
        match rejected.into_iter().next() {
            Some(first) => Err(anyhow::Error::from(first)
                .context(format!("{rejected_count} of {total} insert batches rejected"))),
            None => Ok(epochs),
        }
    }
}

/// Epochs named in `priority` first, then the rest ascending, at most
/// `limit` in total. Only epochs in `unscheduled` are eligible.
fn prioritize(unscheduled: &[u64], priority: &[u64], limit: usize) -> Vec<u64> {
    let mut selected: Vec<u64> = priority
        .iter()
        .copied()
        .filter(|e| unscheduled.binary_search(e).is_ok())
        .take(limit)
        .collect();

    let chosen: BTreeSet<u64> = selected.iter().copied().collect();
    let rest = limit.saturating_sub(selected.len());
    selected.extend(
        unscheduled
            .iter()
            .copied()
            .filter(|e| !chosen.contains(e))
            .take(rest),
    );
    selected
}

/// Fetched rows split per batch.
#[derive(Debug)]
struct Processed {
    ready: Vec<(Batch, ColumnarBuffer)>,
    /// Batches that failed their checks; they stay assigned and are retried.
    rejected: Vec<PipelineError>,
}

/// Splits fetched rows into one buffer per batch and checks every batch on
/// its own. A row outside all batches fails the whole selection.
fn process(batches: Vec<Batch>, rows: Vec<MetricRow>) -> Result<Processed, PipelineError> {
    let owner: HashMap<u64, usize> = batches
        .iter()
        .enumerate()
        .flat_map(|(i, b)| b.epochs.iter().map(move |&e| (e, i)))
        .collect();

    let mut buffers: Vec<ColumnarBuffer> = batches.iter().map(|_| ColumnarBuffer::default()).collect();
    for row in &rows {
        let Some(&i) = owner.get(&row.epoch) else {
            return Err(PipelineError::UnscheduledEpoch { epoch: row.epoch });
        };
        buffers[i].push(row);
    }

    let mut processed = Processed {
        ready: Vec::with_capacity(batches.len()),
        rejected: Vec::new(),
    };
    for (batch, buf) in batches.into_iter().zip(buffers) {
        if let Err(e) = batch.ensure_contiguous() {
            processed.rejected.push(e);
            continue;
        }

        let present = buf.epoch_set();
        let missing: Vec<u64> = batch
            .epochs
            .iter()
            .copied()
            .filter(|e| !present.contains(e))
            .collect();
        if missing.is_empty() {
            processed.ready.push((batch, buf));
        } else {
            processed.rejected.push(PipelineError::IncompleteFetch {
                batch_id: batch.id,
                missing,
            });
        }
    }

    Ok(processed)
}

/// Writes a batch's rows and marks it successful in one transaction.
async fn commit_batch(
    pool: &SqlitePool,
    partitions: &PartitionManager,
    batch: &Batch,
    buf: &ColumnarBuffer,
) -> Result<()> {
    let mut tx = pool.begin().await.context("beginning insert batch")?;
    upsert_columns(&mut tx, partitions, buf).await?;
    EpochMetadataStore::mark_successful(&mut tx, Stage::Insert, batch.id, &batch.epochs, Utc::now())
        .await?;
    tx.commit()
        .await
        .with_context(|| format!("committing insert batch {}", batch.id))?;
    Ok(())
}
