use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::{fan_out, plan_batches, regroup, Batch};
use crate::config::TransferConfig;
use crate::error::PipelineError;
use crate::export::health::HealthMetrics;
use crate::export::Archive;
use crate::schema::ColumnarBuffer;
use crate::store::rows::read_epoch_rows;
use crate::store::{EpochMetadataStore, HotStore, PartitionManager, Stage};

const PIPELINE: &str = "transfer";

/// Copies inserted epochs from the hot store to the archive.
///
/// Same state machine as the insert pipeline, tracked on the transfer
/// columns of `epoch_metadata`. The archive append happens before the
/// completion marker, so a crash in between repeats the append.
pub struct TransferPipeline<A> {
    archive: Arc<A>,
    pool: SqlitePool,
    metadata: EpochMetadataStore,
    partitions: Arc<PartitionManager>,
    cfg: TransferConfig,
    health: Arc<HealthMetrics>,
}

impl<A: Archive + 'static> TransferPipeline<A> {
    pub fn new(
        archive: Arc<A>,
        store: &HotStore,
        partitions: Arc<PartitionManager>,
        cfg: TransferConfig,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            archive,
            pool: store.pool().clone(),
            metadata: store.metadata(),
            partitions,
            cfg,
            health,
        }
    }

    /// One loop iteration. Returns the number of epochs transferred.
    pub async fn run_cycle(&self) -> Result<usize> {
        let resumed = self.handle_incomplete_transfers().await?;
        let fresh = self.handle_pending_transfers().await?;
        Ok(resumed + fresh)
    }

    pub async fn handle_incomplete_transfers(&self) -> Result<usize> {
        let incomplete = self.metadata.get_incomplete_transfer().await?;
        if incomplete.is_empty() {
            return Ok(0);
        }

        let batches = regroup(&incomplete, Stage::Transfer);
        info!(
            batches = batches.len(),
            epochs = incomplete.len(),
            "resuming incomplete transfer batches"
        );
        self.run_batches(batches).await
    }

    pub async fn handle_pending_transfers(&self) -> Result<usize> {
        let pending = self.metadata.get_pending_transfer(self.cfg.bundle_size).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let epochs: Vec<u64> = pending.iter().map(|m| m.epoch).collect();
        let batches = plan_batches(&epochs, self.cfg.batch_size);

        let current: BTreeMap<u64, _> = pending.into_iter().map(|m| (m.epoch, m)).collect();
        let rows: Vec<_> = batches
            .iter()
            .flat_map(|b| b.assignment(Stage::Transfer, &current))
            .collect();
        self.metadata.push(&rows).await?;

        debug!(
            epochs = epochs.len(),
            batches = batches.len(),
            "scheduled transfer batches"
        );
        self.run_batches(batches).await
    }

    async fn run_batches(&self, batches: Vec<Batch>) -> Result<usize> {
        for batch in &batches {
            batch.ensure_contiguous()?;
        }

        let started = Instant::now();
        let epochs: usize = batches.iter().map(Batch::len).sum();
        let pool = self.pool.clone();
        let partitions = Arc::clone(&self.partitions);
        let archive = Arc::clone(&self.archive);
        let health = Arc::clone(&self.health);
        fan_out(batches, self.cfg.transfer_in_parallel, move |batch| {
            let pool = pool.clone();
            let partitions = Arc::clone(&partitions);
            let archive = Arc::clone(&archive);
            let health = Arc::clone(&health);
            async move {
                let rows = read_epoch_rows(&pool, &partitions, batch.range()).await?;
                check_rows(&batch, &rows)?;

                archive
                    .write_batch(batch.id, &rows)
                    .await
                    .with_context(|| format!("archiving batch {}", batch.id))?;

                let mut conn = pool.acquire().await.context("acquiring connection")?;
                EpochMetadataStore::mark_successful(
                    &mut conn,
                    Stage::Transfer,
                    batch.id,
                    &batch.epochs,
                    Utc::now(),
                )
                .await?;

                health.record_commit(PIPELINE, batch.len());
                info!(
                    batch_id = %batch.id,
                    range = %batch.range(),
                    rows = rows.len(),
                    "transferred batch"
                );
                Ok(())
            }
        })
        .await?;
        self.health.observe_stage(PIPELINE, "write", started);

        Ok(epochs)
    }
}

/// Every epoch of the batch must still have rows in the hot store.
fn check_rows(batch: &Batch, rows: &ColumnarBuffer) -> Result<(), PipelineError> {
    let present: BTreeSet<u64> = rows.epoch_set();
    let missing: Vec<u64> = batch
        .epochs
        .iter()
        .copied()
        .filter(|e| !present.contains(e))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(PipelineError::MissingBatchRows {
        batch_id: batch.id,
        missing,
    })
}
