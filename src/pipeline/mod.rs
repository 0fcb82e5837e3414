//! Batch state machines moving epochs from the source into the hot store and
//! from the hot store into the archive.

pub mod insert;
pub mod transfer;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::schema::EpochRange;
use crate::store::{EpochMetadata, Stage};

pub use insert::InsertPipeline;
pub use transfer::TransferPipeline;

/// Epochs that are written and committed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub id: Uuid,
    /// Ascending.
    pub epochs: Vec<u64>,
}

impl Batch {
    pub fn new(epochs: Vec<u64>) -> Self {
        Self::with_id(Uuid::new_v4(), epochs)
    }

    pub fn with_id(id: Uuid, mut epochs: Vec<u64>) -> Self {
        epochs.sort_unstable();
        epochs.dedup();
        Self { id, epochs }
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// Smallest range containing every epoch of the batch.
    pub fn range(&self) -> EpochRange {
        match (self.epochs.first(), self.epochs.last()) {
            (Some(&first), Some(&last)) => EpochRange::inclusive(first, last),
            _ => EpochRange::new(0, 0),
        }
    }

    /// Fails unless the epochs form one run without holes.
    pub fn ensure_contiguous(&self) -> Result<(), PipelineError> {
        if self.range().len() == self.epochs.len() as u64 {
            return Ok(());
        }
        Err(PipelineError::NonContiguousBatch {
            batch_id: self.id,
            epochs: self.epochs.clone(),
        })
    }

    /// Metadata rows assigning every epoch of this batch to `stage`,
    /// starting from the current state where one exists.
    pub fn assignment(&self, stage: Stage, current: &BTreeMap<u64, EpochMetadata>) -> Vec<EpochMetadata> {
        self.epochs
            .iter()
            .map(|&e| {
                current
                    .get(&e)
                    .cloned()
                    .unwrap_or_else(|| EpochMetadata::new(e))
                    .with_batch(stage, self.id)
            })
            .collect()
    }
}

/// Splits selected epochs into batches of at most `max` contiguous epochs.
pub fn plan_batches(epochs: &[u64], max: usize) -> Vec<Batch> {
    let max = max.max(1);
    let mut sorted = epochs.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut batches = Vec::new();
    let mut current: Vec<u64> = Vec::with_capacity(max);
    for epoch in sorted {
        let breaks = current
            .last()
            .is_some_and(|&last| last + 1 != epoch || current.len() >= max);
        if breaks {
            batches.push(Batch::new(std::mem::take(&mut current)));
        }
        current.push(epoch);
    }
    if !current.is_empty() {
        batches.push(Batch::new(current));
    }
    batches
}

/// Rebuilds the batches of unfinished `stage` work, oldest first.
pub fn regroup(rows: &[EpochMetadata], stage: Stage) -> Vec<Batch> {
    let mut by_id: BTreeMap<Uuid, Vec<u64>> = BTreeMap::new();
    for row in rows {
        if let Some(id) = row.batch_id(stage) {
            by_id.entry(id).or_default().push(row.epoch);
        }
    }

    let mut batches: Vec<Batch> = by_id
        .into_iter()
        .map(|(id, epochs)| Batch::with_id(id, epochs))
        .collect();
    batches.sort_by_key(|b| b.epochs.first().copied());
    batches
}

/// Contiguous runs covering every epoch of `batches`.
pub fn fetch_spans(batches: &[Batch]) -> Vec<EpochRange> {
    let mut epochs: Vec<u64> = batches.iter().flat_map(|b| b.epochs.iter().copied()).collect();
    epochs.sort_unstable();
    epochs.dedup();

    let mut spans: Vec<EpochRange> = Vec::new();
    for epoch in epochs {
        match spans.last_mut() {
            Some(span) if span.end == epoch => span.end += 1,
            _ => spans.push(EpochRange::new(epoch, epoch + 1)),
        }
    }
    spans
}

/// Runs `f` over every item with at most `limit` running at once, waits
/// for all of them and returns their results in input order, or the first
/// error observed.
pub async fn fan_out<T, R, F, Fut>(items: Vec<T>, limit: usize, f: F) -> Result<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut in_flight = JoinSet::new();
    let total = items.len();

    for (index, item) in items.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let task = f(item);
        in_flight.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .context("fan-out semaphore closed")?;
            task.await.map(|r| (index, r))
        });
    }

    let mut results = Vec::with_capacity(total);
    let mut first_err = None;
    while let Some(joined) = in_flight.join_next().await {
        let outcome = joined
            .map_err(|e| anyhow!(e).context("fan-out task failed to join"))
            .and_then(|r| r);
        match outcome {
            Ok(done) => results.push(done),
            Err(e) if first_err.is_none() => first_err = Some(e),
            Err(e) => tracing::debug!(error = %e, "additional fan-out failure"),
        }
    }

    if let Some(e) = first_err {
        return Err(e);
    }

    results.sort_unstable_by_key(|(index, _)| *index);
    Ok(results.into_iter().map(|(_, r)| r).collect())
}
