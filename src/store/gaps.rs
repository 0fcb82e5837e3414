use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::{sql_epoch, BucketStore, EpochMetadataStore, Level};
use crate::error::PipelineError;
use crate::schema::EpochRange;

/// Sorted epochs of `[low, high]` not present in `present`.
///
/// `present` must be ascending; values outside the bounds are ignored.
pub fn complement(present: &[u64], low: u64, high: u64) -> Vec<u64> {
    if low > high {
        return Vec::new();
    }

    let mut missing = Vec::new();
    let mut next = low;
    for &epoch in present {
        if epoch < next {
            continue;
        }
        if epoch > high {
            break;
        }
        missing.extend(next..epoch);
        next = epoch + 1;
    }
    if next <= high {
        missing.extend(next..=high);
    }
    missing
}

/// Finds epochs that are not durably inserted yet.
#[derive(Debug, Clone)]
pub struct GapDetector {
    pool: SqlitePool,
    metadata: EpochMetadataStore,
    buckets: BucketStore,
    retention: Option<u64>,
}

impl GapDetector {
    /// `retention` is the epoch-level retention in epochs.
    pub fn new(pool: SqlitePool, retention: Option<u64>) -> Self {
        Self {
            metadata: EpochMetadataStore::new(pool.clone()),
            buckets: BucketStore::new(pool.clone()),
            pool,
            retention,
        }
    }

    /// Missing epochs in `[low, high]`, ignoring anything that has already
    /// fallen out of retention.
    pub async fn gaps_between(&self, low: u64, high: u64) -> Result<Vec<u64>> {
        let low = match self.retention {
            Some(r) => low.max((high + 1).saturating_sub(r)),
            None => low,
        };
        self.inclusive_gaps(low, high).await
    }

    /// Missing epochs in `range`, without retention clamping.
    pub async fn missing(&self, range: EpochRange) -> Result<Vec<u64>> {
        match range.last() {
            Some(last) => self.inclusive_gaps(range.start, last).await,
            None => Ok(Vec::new()),
        }
    }

    async fn inclusive_gaps(&self, low: u64, high: u64) -> Result<Vec<u64>> {
        if low > high {
            return Ok(Vec::new());
        }
        let present = self
            .metadata
            .inserted_in(EpochRange::inclusive(low, high))
            .await?;
        Ok(complement(&present, low, high))
    }

    /// Fails with a not-ready error unless every epoch of `range` is
    /// inserted.
    pub async fn ensure_complete(&self, level: &'static str, range: EpochRange) -> Result<()> {
        let missing = self.missing(range).await?;
        if missing.is_empty() {
            return Ok(());
        }
        Err(PipelineError::Gap {
            level,
            range,
            missing,
        }
        .into())
    }

    /// Highest epoch `e` such that every epoch of `[from, e]` is inserted.
    pub async fn epoch_frontier(&self, from: u64) -> Result<Option<u64>> {
        let (first, frontier): (Option<i64>, Option<i64>) = sqlx::query_as(
            "WITH ins AS (
                SELECT epoch, LEAD(epoch) OVER (ORDER BY epoch) AS next
                FROM epoch_metadata
                WHERE successful_insert_at IS NOT NULL AND epoch >= ?
            )
            SELECT
                (SELECT MIN(epoch) FROM ins),
                (SELECT MIN(epoch) FROM ins WHERE next IS NULL OR next <> epoch + 1)",
        )
        .bind(sql_epoch(from))
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("computing epoch frontier from {from}"))?;

        if first != Some(sql_epoch(from)) {
            return Ok(None);
        }
        Ok(frontier.map(super::epoch_from_sql))
    }

    /// Highest epoch covered by the chain of contiguous bucket records of
    /// `level` that starts exactly at `from`.
    pub async fn bucket_frontier(&self, level: Level, from: u64) -> Result<Option<u64>> {
        let records = self
            .buckets
            .in_range(level, EpochRange::new(from, u64::MAX))
            .await?;

        let mut expect = from;
        let mut frontier = None;
        for record in records {
            if record.range.start != expect || record.covered_end <= record.range.start {
                break;
            }
            frontier = Some(record.covered_end - 1);
            if !record.is_complete() {
                break;
            }
            expect = record.range.end;
        }

        Ok(frontier)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::store::{testutil, BucketRecord, EpochMetadata, HotStore, Stage};

    async fn insert(store: &HotStore, epochs: &[u64]) {
        let batch = Uuid::new_v4();
        let rows: Vec<EpochMetadata> = epochs
            .iter()
            .map(|&e| EpochMetadata::new(e).with_batch(Stage::Insert, batch))
            .collect();
        store.metadata().push(&rows).await.expect("push");
        let mut conn = store.pool().acquire().await.expect("conn");
        EpochMetadataStore::mark_successful(&mut conn, Stage::Insert, batch, epochs, Utc::now())
            .await
            .expect("mark");
    }

    #[test]
    fn test_complement() {
        assert_eq!(complement(&[0, 1, 2, 5, 7], 0, 7), [3, 4, 6]);
        assert_eq!(complement(&[], 3, 5), [3, 4, 5]);
        assert_eq!(complement(&[1, 9], 3, 5), [3, 4, 5]);
        assert!(complement(&[3, 4, 5], 3, 5).is_empty());
        assert!(complement(&[], 5, 3).is_empty());
    }

    #[tokio::test]
    async fn test_gaps_between() {
        let (_dir, store) = testutil::store().await;
        insert(&store, &[0, 1, 2, 5, 7]).await;

        let gaps = GapDetector::new(store.pool().clone(), None);
        assert_eq!(gaps.gaps_between(0, 7).await.expect("gaps"), [3, 4, 6]);
        assert_eq!(gaps.missing(EpochRange::new(0, 7)).await.expect("missing"), [3, 4, 6]);
        assert!(gaps.missing(EpochRange::new(0, 3)).await.expect("missing").is_empty());
    }

    #[tokio::test]
    async fn test_gaps_between_respects_retention() {
        let (_dir, store) = testutil::store().await;
        insert(&store, &[0, 1, 2, 5, 7]).await;

        // With a retention of 3 only [5, 7] matters.
        let gaps = GapDetector::new(store.pool().clone(), Some(3));
        assert_eq!(gaps.gaps_between(0, 7).await.expect("gaps"), [6]);
        assert_eq!(gaps.missing(EpochRange::new(0, 8)).await.expect("missing"), [3, 4, 6]);
    }

    #[tokio::test]
    async fn test_ensure_complete_is_not_ready() {
        let (_dir, store) = testutil::store().await;
        insert(&store, &[0, 1, 3]).await;
        let gaps = GapDetector::new(store.pool().clone(), None);

        gaps.ensure_complete("epoch", EpochRange::new(0, 2)).await.expect("complete");
        let err = gaps
            .ensure_complete("epoch", EpochRange::new(0, 4))
            .await
            .expect_err("gap");
        let typed = err.downcast_ref::<PipelineError>().expect("typed");
        assert!(typed.is_not_ready());
        assert!(matches!(typed, PipelineError::Gap { missing, .. } if missing == &[2]));
    }

    #[tokio::test]
    async fn test_epoch_frontier() {
        let (_dir, store) = testutil::store().await;
        let gaps = GapDetector::new(store.pool().clone(), None);
        assert_eq!(gaps.epoch_frontier(0).await.expect("frontier"), None);

        insert(&store, &[2, 3, 4, 6]).await;
        assert_eq!(gaps.epoch_frontier(0).await.expect("frontier"), None);
        assert_eq!(gaps.epoch_frontier(2).await.expect("frontier"), Some(4));
        assert_eq!(gaps.epoch_frontier(6).await.expect("frontier"), Some(6));
        assert_eq!(gaps.epoch_frontier(5).await.expect("frontier"), None);
    }

    #[tokio::test]
    async fn test_bucket_frontier_walks_contiguous_records() {
        let (_dir, store) = testutil::store().await;
        let gaps = GapDetector::new(store.pool().clone(), None);

        let mut conn = store.pool().acquire().await.expect("conn");
        for (start, end, covered) in [(0, 9, 9), (9, 18, 18), (18, 27, 20), (40, 49, 49)] {
            let record = BucketRecord {
                level: Level::Hourly,
                range: EpochRange::new(start, end),
                covered_end: covered,
            };
            BucketStore::record(&mut conn, &record).await.expect("record");
        }
        drop(conn);

        assert_eq!(gaps.bucket_frontier(Level::Hourly, 0).await.expect("f"), Some(19));
        assert_eq!(gaps.bucket_frontier(Level::Hourly, 9).await.expect("f"), Some(19));
        assert_eq!(gaps.bucket_frontier(Level::Hourly, 3).await.expect("f"), None);
        assert_eq!(gaps.bucket_frontier(Level::Hourly, 40).await.expect("f"), Some(48));
        assert_eq!(gaps.bucket_frontier(Level::Daily, 0).await.expect("f"), None);
    }
}
