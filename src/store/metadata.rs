use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::gaps::complement;
use super::{epoch_from_sql, sql_epoch};
use crate::error::PipelineError;
use crate::schema::EpochRange;

/// Rows bound per multi-row statement.
const PUSH_CHUNK: usize = 500;

/// A pipeline that tracks per-epoch progress in `epoch_metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Insert,
    Transfer,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Stage::Insert => "insert",
            Stage::Transfer => "transfer",
        }
    }

    const fn batch_column(self) -> &'static str {
        match self {
            Stage::Insert => "insert_batch_id",
            Stage::Transfer => "transfer_batch_id",
        }
    }

    const fn success_column(self) -> &'static str {
        match self {
            Stage::Insert => "successful_insert_at",
            Stage::Transfer => "successful_transfer_at",
        }
    }
}

/// Pipeline state of one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochMetadata {
    pub epoch: u64,
    pub insert_batch_id: Option<Uuid>,
    pub successful_insert_at: Option<DateTime<Utc>>,
    pub transfer_batch_id: Option<Uuid>,
    pub successful_transfer_at: Option<DateTime<Utc>>,
}

impl EpochMetadata {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            insert_batch_id: None,
            successful_insert_at: None,
            transfer_batch_id: None,
            successful_transfer_at: None,
        }
    }

    pub fn batch_id(&self, stage: Stage) -> Option<Uuid> {
        match stage {
            Stage::Insert => self.insert_batch_id,
            Stage::Transfer => self.transfer_batch_id,
        }
    }

    pub fn completed_at(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::Insert => self.successful_insert_at,
            Stage::Transfer => self.successful_transfer_at,
        }
    }

    /// Assigns the epoch to a batch of `stage`.
    pub fn with_batch(mut self, stage: Stage, batch_id: Uuid) -> Self {
        match stage {
            Stage::Insert => self.insert_batch_id = Some(batch_id),
            Stage::Transfer => self.transfer_batch_id = Some(batch_id),
        }
        self
    }

    /// Whether the epoch's rows are durably in the hot store.
    pub fn is_inserted(&self) -> bool {
        self.successful_insert_at.is_some()
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            epoch: epoch_from_sql(row.try_get("epoch")?),
            insert_batch_id: row.try_get("insert_batch_id")?,
            successful_insert_at: row.try_get("successful_insert_at")?,
            transfer_batch_id: row.try_get("transfer_batch_id")?,
            successful_transfer_at: row.try_get("successful_transfer_at")?,
        })
    }

    /// Rejects a write that would move a pending epoch to another batch.
    fn check_transition(&self, next: &EpochMetadata) -> Result<(), PipelineError> {
        for stage in [Stage::Insert, Stage::Transfer] {
            let (Some(existing), None) = (self.batch_id(stage), self.completed_at(stage)) else {
                continue;
            };
            if next.batch_id(stage) != Some(existing) {
                return Err(PipelineError::BatchReassigned {
                    epoch: self.epoch,
                    existing,
                    attempted: next.batch_id(stage).unwrap_or_default(),
                });
            }
        }
        Ok(())
    }
}

const SELECT_COLUMNS: &str = "SELECT epoch, insert_batch_id, successful_insert_at, \
     transfer_batch_id, successful_transfer_at FROM epoch_metadata";

/// Reads and writes `epoch_metadata`.
#[derive(Debug, Clone)]
pub struct EpochMetadataStore {
    pool: SqlitePool,
}

impl EpochMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, sql: &str, binds: &[i64]) -> Result<Vec<EpochMetadata>> {
        let mut query = sqlx::query(sql);
        for &b in binds {
            query = query.bind(b);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("reading epoch metadata")?;
        rows.iter().map(EpochMetadata::from_row).collect()
    }

    /// Metadata rows inside `range`, ascending.
    pub async fn get_range(&self, range: EpochRange) -> Result<Vec<EpochMetadata>> {
        self.fetch(
            &format!("{SELECT_COLUMNS} WHERE epoch >= ? AND epoch < ? ORDER BY epoch"),
            &[sql_epoch(range.start), sql_epoch(range.end)],
        )
        .await
    }

    /// Epochs assigned to a batch of `stage` that never completed.
    pub async fn get_incomplete(&self, stage: Stage) -> Result<Vec<EpochMetadata>> {
        self.fetch(
            &format!(
                "{SELECT_COLUMNS} WHERE {} IS NOT NULL AND {} IS NULL ORDER BY epoch",
                stage.batch_column(),
                stage.success_column()
            ),
            &[],
        )
        .await
    }

    pub async fn get_incomplete_insert(&self) -> Result<Vec<EpochMetadata>> {
        self.get_incomplete(Stage::Insert).await
    }

    pub async fn get_incomplete_transfer(&self) -> Result<Vec<EpochMetadata>> {
        self.get_incomplete(Stage::Transfer).await
    }

    /// Every epoch in `[low, high]` without an insert batch, ascending.
    /// Epochs that have no metadata row at all are included.
    pub async fn unscheduled_between(&self, low: u64, high: u64) -> Result<Vec<u64>> {
        if low > high {
            return Ok(Vec::new());
        }

        let scheduled: Vec<i64> = sqlx::query_scalar(
            "SELECT epoch FROM epoch_metadata
             WHERE insert_batch_id IS NOT NULL AND epoch >= ? AND epoch <= ?
             ORDER BY epoch",
        )
        .bind(sql_epoch(low))
        .bind(sql_epoch(high))
        .fetch_all(&self.pool)
        .await
        .context("reading scheduled epochs")?;

        let scheduled: Vec<u64> = scheduled.into_iter().map(epoch_from_sql).collect();
        Ok(complement(&scheduled, low, high))
    }

    /// Up to `limit` unscheduled epochs in `[low, safe_epoch]`, ascending.
    ///
    /// Reads the holes between scheduled runs rather than every epoch, so
    /// the work is bounded by `limit` and not by the width of the range.
    pub async fn get_pending_insert(
        &self,
        safe_epoch: u64,
        limit: usize,
        low: u64,
    ) -> Result<Vec<u64>> {
        if low > safe_epoch || limit == 0 {
            return Ok(Vec::new());
        }

        let first: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(epoch) FROM epoch_metadata
             WHERE insert_batch_id IS NOT NULL AND epoch >= ? AND epoch <= ?",
        )
        .bind(sql_epoch(low))
        .bind(sql_epoch(safe_epoch))
        .fetch_one(&self.pool)
        .await
        .context("reading first scheduled epoch")?;

        let mut holes = Vec::new();
        match first.map(epoch_from_sql) {
            None => holes.push((low, safe_epoch)),
            Some(first) => {
                if first > low {
                    holes.push((low, first - 1));
                }
                let after: Vec<(i64, i64)> = sqlx::query_as(
                    "WITH s AS (
                        SELECT epoch, LEAD(epoch) OVER (ORDER BY epoch) AS next
                        FROM epoch_metadata
                        WHERE insert_batch_id IS NOT NULL AND epoch >= ? AND epoch <= ?
                    )
                    SELECT epoch + 1, COALESCE(next - 1, ?) FROM s
                    WHERE (next IS NULL AND epoch < ?) OR next > epoch + 1
                    ORDER BY epoch
                    LIMIT ?",
                )
                .bind(sql_epoch(low))
                .bind(sql_epoch(safe_epoch))
                .bind(sql_epoch(safe_epoch))
                .bind(sql_epoch(safe_epoch))
                .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                .fetch_all(&self.pool)
                .await
                .context("reading unscheduled runs")?;
                holes.extend(
                    after
                        .into_iter()
                        .map(|(start, end)| (epoch_from_sql(start), epoch_from_sql(end))),
                );
            }
        }

        let mut epochs = Vec::with_capacity(limit);
        for (start, end) in holes {
            for epoch in start..=end {
                if epochs.len() == limit {
                    return Ok(epochs);
                }
                epochs.push(epoch);
            }
        }
        Ok(epochs)
    }

    /// Up to `limit` inserted epochs that have no transfer batch yet.
    pub async fn get_pending_transfer(&self, limit: usize) -> Result<Vec<EpochMetadata>> {
        self.fetch(
            &format!(
                "{SELECT_COLUMNS} WHERE successful_insert_at IS NOT NULL \
                 AND transfer_batch_id IS NULL ORDER BY epoch LIMIT ?"
            ),
            &[i64::try_from(limit).unwrap_or(i64::MAX)],
        )
        .await
    }

    /// Upserts the full desired state of each row.
    ///
    /// Fails without writing anything if a row would move an epoch that is
    /// still pending in one batch to another.
    pub async fn push(&self, rows: &[EpochMetadata]) -> Result<()> {
        let (Some(low), Some(high)) = (
            rows.iter().map(|r| r.epoch).min(),
            rows.iter().map(|r| r.epoch).max(),
        ) else {
            return Ok(());
        };

        let mut tx = self.pool.begin().await.context("beginning metadata push")?;

        let existing = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE epoch >= ? AND epoch <= ?"
        ))
        .bind(sql_epoch(low))
        .bind(sql_epoch(high))
        .fetch_all(&mut *tx)
        .await
        .context("reading current metadata")?;

        let existing: HashMap<u64, EpochMetadata> = existing
            .iter()
            .map(|row| EpochMetadata::from_row(row).map(|m| (m.epoch, m)))
            .collect::<Result<_>>()?;

        for row in rows {
            if let Some(current) = existing.get(&row.epoch) {
                current.check_transition(row)?;
            }
        }

        for chunk in rows.chunks(PUSH_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO epoch_metadata (epoch, insert_batch_id, successful_insert_at, \
                 transfer_batch_id, successful_transfer_at) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(sql_epoch(row.epoch))
                    .push_bind(row.insert_batch_id)
                    .push_bind(row.successful_insert_at)
                    .push_bind(row.transfer_batch_id)
                    .push_bind(row.successful_transfer_at);
            });
            qb.push(
                " ON CONFLICT(epoch) DO UPDATE SET \
                 insert_batch_id = excluded.insert_batch_id, \
                 successful_insert_at = excluded.successful_insert_at, \
                 transfer_batch_id = excluded.transfer_batch_id, \
                 successful_transfer_at = excluded.successful_transfer_at",
            );
            qb.build()
                .execute(&mut *tx)
                .await
                .context("upserting epoch metadata")?;
        }

        tx.commit().await.context("committing metadata push")?;

        Ok(())
    }

    /// Marks a batch's epochs complete on the caller's transaction. This is
    /// the commit point of a batch.
    pub async fn mark_successful(
        conn: &mut SqliteConnection,
        stage: Stage,
        batch_id: Uuid,
        epochs: &[u64],
        at: DateTime<Utc>,
    ) -> Result<()> {
        if epochs.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "UPDATE epoch_metadata SET {} = ",
            stage.success_column()
        ));
        qb.push_bind(at);
        qb.push(format!(" WHERE {} = ", stage.batch_column()));
        qb.push_bind(batch_id);
        qb.push(" AND epoch IN (");
        let mut sep = qb.separated(", ");
        for &epoch in epochs {
            sep.push_bind(sql_epoch(epoch));
        }
        sep.push_unseparated(")");

        let updated = qb
            .build()
            .execute(&mut *conn)
            .await
            .with_context(|| format!("marking {} batch {batch_id} successful", stage.as_str()))?
            .rows_affected();

        if updated != epochs.len() as u64 {
            bail!(
                "{} batch {batch_id} covers {} epochs but only {updated} metadata rows matched",
                stage.as_str(),
                epochs.len()
            );
        }

        Ok(())
    }

    async fn scalar_epoch(&self, sql: &str) -> Result<Option<u64>> {
        let value: Option<i64> = sqlx::query_scalar(sql)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("querying {sql}"))?;
        Ok(value.map(epoch_from_sql))
    }

    /// Highest durably inserted epoch.
    pub async fn latest_inserted(&self) -> Result<Option<u64>> {
        self.scalar_epoch(
            "SELECT MAX(epoch) FROM epoch_metadata WHERE successful_insert_at IS NOT NULL",
        )
        .await
    }

    /// Lowest durably inserted epoch.
    pub async fn lowest_inserted(&self) -> Result<Option<u64>> {
        self.scalar_epoch(
            "SELECT MIN(epoch) FROM epoch_metadata WHERE successful_insert_at IS NOT NULL",
        )
        .await
    }

    /// Lowest epoch whose rows have not reached the archive.
    pub async fn first_untransferred(&self) -> Result<Option<u64>> {
        self.scalar_epoch(
            "SELECT MIN(epoch) FROM epoch_metadata WHERE successful_transfer_at IS NULL",
        )
        .await
    }

    /// Durably inserted epochs inside `range`, ascending.
    pub async fn inserted_in(&self, range: EpochRange) -> Result<Vec<u64>> {
        let epochs: Vec<i64> = sqlx::query_scalar(
            "SELECT epoch FROM epoch_metadata
             WHERE successful_insert_at IS NOT NULL AND epoch >= ? AND epoch < ?
             ORDER BY epoch",
        )
        .bind(sql_epoch(range.start))
        .bind(sql_epoch(range.end))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("reading inserted epochs in {range}"))?;

        Ok(epochs.into_iter().map(epoch_from_sql).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil;

    async fn complete(pool: &SqlitePool, stage: Stage, batch: Uuid, epochs: &[u64]) {
        let mut conn = pool.acquire().await.expect("conn");
        EpochMetadataStore::mark_successful(&mut conn, stage, batch, epochs, Utc::now())
            .await
            .expect("mark");
    }

    fn scheduled(epochs: std::ops::Range<u64>, batch: Uuid) -> Vec<EpochMetadata> {
        epochs
            .map(|e| EpochMetadata::new(e).with_batch(Stage::Insert, batch))
            .collect()
    }

    #[tokio::test]
    async fn test_push_is_idempotent() {
        let (_dir, store) = testutil::store().await;
        let meta = store.metadata();
        let batch = Uuid::new_v4();

        let rows = scheduled(0..4, batch);
        meta.push(&rows).await.expect("first push");
        meta.push(&rows).await.expect("second push");

        let stored = meta.get_range(EpochRange::new(0, 10)).await.expect("read");
        assert_eq!(stored, rows);
    }

    #[tokio::test]
    async fn test_push_rejects_reassignment_of_pending_epoch() {
        let (_dir, store) = testutil::store().await;
        let meta = store.metadata();
        let first = Uuid::new_v4();
        meta.push(&scheduled(0..4, first)).await.expect("push");

        let err = meta
            .push(&scheduled(2..6, Uuid::new_v4()))
            .await
            .expect_err("reassignment");
        let typed = err.downcast_ref::<PipelineError>().expect("typed error");
        assert!(matches!(typed, PipelineError::BatchReassigned { epoch: 2, existing, .. } if *existing == first));
        assert!(!typed.is_not_ready());

        // Nothing from the rejected push was written.
        let stored = meta.get_range(EpochRange::new(0, 10)).await.expect("read");
        assert_eq!(stored.len(), 4);
    }

    #[tokio::test]
    async fn test_incomplete_and_mark_successful() {
        let (_dir, store) = testutil::store().await;
        let meta = store.metadata();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        meta.push(&scheduled(0..2, a)).await.expect("push a");
        meta.push(&scheduled(2..4, b)).await.expect("push b");

        complete(store.pool(), Stage::Insert, a, &[0, 1]).await;

        let incomplete = meta.get_incomplete_insert().await.expect("incomplete");
        assert_eq!(incomplete.iter().map(|m| m.epoch).collect::<Vec<_>>(), [2, 3]);
        assert!(incomplete.iter().all(|m| m.insert_batch_id == Some(b)));

        assert_eq!(meta.latest_inserted().await.expect("latest"), Some(1));
        assert_eq!(meta.lowest_inserted().await.expect("lowest"), Some(0));
        assert_eq!(meta.inserted_in(EpochRange::new(0, 10)).await.expect("in"), [0, 1]);
    }

    #[tokio::test]
    async fn test_mark_successful_requires_matching_batch() {
        let (_dir, store) = testutil::store().await;
        let meta = store.metadata();
        meta.push(&scheduled(0..2, Uuid::new_v4())).await.expect("push");

        let mut conn = store.pool().acquire().await.expect("conn");
        let err = EpochMetadataStore::mark_successful(
            &mut conn,
            Stage::Insert,
            Uuid::new_v4(),
            &[0, 1],
            Utc::now(),
        )
        .await
        .expect_err("wrong batch");
        assert!(err.to_string().contains("only 0 metadata rows matched"));
    }

    #[tokio::test]
    async fn test_pending_insert_skips_scheduled_epochs() {
        let (_dir, store) = testutil::store().await;
        let meta = store.metadata();
        meta.push(&scheduled(2..4, Uuid::new_v4())).await.expect("push");
        meta.push(&scheduled(6..7, Uuid::new_v4())).await.expect("push");

        assert_eq!(meta.get_pending_insert(9, 100, 0).await.expect("pending"), [0, 1, 4, 5, 7, 8, 9]);
        assert_eq!(meta.get_pending_insert(9, 3, 0).await.expect("pending"), [0, 1, 4]);
        assert_eq!(meta.get_pending_insert(9, 100, 5).await.expect("pending"), [5, 7, 8, 9]);
        assert!(meta.get_pending_insert(3, 100, 5).await.expect("pending").is_empty());
        assert!(meta.get_pending_insert(9, 0, 0).await.expect("pending").is_empty());
    }

    #[tokio::test]
    async fn test_pending_insert_stops_at_limit_over_wide_range() {
        let (_dir, store) = testutil::store().await;
        let meta = store.metadata();
        meta.push(&scheduled(0..4, Uuid::new_v4())).await.expect("push");
        meta.push(&scheduled(5..6, Uuid::new_v4())).await.expect("push");
        let safe = 1 << 40;

        assert_eq!(meta.get_pending_insert(safe, 3, 0).await.expect("pending"), [4, 6, 7]);
        assert_eq!(meta.get_pending_insert(safe, 2, 6).await.expect("pending"), [6, 7]);
        // Nothing scheduled at or above the floor.
        assert_eq!(meta.get_pending_insert(safe, 2, 100).await.expect("pending"), [100, 101]);
        // Fully scheduled prefix ending exactly at the safe epoch.
        assert!(meta.get_pending_insert(3, 10, 0).await.expect("pending").is_empty());
    }

    #[tokio::test]
    async fn test_pending_transfer_and_completion_after_success() {
        let (_dir, store) = testutil::store().await;
        let meta = store.metadata();
        let batch = Uuid::new_v4();
        meta.push(&scheduled(0..3, batch)).await.expect("push");
        complete(store.pool(), Stage::Insert, batch, &[0, 1, 2]).await;

        let pending = meta.get_pending_transfer(2).await.expect("pending");
        assert_eq!(pending.iter().map(|m| m.epoch).collect::<Vec<_>>(), [0, 1]);
        assert_eq!(meta.first_untransferred().await.expect("first"), Some(0));

        let transfer = Uuid::new_v4();
        let rows: Vec<EpochMetadata> = pending
            .into_iter()
            .map(|m| m.with_batch(Stage::Transfer, transfer))
            .collect();
        meta.push(&rows).await.expect("assign transfer");
        complete(store.pool(), Stage::Transfer, transfer, &[0, 1]).await;

        assert_eq!(meta.first_untransferred().await.expect("first"), Some(2));
        assert!(meta.get_incomplete_transfer().await.expect("incomplete").is_empty());
    }
}
