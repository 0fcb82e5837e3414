//! Bulk reads and writes of metric rows.

use std::collections::BTreeMap;
use std::fmt::Write;

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};

use super::{epoch_from_sql, sql_epoch, PartitionManager};
use crate::schema::query::{field_columns, source_union, AggregateSql};
use crate::schema::{AggregateRow, ColumnarBuffer, EpochRange, Field, MetricRow, Values};

/// Rows per multi-row `INSERT`. Each row binds 19 parameters, which keeps a
/// chunk well under SQLite's variable limit.
pub const WRITE_CHUNK: usize = 1_000;

fn read_values(row: &SqliteRow) -> Result<Values> {
    let mut values = Values::default();
    for field in Field::ALL {
        values[field] = row
            .try_get(field.name())
            .with_context(|| format!("decoding column {field}"))?;
    }
    Ok(values)
}

fn insert_head(table: &str) -> String {
    format!(
        "INSERT INTO {table} (entity, epoch_start, epoch_end, {}) ",
        field_columns()
    )
}

fn replace_tail(conflict: &str) -> String {
    let mut sql = format!(" ON CONFLICT({conflict}) DO UPDATE SET epoch_end = excluded.epoch_end");
    for field in Field::ALL {
        let _ = write!(sql, ", {0} = excluded.{0}", field.name());
    }
    sql
}

/// Upserts raw epoch rows into the partitions of `parts` on the caller's
/// transaction. Every partition touched must already exist.
pub async fn upsert_columns(
    conn: &mut SqliteConnection,
    parts: &PartitionManager,
    buf: &ColumnarBuffer,
) -> Result<()> {
    let mut by_partition: BTreeMap<EpochRange, Vec<usize>> = BTreeMap::new();
    for (i, &epoch) in buf.epochs.iter().enumerate() {
        by_partition
            .entry(parts.partition_for(epoch))
            .or_default()
            .push(i);
    }

    let tail = replace_tail("entity, epoch_start");
    for (range, indexes) in by_partition {
        let table = parts.table_name(range);
        for chunk in indexes.chunks(WRITE_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(insert_head(&table));
            qb.push_values(chunk, |mut b, &i| {
                let epoch = buf.epochs[i];
                b.push_bind(sql_epoch(buf.entities[i]))
                    .push_bind(sql_epoch(epoch))
                    .push_bind(sql_epoch(epoch + 1));
                for field in Field::ALL {
                    b.push_bind(buf.columns[field.index()][i]);
                }
            });
            qb.push(&tail);
            qb.build()
                .execute(&mut *conn)
                .await
                .with_context(|| format!("writing {} rows into {table}", chunk.len()))?;
        }
    }

    Ok(())
}

/// Raw epoch rows in `range`, ordered by epoch then entity.
pub async fn read_epoch_rows(
    pool: &SqlitePool,
    parts: &PartitionManager,
    range: EpochRange,
) -> Result<ColumnarBuffer> {
    let mut buf = ColumnarBuffer::default();
    for table in parts.tables_overlapping(range).await? {
        let rows = sqlx::query(&format!(
            "SELECT entity, epoch_start, {} FROM {table}
             WHERE epoch_start >= ? AND epoch_start < ?
             ORDER BY epoch_start, entity",
            field_columns()
        ))
        .bind(sql_epoch(range.start))
        .bind(sql_epoch(range.end))
        .fetch_all(pool)
        .await
        .with_context(|| format!("reading rows of {table} in {range}"))?;

        for row in &rows {
            let epoch = epoch_from_sql(row.try_get("epoch_start")?);
            let entity = epoch_from_sql(row.try_get("entity")?);
            buf.push(&MetricRow {
                epoch,
                entity,
                values: read_values(row)?,
            });
        }
    }
    Ok(buf)
}

fn aggregate_from_row(row: &SqliteRow) -> Result<AggregateRow> {
    Ok(AggregateRow {
        entity: epoch_from_sql(row.try_get("entity")?),
        range: EpochRange::new(
            epoch_from_sql(row.try_get("first_epoch")?),
            epoch_from_sql(row.try_get("last_end")?),
        ),
        values: read_values(row)?,
    })
}

/// Per-entity aggregate of the rows of `tables` whose start lies in
/// `range`, ordered by entity.
pub async fn aggregate_range(
    pool: &SqlitePool,
    tables: &[String],
    range: EpochRange,
) -> Result<Vec<AggregateRow>> {
    let Some(source) = source_union(tables, range) else {
        return Ok(Vec::new());
    };

    let rows = sqlx::query(&AggregateSql::over(source).select())
        .fetch_all(pool)
        .await
        .with_context(|| format!("aggregating {range}"))?;

    rows.iter().map(aggregate_from_row).collect()
}

/// Writes aggregates into `table` with `range` as their bounds, replacing
/// any row of the same entity.
pub async fn insert_aggregates(
    conn: &mut SqliteConnection,
    table: &str,
    rows: &[AggregateRow],
    range: EpochRange,
) -> Result<()> {
    let tail = replace_tail("entity");
    for chunk in rows.chunks(WRITE_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(insert_head(table));
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(sql_epoch(row.entity))
                .push_bind(sql_epoch(range.start))
                .push_bind(sql_epoch(range.end));
            for (_, value) in row.values.iter() {
                b.push_bind(value);
            }
        });
        qb.push(&tail);
        qb.build()
            .execute(&mut *conn)
            .await
            .with_context(|| format!("writing {} aggregates into {table}", chunk.len()))?;
    }
    Ok(())
}

/// Every row of a stored aggregate table, ordered by entity then start.
pub async fn read_table(pool: &SqlitePool, table: &str) -> Result<Vec<AggregateRow>> {
    let rows = sqlx::query(&format!(
        "SELECT entity, epoch_start AS first_epoch, epoch_end AS last_end, {} FROM {table}
         ORDER BY entity, epoch_start",
        field_columns()
    ))
    .fetch_all(pool)
    .await
    .with_context(|| format!("reading {table}"))?;

    rows.iter().map(aggregate_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::query::create_rolling_table;
    use crate::store::{testutil, Level};

    fn row(epoch: u64, entity: u64, reward: i64, balance: i64) -> MetricRow {
        MetricRow::new(epoch, entity)
            .with(Field::AttestationReward, reward)
            .with(Field::BalanceStart, balance)
            .with(Field::BalanceEnd, balance + reward)
            .with(Field::LastAttestationEpoch, epoch as i64)
    }

    async fn written(epochs: std::ops::Range<u64>) -> (tempfile::TempDir, crate::store::HotStore, PartitionManager) {
        let (dir, store) = testutil::store().await;
        let parts = PartitionManager::new(store.pool().clone(), Level::Epoch, 4, testutil::health())
            .expect("parts");
        parts
            .ensure_covering(EpochRange::new(epochs.start, epochs.end))
            .await
            .expect("partitions");

        let buf: ColumnarBuffer = epochs
            .flat_map(|e| [row(e, 1, e as i64, 100), row(e, 2, 2 * e as i64, 200)])
            .collect();
        let mut conn = store.pool().acquire().await.expect("conn");
        upsert_columns(&mut conn, &parts, &buf).await.expect("write");
        drop(conn);
        (dir, store, parts)
    }

    #[tokio::test]
    async fn test_upsert_spans_partitions_and_reads_back() {
        let (_dir, store, parts) = written(2..7).await;

        let back = read_epoch_rows(store.pool(), &parts, EpochRange::new(3, 6))
            .await
            .expect("read");
        assert_eq!(back.len(), 6);
        assert_eq!(back.epoch_set().into_iter().collect::<Vec<_>>(), [3, 4, 5]);
        assert_eq!(back.row(0), row(3, 1, 3, 100));
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_rows() {
        let (_dir, store, parts) = written(0..2).await;

        let replacement: ColumnarBuffer = [row(1, 1, 50, 100)].into_iter().collect();
        let mut conn = store.pool().acquire().await.expect("conn");
        upsert_columns(&mut conn, &parts, &replacement).await.expect("rewrite");
        drop(conn);

        let back = read_epoch_rows(store.pool(), &parts, EpochRange::new(1, 2))
            .await
            .expect("read");
        assert_eq!(back.len(), 2);
        assert_eq!(back.row(0).values[Field::AttestationReward], 50);
    }

    #[tokio::test]
    async fn test_aggregate_range_applies_merge_kinds() {
        let (_dir, store, parts) = written(2..7).await;
        let range = EpochRange::new(3, 6);
        let tables = parts.tables_overlapping(range).await.expect("tables");

        let aggs = aggregate_range(store.pool(), &tables, range).await.expect("aggregate");
        assert_eq!(aggs.len(), 2);

        let first = &aggs[0];
        assert_eq!(first.entity, 1);
        assert_eq!(first.range, range);
        assert_eq!(first.values[Field::AttestationReward], 3 + 4 + 5);
        assert_eq!(first.values[Field::BalanceStart], 100);
        assert_eq!(first.values[Field::BalanceEnd], 105);
        assert_eq!(first.values[Field::LastAttestationEpoch], 5);
        assert_eq!(aggs[1].values[Field::AttestationReward], 2 * (3 + 4 + 5));
    }

    #[tokio::test]
    async fn test_insert_aggregates_into_rolling_table() {
        let (_dir, store, parts) = written(0..4).await;
        let range = EpochRange::new(0, 4);
        let tables = parts.tables_overlapping(range).await.expect("tables");
        let aggs = aggregate_range(store.pool(), &tables, range).await.expect("aggregate");

        sqlx::query(&create_rolling_table("rolling_test"))
            .execute(store.pool())
            .await
            .expect("create");
        let mut conn = store.pool().acquire().await.expect("conn");
        insert_aggregates(&mut conn, "rolling_test", &aggs, range).await.expect("insert");
        insert_aggregates(&mut conn, "rolling_test", &aggs, range).await.expect("reinsert");
        drop(conn);

        let back = read_table(store.pool(), "rolling_test").await.expect("read");
        assert_eq!(back, aggs);
    }
}
