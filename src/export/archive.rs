use std::fmt::Write;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;
use uuid::Uuid;

use crate::export::health::HealthMetrics;
use crate::schema::query::field_columns;
use crate::schema::{ColumnarBuffer, Field};

/// Archive table receiving transferred epoch rows.
pub const ARCHIVE_TABLE: &str = "validator_epochs";

/// Rows per `INSERT` statement sent to ClickHouse.
const ROWS_PER_STATEMENT: usize = 10_000;

/// Long-term store for epoch rows that left the hot store.
///
/// Appends must be safe to repeat: a batch whose completion marker was lost
/// in a crash is appended again.
pub trait Archive: Send + Sync {
    fn write_batch(
        &self,
        batch_id: Uuid,
        rows: &ColumnarBuffer,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Appends batches to a `ReplacingMergeTree` keyed by `(epoch, entity)`, so
/// repeated appends collapse on merge.
pub struct ClickHouseArchive {
    pool: Pool,
    database: String,
    health: Arc<HealthMetrics>,
}

impl ClickHouseArchive {
    pub fn new(pool: Pool, database: String, health: Arc<HealthMetrics>) -> Self {
        Self {
            pool,
            database,
            health,
        }
    }
}

impl Archive for ClickHouseArchive {
    async fn write_batch(&self, batch_id: Uuid, rows: &ColumnarBuffer) -> Result<()> {
        let statements = build_inserts(&self.database, batch_id, rows);
        if statements.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for archive insert")?;

        for sql in &statements {
            handle
                .execute(sql.as_str())
                .await
                .with_context(|| format!("appending batch {batch_id} to {ARCHIVE_TABLE}"))?;
        }

        self.health
            .archive_write_duration
            .observe(start.elapsed().as_secs_f64());
        self.health.archive_rows.inc_by(rows.len() as f64);

        tracing::debug!(
            batch_id = %batch_id,
            rows = rows.len(),
            statements = statements.len(),
            "archived batch"
        );

        Ok(())
    }
}

/// Renders `rows` as literal `INSERT` statements.
fn build_inserts(database: &str, batch_id: Uuid, rows: &ColumnarBuffer) -> Vec<String> {
    let table = format!("{database}.{ARCHIVE_TABLE}");
    let columns = format!("epoch, entity, transfer_batch_id, {}", field_columns());

    let mut statements = Vec::new();
    let mut offset = 0;
    while offset < rows.len() {
        let end = (offset + ROWS_PER_STATEMENT).min(rows.len());
        let mut sql = String::with_capacity(64 + columns.len() + (end - offset) * 160);
        let _ = write!(sql, "INSERT INTO {table} ({columns}) VALUES ");

        for i in offset..end {
            if i > offset {
                sql.push_str(", ");
            }
            let _ = write!(sql, "({}, {}, '{batch_id}'", rows.epochs[i], rows.entities[i]);
            for field in Field::ALL {
                let _ = write!(sql, ", {}", rows.column(field)[i]);
            }
            sql.push(')');
        }

        statements.push(sql);
        offset = end;
    }
    statements
}
