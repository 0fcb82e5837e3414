use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

use super::{run_down, run_up, split_statements, Backend, Migrator, SQLITE_MIGRATIONS};

/// SQLite migration runner for the hot store.
pub struct SqliteMigrator {
    pool: SqlitePool,
}

impl SqliteMigrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl Backend for SqliteMigrator {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER NOT NULL,
                dirty INTEGER NOT NULL,
                sequence INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating schema_migrations table")?;

        Ok(())
    }

    async fn current_version(&self) -> Result<(u32, bool)> {
        let row = sqlx::query(
            "SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("querying migration version")?;

        match row {
            Some(row) => {
                let version: i64 = row.try_get("version").context("reading version")?;
                let dirty: i64 = row.try_get("dirty").context("reading dirty flag")?;
                Ok((version as u32, dirty != 0))
            }
            None => Ok((0, false)),
        }
    }

    async fn set_version(&self, version: u32, dirty: bool) -> Result<()> {
        let mut tx = self.pool.begin().await.context("beginning version update")?;

        sqlx::query("DELETE FROM schema_migrations")
            .execute(&mut *tx)
            .await
            .context("clearing schema_migrations")?;

        sqlx::query("INSERT INTO schema_migrations (version, dirty, sequence) VALUES (?, ?, 1)")
            .bind(i64::from(version))
            .bind(i64::from(dirty))
            .execute(&mut *tx)
            .await
            .context("inserting migration version")?;

        tx.commit().await.context("committing version update")?;

        Ok(())
    }

    async fn clear_version(&self) -> Result<()> {
        sqlx::query("DELETE FROM schema_migrations")
            .execute(&self.pool)
            .await
            .context("clearing schema_migrations after rollback")?;
        Ok(())
    }

    async fn execute_sql(&self, sql: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.context("beginning migration")?;

        for statement in split_statements(sql) {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .with_context(|| {
                    let preview: String = statement.chars().take(80).collect();
                    format!("executing migration statement: {preview}...")
                })?;
        }

        tx.commit().await.context("committing migration")?;

        Ok(())
    }
}

impl Migrator for SqliteMigrator {
    async fn up(&self) -> Result<()> {
        run_up(self, SQLITE_MIGRATIONS).await
    }

    async fn down(&self) -> Result<()> {
        run_down(self, SQLITE_MIGRATIONS).await
    }

    async fn status(&self) -> Result<(u32, bool)> {
        self.ensure_migrations_table().await?;
        self.current_version().await
    }
}
