mod sqlite;

pub use sqlite::SqliteMigrator;

use anyhow::{bail, Context, Result};
use clickhouse_rs::Pool;

/// Embedded SQL migration with version, direction, and content.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// Hot store migrations, ordered by version.
static SQLITE_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up_sql: include_str!("sql/sqlite/001_init.up.sql"),
        down_sql: include_str!("sql/sqlite/001_init.down.sql"),
    },
    Migration {
        version: 2,
        up_sql: include_str!("sql/sqlite/002_bucket_metadata.up.sql"),
        down_sql: include_str!("sql/sqlite/002_bucket_metadata.down.sql"),
    },
];

/// Archive migrations, ordered by version.
static CLICKHOUSE_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/clickhouse/001_init.up.sql"),
    down_sql: include_str!("sql/clickhouse/001_init.down.sql"),
}];

/// Manages schema migrations.
///
/// Compatible with golang-migrate's `schema_migrations` table format.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current migration version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<(u32, bool)>> + Send;
}

/// Storage-specific primitives the shared migration driver runs on.
trait Backend: Sync {
    fn name(&self) -> &'static str;

    fn ensure_migrations_table(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    fn current_version(&self) -> impl std::future::Future<Output = Result<(u32, bool)>> + Send;

    fn set_version(
        &self,
        version: u32,
        dirty: bool,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn clear_version(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    fn execute_sql(&self, sql: &str) -> impl std::future::Future<Output = Result<()>> + Send;
}

async fn run_up<B: Backend>(backend: &B, migrations: &[Migration]) -> Result<()> {
    backend.ensure_migrations_table().await?;

    let (current_version, dirty) = backend.current_version().await?;

    if dirty {
        bail!(
            "{} migration version {current_version} is dirty, manual intervention required",
            backend.name()
        );
    }

    tracing::info!(store = backend.name(), current_version, "running migrations");

    let mut applied = 0u32;

    for migration in migrations {
        if migration.version <= current_version {
            continue;
        }

        tracing::info!(store = backend.name(), version = migration.version, "applying migration");

        backend.set_version(migration.version, true).await?;

        backend
            .execute_sql(migration.up_sql)
            .await
            .with_context(|| format!("applying migration version {}", migration.version))?;

        backend.set_version(migration.version, false).await?;

        applied += 1;
    }

    if applied == 0 {
        tracing::debug!(store = backend.name(), "no pending migrations");
    } else {
        let (final_version, _) = backend.current_version().await?;
        tracing::info!(
            store = backend.name(),
            version = final_version,
            applied,
            "migrations completed"
        );
    }

    Ok(())
}

async fn run_down<B: Backend>(backend: &B, migrations: &[Migration]) -> Result<()> {
    backend.ensure_migrations_table().await?;

    let (current_version, _) = backend.current_version().await?;

    if current_version == 0 {
        tracing::info!(store = backend.name(), "no migrations to roll back");
        return Ok(());
    }

    let migration = migrations
        .iter()
        .find(|m| m.version == current_version)
        .with_context(|| format!("migration version {current_version} not found"))?;

    tracing::info!(store = backend.name(), version = current_version, "rolling back migration");

    backend.set_version(current_version, true).await?;

    backend
        .execute_sql(migration.down_sql)
        .await
        .with_context(|| format!("rolling back migration version {current_version}"))?;

    let prev_version = previous_version(migrations, current_version);

    if prev_version == 0 {
        backend.clear_version().await?;
    } else {
        backend.set_version(prev_version, false).await?;
    }

    tracing::info!(store = backend.name(), version = prev_version, "rollback completed");

    Ok(())
}

/// Highest migration version below `current`, or 0.
fn previous_version(migrations: &[Migration], current: u32) -> u32 {
    migrations
        .iter()
        .filter(|m| m.version < current)
        .map(|m| m.version)
        .max()
        .unwrap_or(0)
}

/// ClickHouse migration runner for the archive.
pub struct ClickHouseMigrator {
    pool: Pool,
}

impl ClickHouseMigrator {
    /// Creates a new migrator using the given connection pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl Backend for ClickHouseMigrator {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for migrations table")?;

        handle
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version Int64,
                    dirty UInt8,
                    sequence UInt64
                ) ENGINE = TinyLog",
            )
            .await
            .context("creating schema_migrations table")?;

        Ok(())
    }

    async fn current_version(&self) -> Result<(u32, bool)> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version check")?;

        let block = handle
            .query("SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1")
            .fetch_all()
            .await
            .context("querying migration version")?;

        match block.rows().next() {
            Some(row) => {
                let version: i64 = row.get("version").context("reading version")?;
                let dirty: u8 = row.get("dirty").context("reading dirty flag")?;
                Ok((version as u32, dirty != 0))
            }
            None => Ok((0, false)),
        }
    }

    async fn set_version(&self, version: u32, dirty: bool) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for version update")?;

        // Truncate and re-insert (matches golang-migrate behavior).
        handle
            .execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations")?;

        let dirty_val = u8::from(dirty);
        let sql = format!(
            "INSERT INTO schema_migrations (version, dirty, sequence) VALUES ({version}, {dirty_val}, 1)"
        );

        handle
            .execute(sql.as_str())
            .await
            .context("inserting migration version")?;

        Ok(())
    }

    async fn clear_version(&self) -> Result<()> {
        let mut handle = self.pool.get_handle().await?;
        handle
            .execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations after rollback")?;
        Ok(())
    }

    async fn execute_sql(&self, sql: &str) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting ClickHouse handle for SQL execution")?;

        for statement in split_statements(sql) {
            handle.execute(statement).await.with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("executing migration statement: {preview}...")
            })?;
        }

        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<()> {
        run_up(self, CLICKHOUSE_MIGRATIONS).await
    }

    async fn down(&self) -> Result<()> {
        run_down(self, CLICKHOUSE_MIGRATIONS).await
    }

    async fn status(&self) -> Result<(u32, bool)> {
        self.ensure_migrations_table().await?;
        self.current_version().await
    }
}

/// Splits SQL text into individual statements by semicolons.
///
/// Handles empty lines and whitespace-only segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;

    #[test]
    fn test_split_statements_basic() {
        let sql = "CREATE TABLE foo (id Int32); CREATE TABLE bar (id Int32);";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE foo"));
        assert!(stmts[1].starts_with("CREATE TABLE bar"));
    }

    #[test]
    fn test_split_statements_with_whitespace() {
        let sql = "
            SELECT 1;

            SELECT 2;

        ";
        assert_eq!(split_statements(sql).len(), 2);
    }

    #[test]
    fn test_split_statements_trailing_semicolons() {
        assert_eq!(split_statements("SELECT 1;;;").len(), 1);
        assert!(split_statements("").is_empty());
    }

    #[test]
    fn test_migrations_embedded_and_ordered() {
        for set in [SQLITE_MIGRATIONS, CLICKHOUSE_MIGRATIONS] {
            for m in set {
                assert!(m.version > 0);
                assert!(!m.up_sql.is_empty(), "migration {} up SQL is empty", m.version);
                assert!(!m.down_sql.is_empty(), "migration {} down SQL is empty", m.version);
            }
            for window in set.windows(2) {
                assert!(
                    window[0].version < window[1].version,
                    "migrations not in order: {} >= {}",
                    window[0].version,
                    window[1].version,
                );
            }
        }
    }

    #[test]
    fn test_previous_version() {
        assert_eq!(previous_version(SQLITE_MIGRATIONS, 2), 1);
        assert_eq!(previous_version(SQLITE_MIGRATIONS, 1), 0);
    }

    #[test]
    fn test_archive_table_has_every_field() {
        let ddl = CLICKHOUSE_MIGRATIONS[0].up_sql;
        for field in Field::ALL {
            assert!(
                ddl.contains(&format!("{} Int64", field.name())),
                "archive table lacks column {field}"
            );
        }
    }
}
