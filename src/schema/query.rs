//! SQL generation for every aggregation level.
//!
//! All statements are derived from the field table in [`super::Field`], so
//! adding a field only means adding it there. Epoch bounds are rendered as
//! integer literals; table names are generated internally or validated
//! identifiers.

use std::fmt::Write;

use super::{EpochRange, Field, FieldKind};

/// Comma separated list of every field column.
pub fn field_columns() -> String {
    Field::ALL.map(Field::name).join(", ")
}

/// Columns shared by every stored aggregate table.
fn column_defs() -> String {
    let mut sql = String::from(
        "entity INTEGER NOT NULL, epoch_start INTEGER NOT NULL, epoch_end INTEGER NOT NULL",
    );
    for field in Field::ALL {
        let _ = write!(sql, ", {} INTEGER NOT NULL DEFAULT 0", field.name());
    }
    sql
}

/// DDL for a partition table holding one row per entity and range.
pub fn create_range_table(name: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {name} ({}, PRIMARY KEY (entity, epoch_start))",
        column_defs()
    )
}

/// DDL for a rolling window table holding one row per entity.
pub fn create_rolling_table(name: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {name} ({}, PRIMARY KEY (entity))",
        column_defs()
    )
}

/// Rows of `tables` whose `epoch_start` falls inside `range`.
///
/// Returns `None` when there is nothing to read from.
pub fn source_union(tables: &[String], range: EpochRange) -> Option<String> {
    if tables.is_empty() || range.is_empty() {
        return None;
    }

    let cols = field_columns();
    let selects: Vec<String> = tables
        .iter()
        .map(|t| {
            format!(
                "SELECT entity, epoch_start, epoch_end, {cols} FROM {t} \
                 WHERE epoch_start >= {} AND epoch_start < {}",
                range.start, range.end
            )
        })
        .collect();

    Some(selects.join(" UNION ALL "))
}

/// Aggregation of a source relation per entity, following each field's
/// merge kind.
#[derive(Debug, Clone)]
pub struct AggregateSql {
    source: String,
}

impl AggregateSql {
    /// Aggregates the rows produced by `source` (typically a
    /// [`source_union`]).
    pub fn over(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    fn with_clause(&self, only_additive: bool) -> String {
        let mut sql = format!(
            "WITH src AS ({}), agg AS (SELECT entity, MIN(epoch_start) AS first_epoch, \
             MAX(epoch_start) AS last_epoch, MAX(epoch_end) AS last_end",
            self.source
        );
        for field in Field::ALL {
            let name = field.name();
            match field.kind() {
                FieldKind::Additive => {
                    let _ = write!(sql, ", SUM({name}) AS {name}");
                }
                FieldKind::Flag | FieldKind::Max if !only_additive => {
                    let _ = write!(sql, ", MAX({name}) AS {name}");
                }
                _ => {}
            }
        }
        sql.push_str(" FROM src GROUP BY entity) ");
        sql
    }

    /// Field expressions for the projection, in column order.
    fn field_exprs() -> Vec<String> {
        Field::ALL
            .iter()
            .map(|f| match f.kind() {
                FieldKind::SnapshotStart => format!("first_row.{}", f.name()),
                FieldKind::SnapshotEnd => format!("last_row.{}", f.name()),
                _ => format!("agg.{}", f.name()),
            })
            .collect()
    }

    fn joins() -> String {
        let mut sql = String::from(" FROM agg");
        if Field::of_kind(FieldKind::SnapshotStart).next().is_some() {
            sql.push_str(
                " JOIN src AS first_row ON first_row.entity = agg.entity \
                 AND first_row.epoch_start = agg.first_epoch",
            );
        }
        if Field::of_kind(FieldKind::SnapshotEnd).next().is_some() {
            sql.push_str(
                " JOIN src AS last_row ON last_row.entity = agg.entity \
                 AND last_row.epoch_start = agg.last_epoch",
            );
        }
        sql
    }

    /// Reads one aggregate per entity as `entity, first_epoch, last_end,
    /// fields...`.
    pub fn select(&self) -> String {
        format!(
            "{}SELECT agg.entity AS entity, agg.first_epoch AS first_epoch, \
             agg.last_end AS last_end, {}{} ORDER BY agg.entity",
            self.with_clause(false),
            aliased(Self::field_exprs()),
            Self::joins()
        )
    }

    fn insert_select(&self, table: &str, range: EpochRange) -> String {
        format!(
            "{}INSERT INTO {table} (entity, epoch_start, epoch_end, {}) \
             SELECT agg.entity, {}, {}, {}{} WHERE true",
            self.with_clause(false),
            field_columns(),
            range.start,
            range.end,
            Self::field_exprs().join(", "),
            Self::joins()
        )
    }

    /// Writes the aggregate as the row for `range`, replacing any previous
    /// row of the same entity and range start.
    pub fn upsert_into(&self, table: &str, range: EpochRange) -> String {
        let mut sql = self.insert_select(table, range);
        sql.push_str(
            " ON CONFLICT(entity, epoch_start) DO UPDATE SET epoch_end = excluded.epoch_end",
        );
        for field in Field::ALL {
            let _ = write!(sql, ", {0} = excluded.{0}", field.name());
        }
        sql
    }

    /// Folds the aggregate into a rolling table as the newest part of the
    /// window. Entities new to the window get `range` as their bounds.
    pub fn merge_into(&self, table: &str, range: EpochRange) -> String {
        let mut sql = self.insert_select(table, range);
        sql.push_str(" ON CONFLICT(entity) DO UPDATE SET epoch_end = excluded.epoch_end");
        for field in Field::ALL {
            let name = field.name();
            match field.kind() {
                FieldKind::Additive => {
                    let _ = write!(sql, ", {name} = {table}.{name} + excluded.{name}");
                }
                FieldKind::Flag | FieldKind::Max => {
                    let _ = write!(sql, ", {name} = MAX({table}.{name}, excluded.{name})");
                }
                FieldKind::SnapshotEnd => {
                    let _ = write!(sql, ", {name} = excluded.{name}");
                }
                FieldKind::SnapshotStart => {}
            }
        }
        sql
    }

    /// Subtracts additive fields of the aggregate from a rolling table.
    pub fn subtract_from(&self, table: &str) -> String {
        let sets: Vec<String> = Field::of_kind(FieldKind::Additive)
            .map(|f| format!("{0} = {table}.{0} - agg.{0}", f.name()))
            .collect();
        format!(
            "{}UPDATE {table} SET {} FROM agg WHERE {table}.entity = agg.entity",
            self.with_clause(true),
            sets.join(", ")
        )
    }
}

fn aliased(exprs: Vec<String>) -> String {
    exprs
        .into_iter()
        .zip(Field::ALL)
        .map(|(expr, f)| format!("{expr} AS {}", f.name()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Replaces snapshot-start fields of a rolling table with the values stored
/// for `epoch` in `source_table`.
pub fn overwrite_start_snapshots(table: &str, source_table: &str, epoch: u64) -> Option<String> {
    let fields: Vec<&str> = Field::of_kind(FieldKind::SnapshotStart)
        .map(Field::name)
        .collect();
    if fields.is_empty() {
        return None;
    }

    let sets: Vec<String> = fields.iter().map(|f| format!("{f} = nt.{f}")).collect();
    Some(format!(
        "UPDATE {table} SET {} FROM (SELECT entity, {} FROM {source_table} \
         WHERE epoch_start = {epoch}) AS nt WHERE {table}.entity = nt.entity",
        sets.join(", "),
        fields.join(", ")
    ))
}

/// Deletes rows of a rolling table for entities that appear in `removed`
/// (a [`source_union`] of the epochs just subtracted) but have no row left
/// in `kept` across `kept_tables`.
pub fn delete_departed(
    table: &str,
    removed: &str,
    kept_tables: &[String],
    kept: EpochRange,
) -> String {
    let mut sql = format!("DELETE FROM {table} WHERE entity IN (SELECT entity FROM ({removed}))");
    for t in kept_tables {
        let _ = write!(
            sql,
            " AND NOT EXISTS (SELECT 1 FROM {t} WHERE {t}.entity = {table}.entity \
             AND {t}.epoch_start >= {} AND {t}.epoch_start < {})",
            kept.start, kept.end
        );
    }
    sql
}

/// Whether `name` is safe to splice into SQL as a table name.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_source_union_empty() {
        assert!(source_union(&[], EpochRange::new(0, 10)).is_none());
        assert!(source_union(&tables(&["epoch_0_8"]), EpochRange::new(4, 4)).is_none());
    }

    #[test]
    fn test_source_union_bounds_each_table() {
        let sql = source_union(&tables(&["epoch_0_8", "epoch_8_16"]), EpochRange::new(6, 10))
            .expect("non-empty");
        assert_eq!(sql.matches("UNION ALL").count(), 1);
        assert_eq!(sql.matches("epoch_start >= 6 AND epoch_start < 10").count(), 2);
        assert!(sql.contains("FROM epoch_8_16"));
    }

    #[test]
    fn test_aggregate_uses_field_kinds() {
        let sql = AggregateSql::over("SELECT * FROM t").select();
        assert!(sql.contains("SUM(attestation_reward) AS attestation_reward"));
        assert!(sql.contains("MAX(slashed) AS slashed"));
        assert!(sql.contains("MAX(last_attestation_epoch) AS last_attestation_epoch"));
        assert!(sql.contains("first_row.balance_start AS balance_start"));
        assert!(sql.contains("last_row.balance_end AS balance_end"));
        assert!(!sql.contains("SUM(balance_end)"));
    }

    #[test]
    fn test_merge_keeps_start_snapshot() {
        let sql = AggregateSql::over("SELECT * FROM t").merge_into("rolling_24h", EpochRange::new(6, 11));
        assert!(sql.contains("ON CONFLICT(entity) DO UPDATE"));
        assert!(sql.contains("block_reward = rolling_24h.block_reward + excluded.block_reward"));
        assert!(sql.contains("slashed = MAX(rolling_24h.slashed, excluded.slashed)"));
        assert!(sql.contains("balance_end = excluded.balance_end"));
        assert!(!sql.contains("balance_start = "));
        assert!(sql.contains("SELECT agg.entity, 6, 11,"));
    }

    #[test]
    fn test_subtract_touches_only_additive_fields() {
        let sql = AggregateSql::over("SELECT * FROM t").subtract_from("rolling_7d");
        assert!(sql.contains("sync_reward = rolling_7d.sync_reward - agg.sync_reward"));
        assert!(!sql.contains("slashed ="));
        assert!(!sql.contains("balance_end ="));
        assert!(!sql.contains("MAX(slashed)"));
    }

    #[test]
    fn test_overwrite_start_snapshots() {
        let sql = overwrite_start_snapshots("rolling_24h", "epoch_0_8", 7).expect("has snapshot");
        assert!(sql.contains("balance_start = nt.balance_start"));
        assert!(sql.contains("WHERE epoch_start = 7"));
    }

    #[test]
    fn test_delete_departed_checks_every_kept_partition() {
        let tables = vec!["epoch_0_8".to_owned(), "epoch_8_16".to_owned()];
        let sql = delete_departed("rolling_4e", "SELECT * FROM epoch_0_8", &tables, EpochRange::new(6, 10));
        assert!(sql.starts_with("DELETE FROM rolling_4e WHERE entity IN (SELECT entity FROM (SELECT * FROM epoch_0_8))"));
        assert_eq!(sql.matches("NOT EXISTS").count(), 2);
        assert!(sql.contains("epoch_8_16.entity = rolling_4e.entity"));
        assert!(sql.contains("epoch_8_16.epoch_start >= 6 AND epoch_8_16.epoch_start < 10"));
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("rolling_24h"));
        assert!(is_identifier("hourly_0_900"));
        assert!(!is_identifier("24h"));
        assert!(!is_identifier("rolling-24h"));
        assert!(!is_identifier("x; DROP TABLE y"));
        assert!(!is_identifier(""));
    }
}
