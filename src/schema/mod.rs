pub mod query;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::{Index, IndexMut};

use anyhow::{bail, Result};
use serde::Deserialize;

/// How a field combines when rows covering adjacent ranges are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Summed over the covered range.
    Additive,
    /// Boolean OR, stored as 0/1.
    Flag,
    /// Value at the first epoch of the range.
    SnapshotStart,
    /// Value at the last epoch of the range.
    SnapshotEnd,
    /// Maximum over the range.
    Max,
}

/// A per-validator metric column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    AttestationsScheduled,
    AttestationsExecuted,
    AttestationReward,
    AttestationIdealReward,
    BlocksScheduled,
    BlocksProposed,
    BlockReward,
    SyncScheduled,
    SyncExecuted,
    SyncReward,
    DepositsAmount,
    WithdrawalsAmount,
    Slashed,
    BalanceStart,
    BalanceEnd,
    LastAttestationEpoch,
}

impl Field {
    pub const COUNT: usize = 16;

    /// Every field in column order.
    pub const ALL: [Field; Self::COUNT] = [
        Field::AttestationsScheduled,
        Field::AttestationsExecuted,
        Field::AttestationReward,
        Field::AttestationIdealReward,
        Field::BlocksScheduled,
        Field::BlocksProposed,
        Field::BlockReward,
        Field::SyncScheduled,
        Field::SyncExecuted,
        Field::SyncReward,
        Field::DepositsAmount,
        Field::WithdrawalsAmount,
        Field::Slashed,
        Field::BalanceStart,
        Field::BalanceEnd,
        Field::LastAttestationEpoch,
    ];

    /// Column name in every table that stores the field.
    pub const fn name(self) -> &'static str {
        match self {
            Field::AttestationsScheduled => "attestations_scheduled",
            Field::AttestationsExecuted => "attestations_executed",
            Field::AttestationReward => "attestation_reward",
            Field::AttestationIdealReward => "attestation_ideal_reward",
            Field::BlocksScheduled => "blocks_scheduled",
            Field::BlocksProposed => "blocks_proposed",
            Field::BlockReward => "block_reward",
            Field::SyncScheduled => "sync_scheduled",
            Field::SyncExecuted => "sync_executed",
            Field::SyncReward => "sync_reward",
            Field::DepositsAmount => "deposits_amount",
            Field::WithdrawalsAmount => "withdrawals_amount",
            Field::Slashed => "slashed",
            Field::BalanceStart => "balance_start",
            Field::BalanceEnd => "balance_end",
            Field::LastAttestationEpoch => "last_attestation_epoch",
        }
    }

    pub const fn kind(self) -> FieldKind {
        match self {
            Field::Slashed => FieldKind::Flag,
            Field::BalanceStart => FieldKind::SnapshotStart,
            Field::BalanceEnd => FieldKind::SnapshotEnd,
            Field::LastAttestationEpoch => FieldKind::Max,
            _ => FieldKind::Additive,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    /// Looks a field up by column name.
    pub fn from_name(name: &str) -> Option<Field> {
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }

    /// Fields of the given kind, in column order.
    pub fn of_kind(kind: FieldKind) -> impl Iterator<Item = Field> {
        Self::ALL.into_iter().filter(move |f| f.kind() == kind)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Values for every field of one row, indexed by [`Field`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Values([i64; Field::COUNT]);

impl Values {
    pub fn iter(&self) -> impl Iterator<Item = (Field, i64)> + '_ {
        Field::ALL.iter().map(move |&f| (f, self.0[f.index()]))
    }
}

impl Index<Field> for Values {
    type Output = i64;

    fn index(&self, field: Field) -> &i64 {
        &self.0[field.index()]
    }
}

impl IndexMut<Field> for Values {
    fn index_mut(&mut self, field: Field) -> &mut i64 {
        &mut self.0[field.index()]
    }
}

/// Half-open range of epochs `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EpochRange {
    pub start: u64,
    pub end: u64,
}

impl EpochRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Range covering `low..=high`.
    pub const fn inclusive(low: u64, high: u64) -> Self {
        Self {
            start: low,
            end: high + 1,
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, epoch: u64) -> bool {
        epoch >= self.start && epoch < self.end
    }

    pub fn overlaps(&self, other: &EpochRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Last epoch inside the range.
    pub fn last(&self) -> Option<u64> {
        (!self.is_empty()).then(|| self.end - 1)
    }

    pub fn epochs(&self) -> std::ops::Range<u64> {
        self.start..self.end
    }
}

impl fmt::Display for EpochRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// One validator's metrics for one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricRow {
    pub epoch: u64,
    pub entity: u64,
    pub values: Values,
}

impl MetricRow {
    pub fn new(epoch: u64, entity: u64) -> Self {
        Self {
            epoch,
            entity,
            values: Values::default(),
        }
    }

    /// Sets a field, returning the row for chaining.
    pub fn with(mut self, field: Field, value: i64) -> Self {
        self.values[field] = value;
        self
    }

    /// Builds a row from a column-name keyed map. Unknown columns are
    /// rejected; absent columns stay zero.
    pub fn from_named(epoch: u64, entity: u64, named: &HashMap<String, i64>) -> Result<Self> {
        let mut row = Self::new(epoch, entity);
        for (name, &value) in named {
            let Some(field) = Field::from_name(name) else {
                bail!("unknown metric column {name:?} for epoch {epoch} entity {entity}");
            };
            row.values[field] = value;
        }
        Ok(row)
    }
}

/// Wire shape of a row as served by the metrics source.
#[derive(Debug, Clone, Deserialize)]
pub struct NamedRow {
    pub epoch: u64,
    pub entity: u64,
    #[serde(default)]
    pub fields: HashMap<String, i64>,
}

impl TryFrom<NamedRow> for MetricRow {
    type Error = anyhow::Error;

    fn try_from(raw: NamedRow) -> Result<Self> {
        MetricRow::from_named(raw.epoch, raw.entity, &raw.fields)
    }
}

/// Column-oriented batch of epoch rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnarBuffer {
    pub epochs: Vec<u64>,
    pub entities: Vec<u64>,
    pub columns: [Vec<i64>; Field::COUNT],
}

impl ColumnarBuffer {
    pub fn with_capacity(rows: usize) -> Self {
        Self {
            epochs: Vec::with_capacity(rows),
            entities: Vec::with_capacity(rows),
            columns: std::array::from_fn(|_| Vec::with_capacity(rows)),
        }
    }

    pub fn push(&mut self, row: &MetricRow) {
        self.epochs.push(row.epoch);
        self.entities.push(row.entity);
        for (field, value) in row.values.iter() {
            self.columns[field.index()].push(value);
        }
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn column(&self, field: Field) -> &[i64] {
        &self.columns[field.index()]
    }

    /// Reassembles the row at position `i`.
    pub fn row(&self, i: usize) -> MetricRow {
        let mut row = MetricRow::new(self.epochs[i], self.entities[i]);
        for field in Field::ALL {
            row.values[field] = self.columns[field.index()][i];
        }
        row
    }

    pub fn rows(&self) -> impl Iterator<Item = MetricRow> + '_ {
        (0..self.len()).map(|i| self.row(i))
    }

    /// Distinct epochs present in the buffer.
    pub fn epoch_set(&self) -> BTreeSet<u64> {
        self.epochs.iter().copied().collect()
    }
}

impl FromIterator<MetricRow> for ColumnarBuffer {
    fn from_iter<I: IntoIterator<Item = MetricRow>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let mut buf = Self::with_capacity(iter.size_hint().0);
        for row in iter {
            buf.push(&row);
        }
        buf
    }
}

/// One validator's metrics folded over a range of epochs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateRow {
    pub entity: u64,
    pub range: EpochRange,
    pub values: Values,
}

impl AggregateRow {
    /// Folds an aggregate covering a later range into this one.
    pub fn merge_later(&mut self, later: &AggregateRow) {
        for field in Field::ALL {
            let (ours, theirs) = (self.values[field], later.values[field]);
            self.values[field] = match field.kind() {
                FieldKind::Additive => ours.saturating_add(theirs),
                FieldKind::Flag => i64::from(ours != 0 || theirs != 0),
                FieldKind::SnapshotStart => ours,
                FieldKind::SnapshotEnd => theirs,
                FieldKind::Max => ours.max(theirs),
            };
        }
        self.range.start = self.range.start.min(later.range.start);
        self.range.end = self.range.end.max(later.range.end);
    }
}

impl From<&MetricRow> for AggregateRow {
    fn from(row: &MetricRow) -> Self {
        Self {
            entity: row.entity,
            range: EpochRange::new(row.epoch, row.epoch + 1),
            values: row.values,
        }
    }
}
