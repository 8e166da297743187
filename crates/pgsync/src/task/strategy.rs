//! Transfer strategy selection and batch planning.

use crate::config::SyncOptions;
use crate::error::{Result, SyncError};

/// How a table's rows are moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Primary key windows, resuming after the destination's highest key.
    Batched,
    /// Stage rows, then insert-if-absent or upsert.
    Reconcile { preserve: bool },
    /// Empty the destination table and copy everything.
    FullReplace,
}

impl Strategy {
    /// Pick the strategy. `filtered` is true when a SQL filter applies.
    pub fn select(opts: &SyncOptions, filtered: bool) -> Self {
        if opts.in_batches {
            Strategy::Batched
        } else if !(opts.truncate || opts.delete) && (opts.overwrite || opts.preserve || filtered) {
            Strategy::Reconcile {
                preserve: opts.preserve,
            }
        } else {
            Strategy::FullReplace
        }
    }

    pub fn needs_primary_key(&self) -> bool {
        !matches!(self, Strategy::FullReplace)
    }
}

/// Primary key shapes batching understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Integer,
    Uuid,
}

impl KeyKind {
    /// Classify an `information_schema` data type.
    pub fn from_data_type(table: &str, data_type: &str) -> Result<Self> {
        match data_type {
            "smallint" | "integer" | "bigint" => Ok(KeyKind::Integer),
            "uuid" => Ok(KeyKind::Uuid),
            other => Err(SyncError::Precondition(format!(
                "Unsupported primary key type for {}: {} (batching needs an integer or uuid key)",
                table, other
            ))),
        }
    }
}

/// Where an integer batched copy starts: after the destination's highest key,
/// or at the source's lowest key when the destination is empty.
pub fn resume_point(source_min: Option<i64>, destination_max: Option<i64>) -> Option<i64> {
    match destination_max {
        Some(max) => max.checked_add(1),
        None => source_min,
    }
}

/// Inclusive `[first, last]` key windows covering `start..=max`.
#[derive(Debug, Clone)]
pub struct IntegerWindows {
    next: Option<i64>,
    max: i64,
    size: i64,
}

impl IntegerWindows {
    pub fn new(start: i64, max: i64, size: u64) -> Self {
        Self {
            next: Some(start),
            max,
            size: i64::try_from(size).unwrap_or(i64::MAX).max(1),
        }
    }

    /// Number of windows, `ceil((max - start + 1) / size)`.
    pub fn window_count(&self) -> u64 {
        match self.next {
            Some(start) if start <= self.max => {
                let span = (self.max as i128) - (start as i128) + 1;
                let size = self.size as i128;
                ((span + size - 1) / size) as u64
            }
            _ => 0,
        }
    }
}

impl Iterator for IntegerWindows {
    type Item = (i64, i64);

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.next.filter(|start| *start <= self.max)?;
        let last = first.saturating_add(self.size - 1).min(self.max);
        self.next = last.checked_add(1);
        Some((first, last))
    }
}

/// Partition count for UUID batching: `ceil(rows / batch_size)`.
pub fn uuid_partitions(rows: i64, batch_size: u64) -> u64 {
    if rows <= 0 {
        return 0;
    }
    let rows = rows as u64;
    let size = batch_size.max(1);
    (rows + size - 1) / size
}
