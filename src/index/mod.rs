//! Index Module
//!
//! One optional range index per column of a table.
//!
//! ## Responsibilities
//! - Exact and range lookup from column value to base record locations
//! - Incremental maintenance on insert and on updates of indexed columns
//! - Snapshot to / restore from the table catalog
//!
//! Entries of deleted records are not removed; readers filter them with the
//! tombstone check.

mod column;

pub use column::ColumnIndex;

use crate::page::Value;
use crate::storage::{IndexSnapshot, Location};

/// Range indexes of one table, by column
#[derive(Debug, Clone)]
pub struct Index {
    columns: Vec<Option<ColumnIndex>>,
}

impl Index {
    /// No column indexed
    pub fn new(num_columns: usize) -> Self {
        Self {
            columns: vec![None; num_columns],
        }
    }

    pub fn from_snapshots(num_columns: usize, snapshots: &[IndexSnapshot]) -> Self {
        let mut index = Self::new(num_columns);
        for snapshot in snapshots {
            if let Some(slot) = index.columns.get_mut(snapshot.column) {
                *slot = Some(ColumnIndex::from_snapshot(snapshot));
            }
        }
        index
    }

    pub fn snapshots(&self) -> Vec<IndexSnapshot> {
        self.columns
            .iter()
            .enumerate()
            .filter_map(|(column, index)| index.as_ref().map(|i| i.snapshot(column)))
            .collect()
    }

    pub fn has_index(&self, column: usize) -> bool {
        matches!(self.columns.get(column), Some(Some(_)))
    }

    /// Columns that currently have an index
    pub fn indexed_columns(&self) -> Vec<usize> {
        (0..self.columns.len()).filter(|&c| self.has_index(c)).collect()
    }

    pub fn column(&self, column: usize) -> Option<&ColumnIndex> {
        self.columns.get(column).and_then(Option::as_ref)
    }

    /// Install a prebuilt index for `column`
    pub fn install(&mut self, column: usize, index: ColumnIndex) {
        if let Some(slot) = self.columns.get_mut(column) {
            *slot = Some(index);
        }
    }

    /// Remove the index of `column`; returns whether one existed
    pub fn drop_index(&mut self, column: usize) -> bool {
        self.columns
            .get_mut(column)
            .and_then(Option::take)
            .is_some()
    }

    /// Index every indexed column of a freshly inserted row
    pub fn insert_row(&mut self, values: &[Value], location: Location) {
        for (column, index) in self.columns.iter_mut().enumerate() {
            if let (Some(index), Some(value)) = (index.as_mut(), values.get(column)) {
                index.insert(value.clone(), location);
            }
        }
    }

    /// Move `location` from `old` to `new` in `column`'s index, if any
    pub fn update_value(&mut self, column: usize, old: &Value, new: &Value, location: Location) {
        if let Some(Some(index)) = self.columns.get_mut(column) {
            index.remove(old, location);
            index.insert(new.clone(), location);
        }
    }

    pub fn locate(&self, column: usize, value: &Value) -> Option<Vec<Location>> {
        self.column(column).map(|i| i.locate(value))
    }

    pub fn locate_range(&self, column: usize, begin: &Value, end: &Value) -> Option<Vec<Location>> {
        self.column(column).map(|i| i.locate_range(begin, end))
    }
}
