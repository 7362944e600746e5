//! Per-column range index.
//!
//! Value-ordered map from column value to the set of record locations
//! holding it. Equal values share one node.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::page::Value;
use crate::storage::{IndexSnapshot, Location};

#[derive(Debug, Clone, Default)]
pub struct ColumnIndex {
    nodes: BTreeMap<Value, BTreeSet<Location>>,
    entries: usize,
}

impl ColumnIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct values
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of (value, location) pairs
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    pub fn insert(&mut self, value: Value, location: Location) {
        if self.nodes.entry(value).or_default().insert(location) {
            self.entries += 1;
        }
    }

    /// Remove one (value, location) pair; returns whether it was present
    pub fn remove(&mut self, value: &Value, location: Location) -> bool {
        let Some(set) = self.nodes.get_mut(value) else {
            return false;
        };
        let removed = set.remove(&location);
        if set.is_empty() {
            self.nodes.remove(value);
        }
        if removed {
            self.entries -= 1;
        }
        removed
    }

    /// All locations holding exactly `value`
    pub fn locate(&self, value: &Value) -> Vec<Location> {
        self.nodes
            .get(value)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// All locations whose value lies in `[begin, end]`, ordered by value
    pub fn locate_range(&self, begin: &Value, end: &Value) -> Vec<Location> {
        if begin > end {
            return Vec::new();
        }
        self.nodes
            .range((Bound::Included(begin), Bound::Included(end)))
            .flat_map(|(_, set)| set.iter().copied())
            .collect()
    }

    /// Largest indexed value strictly smaller than `value`
    pub fn find_largest_smaller_key(&self, value: &Value) -> Option<&Value> {
        self.nodes
            .range((Bound::Unbounded, Bound::Excluded(value)))
            .next_back()
            .map(|(k, _)| k)
    }

    pub fn snapshot(&self, column: usize) -> IndexSnapshot {
        IndexSnapshot {
            column,
            entries: self
                .nodes
                .iter()
                .map(|(value, set)| (value.clone(), set.iter().copied().collect()))
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: &IndexSnapshot) -> Self {
        let mut index = Self::new();
        for (value, locations) in &snapshot.entries {
            for location in locations {
                index.insert(value.clone(), *location);
            }
        }
        index
    }
}
