//! Tests for merging
//!
//! These tests verify:
//! - Merge transparency: every version reads the same before and after
//! - High-water marks track the newest folded tail
//! - Repeated merges, merges with nothing to fold
//! - Background merges triggered by the update threshold
//! - A merge that hits a corrupt page blocks the stack, not the table
//! - The 5000-row scenario

use std::fs::OpenOptions;
use std::sync::Arc;
use std::thread;

use lstore::page::{Value, ValueType, NONE_RID, PAGE_SIZE, SLOT_LIMIT};
use lstore::storage::PageStack;
use lstore::{Config, LstoreError, Schema, Table};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(temp: &TempDir, threshold: u64, background: bool) -> Config {
    Config::builder()
        .data_dir(temp.path())
        .sync_on_flush(false)
        .merge_threshold(threshold)
        .background_merge(background)
        .build()
}

fn setup_table(temp: &TempDir, threshold: u64, background: bool) -> Table {
    let schema = Schema::new(vec![ValueType::Int, ValueType::Int, ValueType::Int], 0).unwrap();
    Table::create("merged", schema, config(temp, threshold, background)).unwrap()
}

fn set(table: &Table, key: i64, value: i64) {
    assert!(table
        .update(&Value::Int(key), vec![None, Some(Value::Int(value)), None])
        .unwrap());
}

/// Column 1 of `key` at every version from newest back to `depth`
fn history(table: &Table, key: i64, depth: i64) -> Vec<Value> {
    (0..=depth)
        .map(|back| {
            let records = table
                .select(&Value::Int(key), 0, &[true, true, true], -back)
                .unwrap();
            records[0].columns[1].clone().unwrap()
        })
        .collect()
}

/// RID of the last tail record written to `page_id`
fn newest_tail_rid(table: &Table, page_id: u64) -> u64 {
    let tail = table.stack(page_id).unwrap().current_tail().unwrap();
    tail.base_rid() + tail.len() as u64 - 1
}

// =============================================================================
// Transparency Tests
// =============================================================================

#[test]
fn test_merge_transparency() {
    let temp = TempDir::new().unwrap();
    let table = setup_table(&temp, 10_000, false);
    for k in 0..40 {
        table.insert(vec![Value::Int(k), Value::Int(k), Value::Int(-k)]).unwrap();
    }
    for round in 1..=3 {
        for k in (0..40).step_by(round as usize) {
            set(&table, k, k * 100 + round);
        }
    }

    let before: Vec<Vec<Value>> = (0..40).map(|k| history(&table, k, 5)).collect();

    let report = table.merge(0).unwrap().unwrap();
    assert_eq!(report.records, 40);
    assert_eq!(report.folded, 40);
    assert_eq!(report.tps, newest_tail_rid(&table, 0));

    let after: Vec<Vec<Value>> = (0..40).map(|k| history(&table, k, 5)).collect();
    assert_eq!(before, after);

    // Untouched column keeps its inserted values
    let records = table
        .select(&Value::Int(5), 0, &[false, false, true], 0)
        .unwrap();
    assert_eq!(records[0].columns[2], Some(Value::Int(-5)));
}

#[test]
fn test_repeated_merges_keep_history() {
    let temp = TempDir::new().unwrap();
    let table = setup_table(&temp, 10_000, false);
    for k in 0..10 {
        table.insert(vec![Value::Int(k), Value::Int(0), Value::Int(0)]).unwrap();
    }

    set(&table, 3, 1);
    table.merge(0).unwrap().unwrap();

    // Inserted after the first merge, updated before the second
    table.insert(vec![Value::Int(10), Value::Int(50), Value::Int(0)]).unwrap();
    set(&table, 10, 51);
    set(&table, 3, 2);
    let second = table.merge(0).unwrap().unwrap();
    assert_eq!(second.tps, newest_tail_rid(&table, 0));

    set(&table, 3, 3);
    table.merge(0).unwrap().unwrap();

    assert_eq!(
        history(&table, 3, 4),
        vec![
            Value::Int(3),
            Value::Int(2),
            Value::Int(1),
            Value::Int(0),
            Value::Int(0)
        ]
    );
    assert_eq!(
        history(&table, 10, 2),
        vec![Value::Int(51), Value::Int(50), Value::Int(50)]
    );
    assert_eq!(table.tps(0).unwrap(), vec![newest_tail_rid(&table, 0); 3]);
}

#[test]
fn test_merge_with_nothing_to_fold() {
    let temp = TempDir::new().unwrap();
    let table = setup_table(&temp, 10_000, false);
    table.insert(vec![Value::Int(1), Value::Int(1), Value::Int(1)]).unwrap();

    assert!(table.merge(0).unwrap().is_none());
    assert_eq!(table.tps(0).unwrap(), vec![NONE_RID; 3]);
    assert!(table.merge(9).is_err());
}

#[test]
fn test_updates_after_merge_read_newest() {
    let temp = TempDir::new().unwrap();
    let table = setup_table(&temp, 10_000, false);
    table.insert(vec![Value::Int(1), Value::Int(0), Value::Int(0)]).unwrap();
    set(&table, 1, 1);
    table.merge(0).unwrap();

    set(&table, 1, 2);
    assert_eq!(history(&table, 1, 2), vec![Value::Int(2), Value::Int(1), Value::Int(0)]);

    // Deletes reach records that were merged
    assert!(table.delete(&Value::Int(1)).unwrap());
    assert!(table
        .select(&Value::Int(1), 0, &[true, true, true], 0)
        .unwrap()
        .is_empty());
}

#[test]
fn test_failed_merge_blocks_stack() {
    let temp = TempDir::new().unwrap();
    {
        let table = setup_table(&temp, 10_000, false);
        for k in 0..4 {
            table.insert(vec![Value::Int(k), Value::Int(k), Value::Int(0)]).unwrap();
        }
        set(&table, 2, 200);
        table.close().unwrap();
    }

    // Cut the tail page set's region off column 1
    let column_file = PageStack::stack_dir(&temp.path().join("merged"), 0).join("column1.bin");
    OpenOptions::new()
        .write(true)
        .open(&column_file)
        .unwrap()
        .set_len(PAGE_SIZE as u64)
        .unwrap();

    let table = Table::open("merged", config(&temp, 10_000, false)).unwrap();
    assert!(matches!(table.merge(0), Err(LstoreError::CorruptPage(_))));
    assert!(table.stack(0).unwrap().is_merge_blocked());
    assert!(table.merge(0).unwrap().is_none());
    assert_eq!(table.tps(0).unwrap(), vec![NONE_RID; 3]);

    // Records without tail versions are still readable and writable
    assert!(table
        .insert(vec![Value::Int(4), Value::Int(4), Value::Int(0)])
        .unwrap());
    for k in [0, 1, 3, 4] {
        let records = table
            .select(&Value::Int(k), 0, &[true, true, true], 0)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].columns[1], Some(Value::Int(k)));
    }
}

// =============================================================================
// Background Merge Tests
// =============================================================================

#[test]
fn test_threshold_triggers_background_merge() {
    let temp = TempDir::new().unwrap();
    let table = setup_table(&temp, 16, true);
    for k in 0..20 {
        table.insert(vec![Value::Int(k), Value::Int(k), Value::Int(0)]).unwrap();
    }
    for k in 0..16 {
        set(&table, k, k + 1000);
    }
    table.wait_for_merges();

    let tps = table.tps(0).unwrap();
    assert_ne!(tps[1], NONE_RID);
    assert_eq!(tps[1], newest_tail_rid(&table, 0));
    assert_eq!(table.stack(0).unwrap().updates_since_merge(), 0);

    for k in 0..16 {
        assert_eq!(history(&table, k, 1), vec![Value::Int(k + 1000), Value::Int(k)]);
    }
}

#[test]
fn test_merge_during_concurrent_updates() {
    let temp = TempDir::new().unwrap();
    let table = Arc::new(setup_table(&temp, 64, true));
    for k in 0..100 {
        table.insert(vec![Value::Int(k), Value::Int(0), Value::Int(0)]).unwrap();
    }

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for _ in 0..200 {
                    for k in (t..100).step_by(4) {
                        assert!(table.increment(&Value::Int(k), 1).unwrap());
                    }
                }
            })
        })
        .collect();
    let merger = {
        let table = Arc::clone(&table);
        thread::spawn(move || {
            for _ in 0..20 {
                table.merge(0).unwrap();
                thread::yield_now();
            }
        })
    };

    for writer in writers {
        writer.join().unwrap();
    }
    merger.join().unwrap();
    table.wait_for_merges();

    for k in 0..100 {
        let records = table
            .select(&Value::Int(k), 0, &[true, true, true], 0)
            .unwrap();
        assert_eq!(records[0].columns[1], Some(Value::Int(200)));
        assert_eq!(history(&table, k, 2)[2], Value::Int(198));
    }
    assert!(!table.stack(0).unwrap().is_merge_blocked());
}

// =============================================================================
// Scenario Tests
// =============================================================================

#[test]
fn test_five_thousand_rows() {
    let temp = TempDir::new().unwrap();
    let table = setup_table(&temp, 300, true);

    for k in 0..5000 {
        table.insert(vec![Value::Int(k), Value::Int(k), Value::Int(0)]).unwrap();
    }
    assert_eq!(table.directory().stack_count(), 5000usize.div_ceil(SLOT_LIMIT));

    // Keys 0..512 live in stack 0
    for k in 0..SLOT_LIMIT as i64 {
        set(&table, k, k + 10_000);
    }
    table.wait_for_merges();
    let first = table.tps(0).unwrap()[1];
    assert_ne!(first, NONE_RID);

    for k in 0..SLOT_LIMIT as i64 {
        set(&table, k, k + 20_000);
    }
    table.wait_for_merges();
    let second = table.tps(0).unwrap()[1];
    assert!(second > first);

    // Fold the last updates too
    table.merge(0).unwrap();
    assert_eq!(table.tps(0).unwrap(), vec![newest_tail_rid(&table, 0); 3]);

    for k in 0..5000 {
        let expected = if k < SLOT_LIMIT as i64 { k + 20_000 } else { k };
        let records = table
            .select(&Value::Int(k), 0, &[false, true, false], 0)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].columns[1], Some(Value::Int(expected)));
    }
    assert_eq!(history(&table, 7, 2), vec![
        Value::Int(20_007),
        Value::Int(10_007),
        Value::Int(7)
    ]);
}
