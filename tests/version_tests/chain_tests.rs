//! Tests for version chains
//!
//! These tests verify:
//! - Chain integrity: base → newest tail → ... → oldest tail → NONE
//! - Relative version resolution, clamping and positive versions
//! - The chain splicer's wait-and-refresh behaviour
//! - Concurrent updates of one record produce one tail each, all chained

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lstore::page::{Value, ValueType, NONE_RID, SLOT_LIMIT};
use lstore::storage::RecordAddress;
use lstore::version::{self, ChainSplicer, VersionLocation};
use lstore::{Config, Schema, Table};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_table(temp: &TempDir) -> Table {
    let config = Config::builder()
        .data_dir(temp.path())
        .sync_on_flush(false)
        .background_merge(false)
        .build();
    let schema = Schema::new(vec![ValueType::Int, ValueType::Int], 0).unwrap();
    Table::create("chains", schema, config).unwrap()
}

fn set(table: &Table, key: i64, value: i64) {
    assert!(table
        .update(&Value::Int(key), vec![None, Some(Value::Int(value))])
        .unwrap());
}

fn value_at(table: &Table, key: i64, version: i64) -> Value {
    let records = table
        .select(&Value::Int(key), 0, &[true, true], version)
        .unwrap();
    assert_eq!(records.len(), 1);
    records[0].columns[1].clone().unwrap()
}

// =============================================================================
// Chain Integrity Tests
// =============================================================================

#[test]
fn test_chain_links_newest_first() {
    let temp = TempDir::new().unwrap();
    let table = setup_table(&temp);
    table.insert(vec![Value::Int(1), Value::Int(0)]).unwrap();
    let location = table.locate_key(&Value::Int(1)).unwrap().unwrap();
    let stack = table.stack(location.page_id).unwrap();

    assert!(version::chain(&stack, location.rid).unwrap().is_empty());

    for v in 1..=3 {
        set(&table, 1, v);
    }

    let chain = version::chain(&stack, location.rid).unwrap();
    assert_eq!(chain.len(), 3);
    assert!(chain.windows(2).all(|w| w[0] > w[1]));
    assert_eq!(
        stack.base().indirection_at(location.rid as usize).unwrap(),
        chain[0]
    );

    // The oldest tail ends the chain
    let oldest = RecordAddress::from_rid(location.page_id, chain[2]);
    let tail = table.directory().page_set(&oldest).unwrap();
    assert_eq!(tail.indirection_at(oldest.slot).unwrap(), NONE_RID);
}

#[test]
fn test_tail_records_carry_full_row() {
    let temp = TempDir::new().unwrap();
    let table = setup_table(&temp);
    table.insert(vec![Value::Int(1), Value::Int(10)]).unwrap();
    set(&table, 1, 11);

    let location = table.locate_key(&Value::Int(1)).unwrap().unwrap();
    let rid = table.resolve_version(location, 0).unwrap();
    let address = RecordAddress::from_rid(location.page_id, rid);
    let tail = table.directory().page_set(&address).unwrap();
    assert_eq!(
        tail.read_all(address.slot).unwrap(),
        vec![Value::Int(1), Value::Int(11)]
    );
}

// =============================================================================
// Resolution Tests
// =============================================================================

#[test]
fn test_relative_versions() {
    let temp = TempDir::new().unwrap();
    let table = setup_table(&temp);
    table.insert(vec![Value::Int(7), Value::Int(100)]).unwrap();
    for v in [101, 102, 103] {
        set(&table, 7, v);
    }

    assert_eq!(value_at(&table, 7, 0), Value::Int(103));
    assert_eq!(value_at(&table, 7, -1), Value::Int(102));
    assert_eq!(value_at(&table, 7, -2), Value::Int(101));
    assert_eq!(value_at(&table, 7, -3), Value::Int(100));

    // Older than history clamps to the inserted version
    assert_eq!(value_at(&table, 7, -50), Value::Int(100));
    // Positive versions read the newest
    assert_eq!(value_at(&table, 7, 4), Value::Int(103));
}

#[test]
fn test_resolve_version_rids() {
    let temp = TempDir::new().unwrap();
    let table = setup_table(&temp);
    table.insert(vec![Value::Int(1), Value::Int(0)]).unwrap();
    let location = table.locate_key(&Value::Int(1)).unwrap().unwrap();

    assert_eq!(table.resolve_version(location, 0).unwrap(), location.rid);

    set(&table, 1, 1);
    set(&table, 1, 2);
    let first_tail = SLOT_LIMIT as u64;
    assert_eq!(table.resolve_version(location, 0).unwrap(), first_tail + 1);
    assert_eq!(table.resolve_version(location, -1).unwrap(), first_tail);
    assert_eq!(table.resolve_version(location, -2).unwrap(), location.rid);
    assert_eq!(table.resolve_version(location, -9).unwrap(), location.rid);
}

#[test]
fn test_locate_version_kinds() {
    let temp = TempDir::new().unwrap();
    let table = setup_table(&temp);
    table.insert(vec![Value::Int(1), Value::Int(0)]).unwrap();
    set(&table, 1, 1);

    let location = table.locate_key(&Value::Int(1)).unwrap().unwrap();
    let stack = table.stack(location.page_id).unwrap();
    let wanted = [true, true];

    assert_eq!(
        version::locate_version(&stack, location.rid, 0, &wanted).unwrap(),
        VersionLocation::Tail(SLOT_LIMIT as u64)
    );
    assert_eq!(
        version::locate_version(&stack, location.rid, -1, &wanted).unwrap(),
        VersionLocation::Original(location.rid)
    );

    table.merge(location.page_id).unwrap();
    assert_eq!(
        version::locate_version(&stack, location.rid, 0, &wanted).unwrap(),
        VersionLocation::Base(location.rid)
    );
}

// =============================================================================
// Chain Splicer Tests
// =============================================================================

#[test]
fn test_splicer_marks_and_releases() {
    let splicer = ChainSplicer::new();
    {
        let ticket = splicer.begin(0, 4, || Ok(NONE_RID)).unwrap();
        assert_eq!(ticket.latest(), NONE_RID);
        assert_eq!(splicer.in_progress(), 1);

        // A different record of the same stack is not blocked
        let other = splicer.begin(0, 5, || Ok(NONE_RID)).unwrap();
        assert_eq!(splicer.in_progress(), 2);
        drop(other);
    }
    assert_eq!(splicer.in_progress(), 0);
}

#[test]
fn test_splicer_waits_and_refreshes() {
    let splicer = Arc::new(ChainSplicer::new());
    let latest = Arc::new(parking_lot::Mutex::new(NONE_RID));
    let released = Arc::new(AtomicBool::new(false));

    let ticket = splicer.begin(0, 0, || Ok(*latest.lock())).unwrap();

    let waiter = {
        let splicer = Arc::clone(&splicer);
        let latest = Arc::clone(&latest);
        let released = Arc::clone(&released);
        thread::spawn(move || {
            let ticket = splicer.begin(0, 0, || Ok(*latest.lock())).unwrap();
            assert!(released.load(Ordering::SeqCst));
            ticket.latest()
        })
    };

    thread::sleep(Duration::from_millis(50));
    // First writer splices its tail in, then releases
    *latest.lock() = 512;
    released.store(true, Ordering::SeqCst);
    drop(ticket);

    // The waiter re-read the newest version after waking
    assert_eq!(waiter.join().unwrap(), 512);
}

#[test]
fn test_quiesce_waits_for_splices() {
    let splicer = Arc::new(ChainSplicer::new());
    let ticket = splicer.begin(3, 0, || Ok(NONE_RID)).unwrap();
    let released = Arc::new(AtomicBool::new(false));

    let merger = {
        let splicer = Arc::clone(&splicer);
        let released = Arc::clone(&released);
        thread::spawn(move || splicer.quiesce(3, || released.load(Ordering::SeqCst)))
    };

    thread::sleep(Duration::from_millis(50));
    released.store(true, Ordering::SeqCst);
    drop(ticket);

    assert!(merger.join().unwrap());
    // Other stacks are never blocked
    assert_eq!(splicer.quiesce(4, || 1), 1);
}

// =============================================================================
// Concurrent Update Tests
// =============================================================================

#[test]
fn test_concurrent_updates_chain_every_tail() {
    const THREADS: usize = 8;
    const UPDATES: usize = 50;

    let temp = TempDir::new().unwrap();
    let table = Arc::new(setup_table(&temp));
    table.insert(vec![Value::Int(1), Value::Int(0)]).unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for _ in 0..UPDATES {
                    assert!(table.increment(&Value::Int(1), 1).unwrap());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total = (THREADS * UPDATES) as i64;
    assert_eq!(value_at(&table, 1, 0), Value::Int(total));

    let location = table.locate_key(&Value::Int(1)).unwrap().unwrap();
    let stack = table.stack(location.page_id).unwrap();
    let chain = version::chain(&stack, location.rid).unwrap();
    assert_eq!(chain.len(), THREADS * UPDATES);

    // Every version differs from the one before it by exactly one
    for back in 0..20 {
        assert_eq!(value_at(&table, 1, -back), Value::Int(total - back));
    }
}
