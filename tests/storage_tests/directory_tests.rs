//! Tests for the record directory and page stacks
//!
//! These tests verify:
//! - RID ↔ address arithmetic round trips
//! - Base appends fill one stack before creating the next
//! - Tail appends allocate contiguous tail page sets
//! - Location resolution and its errors
//! - Flush, reopen and eviction

use std::sync::Arc;

use lstore::page::{Value, ValueType, NONE_RID, SLOT_LIMIT};
use lstore::storage::{Location, PageStack, RecordAddress, RecordDirectory};
use lstore::LstoreError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn types() -> Arc<[ValueType]> {
    vec![ValueType::Int, ValueType::Int].into()
}

fn setup_directory() -> (TempDir, RecordDirectory) {
    let temp = TempDir::new().unwrap();
    let directory = RecordDirectory::create(temp.path(), types(), false);
    (temp, directory)
}

fn row(i: i64) -> Vec<Value> {
    vec![Value::Int(i), Value::Int(i * 10)]
}

fn insert(directory: &RecordDirectory, i: i64) -> Location {
    let guard = directory.lock_expansion();
    directory.append_base(&guard, &row(i)).unwrap()
}

// =============================================================================
// Addressing Tests
// =============================================================================

#[test]
fn test_rid_round_trip() {
    for stack_index in [0usize, 1, 2, 17, 1000] {
        for slot in [0usize, 1, 255, SLOT_LIMIT - 1] {
            let address = RecordAddress {
                page_id: 4,
                stack_index,
                slot,
            };
            let rid = address.rid();
            assert_eq!(rid, (stack_index * SLOT_LIMIT + slot) as u64);
            assert_eq!(RecordAddress::from_rid(4, rid), address);
        }
    }
}

#[test]
fn test_address_from_location() {
    let address = RecordAddress::from(Location::new(2, 1027));
    assert_eq!(address.page_id, 2);
    assert_eq!(address.stack_index, 2);
    assert_eq!(address.slot, 3);
    assert!(!address.is_base());
    assert_eq!(address.location(), Location::new(2, 1027));
}

// =============================================================================
// Base Append Tests
// =============================================================================

#[test]
fn test_base_appends_fill_stack_then_expand() {
    let (_temp, directory) = setup_directory();
    assert_eq!(directory.stack_count(), 0);

    for i in 0..SLOT_LIMIT as i64 {
        let location = insert(&directory, i);
        assert_eq!(location, Location::new(0, i as u64));
    }
    assert_eq!(directory.stack_count(), 1);

    let location = insert(&directory, 9999);
    assert_eq!(location, Location::new(1, 0));
    assert_eq!(directory.stack_count(), 2);
}

#[test]
fn test_get_or_create_base_idempotent() {
    let (_temp, directory) = setup_directory();

    let first = directory.get_or_create_base(0).unwrap();
    let second = directory.get_or_create_base(0).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(directory.stack_count(), 1);

    assert!(matches!(
        directory.get_or_create_base(5),
        Err(LstoreError::StackNotFound(5))
    ));
}

// =============================================================================
// Tail Append Tests
// =============================================================================

#[test]
fn test_tail_appends_allocate_contiguous_page_sets() {
    let (_temp, directory) = setup_directory();
    insert(&directory, 1);

    let mut older = NONE_RID;
    for n in 0..(SLOT_LIMIT + 3) {
        let rid = directory.append_tail(0, &row(n as i64), older).unwrap();
        assert_eq!(rid, (SLOT_LIMIT + n) as u64);
        older = rid;
    }

    let stack = directory.stack(0).unwrap();
    assert_eq!(stack.tail_count(), 2);
    assert_eq!(stack.current_tail().unwrap().len(), 3);

    // Each tail record points at the one before it
    let address = directory.resolve(Location::new(0, older)).unwrap();
    assert_eq!(address.stack_index, 2);
    let tail = directory.page_set(&address).unwrap();
    assert_eq!(tail.indirection_at(address.slot).unwrap(), older - 1);
}

#[test]
fn test_add_tail() {
    let (_temp, directory) = setup_directory();
    insert(&directory, 1);

    let tail = directory.add_tail(0).unwrap();
    assert_eq!(tail.id().stack_index, 1);
    assert_eq!(tail.base_rid(), SLOT_LIMIT as u64);

    assert!(matches!(
        directory.add_tail(3),
        Err(LstoreError::StackNotFound(3))
    ));
}

// =============================================================================
// Resolution Tests
// =============================================================================

#[test]
fn test_resolve_errors() {
    let (_temp, directory) = setup_directory();
    insert(&directory, 1);

    assert!(directory.resolve(Location::new(0, 0)).is_ok());
    assert!(matches!(
        directory.resolve(Location::new(0, 1)),
        Err(LstoreError::CorruptPage(_))
    ));
    assert!(matches!(
        directory.resolve(Location::new(0, SLOT_LIMIT as u64)),
        Err(LstoreError::CorruptPage(_))
    ));
    assert!(matches!(
        directory.resolve(Location::new(7, 0)),
        Err(LstoreError::StackNotFound(7))
    ));
}

// =============================================================================
// Persistence / Eviction Tests
// =============================================================================

#[test]
fn test_flush_and_reopen() {
    let temp = TempDir::new().unwrap();
    let metas = {
        let directory = RecordDirectory::create(temp.path(), types(), false);
        for i in 0..600 {
            insert(&directory, i);
        }
        directory.append_tail(1, &row(-1), NONE_RID).unwrap();
        assert!(directory.flush_all().unwrap() >= 3);
        directory.metas()
    };

    assert_eq!(metas.len(), 2);
    assert_eq!(metas[0].farthest, SLOT_LIMIT);
    assert_eq!(metas[1].farthest, 600 - SLOT_LIMIT);
    assert_eq!(metas[1].tail_count, 1);
    assert!(PageStack::stack_dir(temp.path(), 1).join("info.bin").exists());

    let directory = RecordDirectory::open(temp.path(), types(), false, &metas).unwrap();
    assert_eq!(directory.stack_count(), 2);
    let base = directory.stack(1).unwrap().base();
    assert_eq!(base.read_all(10).unwrap(), row(SLOT_LIMIT as i64 + 10));

    let tail = directory.stack(1).unwrap().current_tail().unwrap();
    assert_eq!(tail.read_all(0).unwrap(), row(-1));
}

#[test]
fn test_evict_to_limit() {
    let (_temp, directory) = setup_directory();
    for i in 0..(3 * SLOT_LIMIT as i64) {
        insert(&directory, i);
    }
    assert_eq!(directory.resident_count(), 3);

    let evicted = directory.evict_to(1).unwrap();
    assert_eq!(evicted, 2);
    assert_eq!(directory.resident_count(), 1);

    // Evicted stacks read back from disk
    let base = directory.stack(0).unwrap().base();
    assert_eq!(base.read_all(100).unwrap(), row(100));
}

#[test]
fn test_empty_page_sets_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let metas = {
        let directory = RecordDirectory::create(temp.path(), types(), false);
        directory.get_or_create_base(0).unwrap();
        directory.add_tail(0).unwrap();
        directory.flush_all().unwrap();
        directory.metas()
    };
    assert_eq!(metas.len(), 1);
    assert_eq!(metas[0].farthest, 0);
    assert_eq!(metas[0].tail_count, 1);

    let directory = RecordDirectory::open(temp.path(), types(), false, &metas).unwrap();
    let stack = directory.stack(0).unwrap();
    assert!(stack.base().is_empty());
    assert!(stack.current_tail().unwrap().is_empty());

    // The reopened stack keeps accepting records
    assert_eq!(insert(&directory, 5), Location::new(0, 0));
    let rid = directory.append_tail(0, &row(6), NONE_RID).unwrap();
    assert_eq!(rid, SLOT_LIMIT as u64);
}

// =============================================================================
// Merge Bookkeeping Tests
// =============================================================================

#[test]
fn test_update_counter_carries_over_threshold() {
    let (_temp, directory) = setup_directory();
    let stack = directory.stack(insert(&directory, 1).page_id).unwrap();

    let fired = (0..7).filter(|_| stack.record_update(3)).count();
    assert_eq!(fired, 2);
    assert_eq!(stack.updates_since_merge(), 1);
}

#[test]
fn test_update_counter_counts_every_concurrent_update() {
    let (_temp, directory) = setup_directory();
    let stack = directory.stack(insert(&directory, 1).page_id).unwrap();

    let fired: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| (0..1000).filter(|_| stack.record_update(100)).count()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });
    assert_eq!(fired, 80);
    assert_eq!(stack.updates_since_merge(), 0);
}
