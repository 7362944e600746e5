//! Version Module
//!
//! Resolution of a relative version to the record version holding it.
//!
//! ## Chain Layout
//! ```text
//! base ──indirection──▶ newest tail ──▶ older tail ──▶ ... ──▶ oldest tail ──▶ NONE
//!                                                                          (= base version)
//! ```
//!
//! Tail records carry the full row as of their update, so a version is read
//! from exactly one place. The base version of a record that was folded by a
//! merge lives in the stack's original image; the merged base holds the
//! newest values instead.

mod splice;

pub use splice::{ChainSplicer, SpliceTicket};

use std::sync::Arc;

use crate::error::{LstoreError, Result};
use crate::page::{PageSet, Rid, Value, NONE_RID, SLOT_LIMIT};
use crate::storage::{PageStack, RecordAddress};

/// Where a resolved version is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionLocation {
    /// The current (possibly merged) base page set
    Base(Rid),
    /// The record as inserted: the original image if the slot was merged,
    /// the base page set otherwise
    Original(Rid),
    /// A tail record
    Tail(Rid),
}

impl VersionLocation {
    pub fn rid(&self) -> Rid {
        match *self {
            VersionLocation::Base(rid) | VersionLocation::Original(rid) | VersionLocation::Tail(rid) => rid,
        }
    }
}

/// Locate the version `relative_version` steps behind the newest version of
/// the base record `base_rid` (0 = newest, -1 = one update back, ...).
/// Requests older than the history clamp to the inserted version; positive
/// values are treated as 0.
pub fn locate_version(
    stack: &PageStack,
    base_rid: Rid,
    relative_version: i64,
    wanted: &[bool],
) -> Result<VersionLocation> {
    let slot = base_slot(base_rid)?;
    let base = stack.base();
    let latest = base.indirection_at(slot)?;
    if latest == NONE_RID {
        return Ok(VersionLocation::Base(base_rid));
    }

    let depth = if relative_version < 0 {
        relative_version.unsigned_abs()
    } else {
        0
    };

    if depth == 0 && folded_into_base(&base.tps(), latest, wanted) {
        return Ok(VersionLocation::Base(base_rid));
    }

    let guard = (stack.tail_count() + 1) * SLOT_LIMIT;
    let mut current = latest;
    let mut remaining = depth;
    for _ in 0..guard {
        if remaining == 0 {
            return Ok(VersionLocation::Tail(current));
        }
        let address = RecordAddress::from_rid(stack.page_id(), current);
        let tail = tail_set(stack, &address)?;
        let older = tail.indirection_at(address.slot)?;
        if older == NONE_RID {
            return Ok(VersionLocation::Original(base_rid));
        }
        current = older;
        remaining -= 1;
    }

    Err(LstoreError::CorruptPage(format!(
        "version chain of rid {} in stack {} exceeds {} steps",
        base_rid,
        stack.page_id(),
        guard
    )))
}

/// RID of the version `relative_version` steps behind the newest one; the
/// base RID for the inserted version or a merged newest version
pub fn resolve_version(
    stack: &PageStack,
    base_rid: Rid,
    relative_version: i64,
    wanted: &[bool],
) -> Result<Rid> {
    Ok(locate_version(stack, base_rid, relative_version, wanted)?.rid())
}

/// Read the wanted columns of a located version
pub fn read_version(
    stack: &PageStack,
    location: VersionLocation,
    wanted: &[bool],
) -> Result<Vec<Option<Value>>> {
    match location {
        VersionLocation::Base(rid) => {
            let base = stack.base().pin();
            base.read(base_slot(rid)?, wanted)
        }
        VersionLocation::Original(rid) => {
            let slot = base_slot(rid)?;
            let set = match stack.origin() {
                Some(origin) if slot < origin.len() => origin,
                _ => stack.base(),
            };
            set.pin().read(slot, wanted)
        }
        VersionLocation::Tail(rid) => {
            let address = RecordAddress::from_rid(stack.page_id(), rid);
            let tail = tail_set(stack, &address)?.pin();
            tail.read(address.slot, wanted)
        }
    }
}

/// Newest full row of `base_rid`
pub fn latest_row(stack: &PageStack, base_rid: Rid) -> Result<Vec<Value>> {
    let wanted = vec![true; stack.column_types().len()];
    let location = locate_version(stack, base_rid, 0, &wanted)?;
    Ok(read_version(stack, location, &wanted)?
        .into_iter()
        .map(|v| v.unwrap_or(Value::Null))
        .collect())
}

/// Every tail RID of a record's chain, newest first
pub fn chain(stack: &PageStack, base_rid: Rid) -> Result<Vec<Rid>> {
    let slot = base_slot(base_rid)?;
    let mut rids = Vec::new();
    let mut current = stack.base().indirection_at(slot)?;
    let guard = (stack.tail_count() + 1) * SLOT_LIMIT;
    while current != NONE_RID {
        if rids.len() >= guard {
            return Err(LstoreError::CorruptPage(format!(
                "version chain of rid {} in stack {} does not terminate",
                base_rid,
                stack.page_id()
            )));
        }
        rids.push(current);
        let address = RecordAddress::from_rid(stack.page_id(), current);
        current = tail_set(stack, &address)?.indirection_at(address.slot)?;
    }
    Ok(rids)
}

/// True if the merged base already holds `latest` for every wanted column
fn folded_into_base(tps: &[Rid], latest: Rid, wanted: &[bool]) -> bool {
    let mut any = false;
    for (column, &hwm) in tps.iter().enumerate() {
        if !wanted.get(column).copied().unwrap_or(false) {
            continue;
        }
        if hwm == NONE_RID || latest > hwm {
            return false;
        }
        any = true;
    }
    any
}

fn base_slot(rid: Rid) -> Result<usize> {
    if rid >= SLOT_LIMIT as Rid {
        return Err(LstoreError::CorruptPage(format!(
            "rid {} is not a base rid",
            rid
        )));
    }
    Ok(rid as usize)
}

fn tail_set(stack: &PageStack, address: &RecordAddress) -> Result<Arc<PageSet>> {
    if address.is_base() {
        return Err(LstoreError::CorruptPage(format!(
            "stack {}: tail chain points into the base at slot {}",
            address.page_id, address.slot
        )));
    }
    stack.page_set(address.stack_index).ok_or_else(|| {
        LstoreError::CorruptPage(format!(
            "stack {} has no tail page set at index {}",
            address.page_id, address.stack_index
        ))
    })
}
