//! Merge Module
//!
//! Folds the newest tail version of every updated record back into a fresh
//! base page set.
//!
//! ## Merge Process
//! ```text
//! 1. Capture     splicer quiet on the stack: record count + every indirection
//! 2. Fold        per column: base value, or the newest tail's value
//! 3. Publish     under the expansion lock:
//!                  - extend the original image with never-merged slots
//!                  - snapshot = copy(current base) with folded columns, TPS
//!                  - swap the snapshot in, retire the replaced page set
//! 4. Release     splicer quiet again: fold late writes to the replaced page
//!                set into the snapshot, drop the back-reference
//! ```
//!
//! Tail page sets are never touched, so every version that existed before a
//! merge still reads the same afterwards.

mod scheduler;

pub use scheduler::MergeScheduler;

use std::sync::Arc;

use crate::error::Result;
use crate::page::{PageId, PageSet, Rid, Value, NONE_RID};
use crate::storage::{PageStack, RecordDirectory};
use crate::version::{read_version, ChainSplicer, VersionLocation};

/// Result of one successful merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub page_id: PageId,
    /// Base records captured
    pub records: usize,
    /// Records whose newest tail version was folded
    pub folded: usize,
    /// New high-water mark (newest folded tail RID)
    pub tps: Rid,
}

/// Merge one page stack. Returns `None` when the stack is blocked or has
/// nothing to fold. A failed merge blocks further merges of the stack.
pub fn merge_stack(
    directory: &RecordDirectory,
    splicer: &ChainSplicer,
    page_id: PageId,
) -> Result<Option<MergeReport>> {
    let stack = directory.stack(page_id)?;
    if stack.is_merge_blocked() {
        tracing::debug!(page_id, "merges blocked, skipping");
        return Ok(None);
    }

    let _merging = stack.lock_merge();
    match fold_and_publish(directory, splicer, &stack) {
        Ok(report) => {
            if let Some(report) = &report {
                tracing::debug!(
                    page_id,
                    records = report.records,
                    folded = report.folded,
                    tps = report.tps,
                    "merged page stack"
                );
            }
            Ok(report)
        }
        Err(e) => {
            stack.block_merges();
            tracing::error!(page_id, error = %e, "merge failed, stack blocked");
            Err(e)
        }
    }
}

fn fold_and_publish(
    directory: &RecordDirectory,
    splicer: &ChainSplicer,
    stack: &PageStack,
) -> Result<Option<MergeReport>> {
    let page_id = stack.page_id();

    // 1. Capture
    let (current, heads) = splicer.quiesce(page_id, || -> Result<(Arc<PageSet>, Vec<Rid>)> {
        let current = stack.base();
        let heads = (0..current.len())
            .map(|slot| current.indirection_at(slot))
            .collect::<Result<Vec<_>>>()?;
        Ok((current, heads))
    })?;

    // 2. Fold
    let num_columns = stack.column_types().len();
    let all = vec![true; num_columns];
    let mut folded: Vec<Vec<Value>> = vec![Vec::with_capacity(heads.len()); num_columns];
    let mut newest = NONE_RID;
    let mut folded_records = 0;

    for (slot, &head) in heads.iter().enumerate() {
        let row = if head == NONE_RID {
            current.read_all(slot)?
        } else {
            folded_records += 1;
            newest = if newest == NONE_RID { head } else { newest.max(head) };
            read_version(stack, VersionLocation::Tail(head), &all)?
                .into_iter()
                .map(|v| v.unwrap_or(Value::Null))
                .collect()
        };
        for (column, value) in row.into_iter().enumerate() {
            folded[column].push(value);
        }
    }

    if folded_records == 0 {
        return Ok(None);
    }

    // 3. Publish
    let snapshot = {
        let _expansion = directory.lock_expansion();
        stack.extend_origin(&current)?;
        let snapshot = Arc::new(PageSet::merged_from(
            &current,
            &folded,
            vec![newest; num_columns],
        )?);
        let replaced = stack.replace_base(Arc::clone(&snapshot));
        replaced.retire();
        snapshot
    };

    // 4. Release: splices begun before the swap may still write the replaced
    // page set; once they drain, its writes are folded in for good
    splicer.quiesce(page_id, || snapshot.release_previous())?;

    Ok(Some(MergeReport {
        page_id,
        records: heads.len(),
        folded: folded_records,
        tps: newest,
    }))
}
