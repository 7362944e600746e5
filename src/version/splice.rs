//! Chain splicing
//!
//! Serializes the read-modify-write of a record's newest version. A writer
//! marks the version it extends as `update_in_progress`; a second writer that
//! finds the same version marked waits, then re-reads the newest version.
//! Merges drain all marks of a stack before capturing its chain heads.

use std::collections::HashSet;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::page::{PageId, Rid, NONE_RID};

#[derive(Default)]
struct SpliceState {
    /// (page id, version being extended)
    in_progress: HashSet<(PageId, Rid)>,
    /// Stacks a merge is waiting to capture; new splices wait
    draining: HashSet<PageId>,
}

/// Chain-splice lock of one table
#[derive(Default)]
pub struct ChainSplicer {
    state: Mutex<SpliceState>,
    released: Condvar,
}

impl ChainSplicer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the newest version of a chain as being extended.
    ///
    /// `read_latest` returns the chain's newest tail RID (`NONE_RID` when the
    /// record was never updated, in which case the base version `base_rid`
    /// is the one extended). It runs under the splice lock and is re-run
    /// after every wait.
    pub fn begin<F>(&self, page_id: PageId, base_rid: Rid, mut read_latest: F) -> Result<SpliceTicket<'_>>
    where
        F: FnMut() -> Result<Rid>,
    {
        let mut state = self.state.lock();
        loop {
            if state.draining.contains(&page_id) {
                self.released.wait(&mut state);
                continue;
            }
            let latest = read_latest()?;
            let extending = if latest == NONE_RID { base_rid } else { latest };
            if state.in_progress.contains(&(page_id, extending)) {
                tracing::trace!(page_id, rid = extending, "version busy, waiting");
                self.released.wait(&mut state);
                continue;
            }
            state.in_progress.insert((page_id, extending));
            return Ok(SpliceTicket {
                splicer: self,
                key: (page_id, extending),
                latest,
            });
        }
    }

    /// Run `f` once no splice is in progress on `page_id`. New splices of
    /// that stack wait until `f` returns.
    pub fn quiesce<R>(&self, page_id: PageId, f: impl FnOnce() -> R) -> R {
        let mut state = self.state.lock();
        state.draining.insert(page_id);
        while state.in_progress.iter().any(|(p, _)| *p == page_id) {
            self.released.wait(&mut state);
        }
        let out = f();
        state.draining.remove(&page_id);
        drop(state);
        self.released.notify_all();
        out
    }

    /// Number of versions currently marked
    pub fn in_progress(&self) -> usize {
        self.state.lock().in_progress.len()
    }
}

/// A version marked `update_in_progress`; cleared on drop
pub struct SpliceTicket<'a> {
    splicer: &'a ChainSplicer,
    key: (PageId, Rid),
    latest: Rid,
}

impl SpliceTicket<'_> {
    /// Newest tail RID observed when the mark was taken (`NONE_RID` if the
    /// record had no tail versions)
    pub fn latest(&self) -> Rid {
        self.latest
    }
}

impl Drop for SpliceTicket<'_> {
    fn drop(&mut self) {
        self.splicer.state.lock().in_progress.remove(&self.key);
        self.splicer.released.notify_all();
    }
}
