//! Page Stack
//!
//! One base page set (stack index 0) plus a growable list of tail page sets
//! (stack index 1..), addressed together by one page id.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::error::Result;
use crate::page::{PageFiles, PageId, PageSet, PageSetId, ValueType};

use super::catalog::StackMeta;

/// File prefix of the original (pre-merge) base image
const ORIGIN_PREFIX: &str = "origin_";

/// A partition of up to `SLOT_LIMIT` base records and their tail versions
///
/// ## Concurrency:
/// - `base`, `origin`, `tails`: RwLock around `Arc` handles; holders of an
///   old handle keep it alive
/// - `updates_since_merge`: atomic counter (lock-free)
/// - `merge_lock`: one merge of this stack at a time
pub struct PageStack {
    page_id: PageId,
    dir: PathBuf,
    column_types: Arc<[ValueType]>,
    sync: bool,

    base: RwLock<Arc<PageSet>>,

    /// Insert-time values of base records already folded by a merge
    origin: RwLock<Option<Arc<PageSet>>>,

    /// `tails[i]` has stack index `i + 1`
    tails: RwLock<Vec<Arc<PageSet>>>,

    updates_since_merge: AtomicU64,
    merge_lock: Mutex<()>,
    merge_blocked: AtomicBool,
}

impl PageStack {
    /// Directory holding all files of stack `page_id`
    pub fn stack_dir(table_dir: &Path, page_id: PageId) -> PathBuf {
        table_dir.join(format!("stack{}", page_id))
    }

    /// Create a stack with an empty base page set
    pub fn create(
        page_id: PageId,
        table_dir: &Path,
        column_types: Arc<[ValueType]>,
        sync: bool,
    ) -> Self {
        let dir = Self::stack_dir(table_dir, page_id);
        let base = PageSet::create(
            PageSetId {
                page_id,
                stack_index: 0,
            },
            PageFiles::new(&dir, "", 0, sync),
            Arc::clone(&column_types),
        );
        Self::assemble(page_id, dir, column_types, sync, base, None, Vec::new(), 0)
    }

    /// Reopen a stack described by the catalog (headers only)
    pub fn open(
        table_dir: &Path,
        column_types: Arc<[ValueType]>,
        sync: bool,
        meta: &StackMeta,
    ) -> Result<Self> {
        let page_id = meta.page_id;
        let dir = Self::stack_dir(table_dir, page_id);

        let base = PageSet::open(
            PageSetId {
                page_id,
                stack_index: 0,
            },
            PageFiles::new(&dir, "", 0, sync),
            Arc::clone(&column_types),
        )?;

        let origin = if meta.has_origin {
            Some(PageSet::open(
                PageSetId {
                    page_id,
                    stack_index: 0,
                },
                PageFiles::new(&dir, ORIGIN_PREFIX, 0, sync),
                Arc::clone(&column_types),
            )?)
        } else {
            None
        };

        let mut tails = Vec::with_capacity(meta.tail_count);
        for stack_index in 1..=meta.tail_count {
            tails.push(Arc::new(PageSet::open(
                PageSetId {
                    page_id,
                    stack_index,
                },
                PageFiles::new(&dir, "", stack_index, sync),
                Arc::clone(&column_types),
            )?));
        }

        Ok(Self::assemble(
            page_id,
            dir,
            column_types,
            sync,
            base,
            origin,
            tails,
            meta.updates_since_merge,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        page_id: PageId,
        dir: PathBuf,
        column_types: Arc<[ValueType]>,
        sync: bool,
        base: PageSet,
        origin: Option<PageSet>,
        tails: Vec<Arc<PageSet>>,
        updates_since_merge: u64,
    ) -> Self {
        Self {
            page_id,
            dir,
            column_types,
            sync,
            base: RwLock::new(Arc::new(base)),
            origin: RwLock::new(origin.map(Arc::new)),
            tails: RwLock::new(tails),
            updates_since_merge: AtomicU64::new(updates_since_merge),
            merge_lock: Mutex::new(()),
            merge_blocked: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Page Sets
    // =========================================================================

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn column_types(&self) -> &[ValueType] {
        &self.column_types
    }

    /// Current base page set
    pub fn base(&self) -> Arc<PageSet> {
        Arc::clone(&self.base.read())
    }

    pub fn origin(&self) -> Option<Arc<PageSet>> {
        self.origin.read().clone()
    }

    pub fn tail_count(&self) -> usize {
        self.tails.read().len()
    }

    /// Page set at `stack_index` (0 = base)
    pub fn page_set(&self, stack_index: usize) -> Option<Arc<PageSet>> {
        if stack_index == 0 {
            return Some(self.base());
        }
        self.tails.read().get(stack_index - 1).cloned()
    }

    /// Newest tail page set, if any
    pub fn current_tail(&self) -> Option<Arc<PageSet>> {
        self.tails.read().last().cloned()
    }

    /// Append the next tail page set. Callers serialize through the
    /// directory's tail-allocation lock.
    pub(crate) fn push_tail(&self) -> Arc<PageSet> {
        let mut tails = self.tails.write();
        let stack_index = tails.len() + 1;
        let tail = Arc::new(PageSet::create(
            PageSetId {
                page_id: self.page_id,
                stack_index,
            },
            PageFiles::new(&self.dir, "", stack_index, self.sync),
            Arc::clone(&self.column_types),
        ));
        tails.push(Arc::clone(&tail));
        tracing::trace!(page_id = self.page_id, stack_index, "allocated tail page set");
        tail
    }

    /// Install a merged snapshot as the base; returns the replaced page set
    pub(crate) fn replace_base(&self, snapshot: Arc<PageSet>) -> Arc<PageSet> {
        std::mem::replace(&mut *self.base.write(), snapshot)
    }

    /// Extend (or create) the original base image from `base`, which must
    /// hold insert-time values for every slot beyond the current image.
    pub(crate) fn extend_origin(&self, base: &PageSet) -> Result<()> {
        let mut origin = self.origin.write();
        match origin.as_ref() {
            Some(image) => {
                image.extend_from(base)?;
            }
            None => {
                let files = PageFiles::new(&self.dir, ORIGIN_PREFIX, 0, self.sync);
                *origin = Some(Arc::new(base.copy_to(files)?));
            }
        }
        Ok(())
    }

    /// Every page set of this stack, base first
    pub fn page_sets(&self) -> Vec<Arc<PageSet>> {
        let mut sets = vec![self.base()];
        if let Some(origin) = self.origin() {
            sets.push(origin);
        }
        sets.extend(self.tails.read().iter().cloned());
        sets
    }

    // =========================================================================
    // Merge Bookkeeping
    // =========================================================================

    /// Count one applied update. Returns true when `threshold` is reached;
    /// the counter then restarts from the updates beyond the threshold.
    pub fn record_update(&self, threshold: u64) -> bool {
        let mut reached = false;
        let _ = self
            .updates_since_merge
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                let count = count + 1;
                reached = count >= threshold;
                Some(if reached { count - threshold } else { count })
            });
        reached
    }

    pub fn updates_since_merge(&self) -> u64 {
        self.updates_since_merge.load(Ordering::Acquire)
    }

    pub(crate) fn lock_merge(&self) -> MutexGuard<'_, ()> {
        self.merge_lock.lock()
    }

    /// Stop merging this stack after a failed merge
    pub fn block_merges(&self) {
        self.merge_blocked.store(true, Ordering::Release);
    }

    pub fn is_merge_blocked(&self) -> bool {
        self.merge_blocked.load(Ordering::Acquire)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Flush every dirty page set; returns how many were written
    pub fn flush(&self) -> Result<usize> {
        std::fs::create_dir_all(&self.dir)?;
        let mut written = 0;
        for set in self.page_sets() {
            if set.flush()? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Catalog entry for this stack
    pub fn meta(&self) -> StackMeta {
        StackMeta {
            page_id: self.page_id,
            tail_count: self.tail_count(),
            farthest: self.base().len(),
            updates_since_merge: self.updates_since_merge(),
            has_origin: self.origin.read().is_some(),
        }
    }
}
