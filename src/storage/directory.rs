//! Record Directory
//!
//! Maps record locations to page sets. Addressing is pure arithmetic:
//! `RID = stack_index * SLOT_LIMIT + slot`; the only real directory is the
//! page id → page stack map.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{LstoreError, Result};
use crate::page::{PageId, PageSet, Rid, Value, ValueType, NONE_RID, SLOT_LIMIT};

use super::catalog::StackMeta;
use super::PageStack;

/// Held while creating stacks or appending base records
pub type ExpansionGuard<'a> = MutexGuard<'a, ()>;

/// Table-wide location of one record version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub page_id: PageId,
    pub rid: Rid,
}

impl Location {
    pub fn new(page_id: PageId, rid: Rid) -> Self {
        Self { page_id, rid }
    }
}

/// Physical address of a record: page stack, stack index, slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordAddress {
    pub page_id: PageId,
    pub stack_index: usize,
    pub slot: usize,
}

impl RecordAddress {
    /// Split a RID by the address formula
    pub fn from_rid(page_id: PageId, rid: Rid) -> Self {
        Self {
            page_id,
            stack_index: (rid / SLOT_LIMIT as Rid) as usize,
            slot: (rid % SLOT_LIMIT as Rid) as usize,
        }
    }

    /// Re-encode by the address formula
    pub fn rid(&self) -> Rid {
        (self.stack_index * SLOT_LIMIT + self.slot) as Rid
    }

    pub fn location(&self) -> Location {
        Location::new(self.page_id, self.rid())
    }

    pub fn is_base(&self) -> bool {
        self.stack_index == 0
    }
}

impl From<Location> for RecordAddress {
    fn from(location: Location) -> Self {
        Self::from_rid(location.page_id, location.rid)
    }
}

/// Directory of page stacks for one table
///
/// ## Locks:
/// - `expansion_lock`: only one thread installs a new stack / base slot
/// - `tail_lock`: only one thread allocates tail slots, so two updates never
///   receive the same tail RID
pub struct RecordDirectory {
    dir: PathBuf,
    column_types: Arc<[ValueType]>,
    sync: bool,
    stacks: RwLock<Vec<Arc<PageStack>>>,
    expansion_lock: Mutex<()>,
    tail_lock: Mutex<()>,
}

impl RecordDirectory {
    /// Empty directory; stacks are created on first insert
    pub fn create(dir: &Path, column_types: Arc<[ValueType]>, sync: bool) -> Self {
        Self::with_stacks(dir, column_types, sync, Vec::new())
    }

    /// Reopen the stacks listed in the catalog
    pub fn open(
        dir: &Path,
        column_types: Arc<[ValueType]>,
        sync: bool,
        metas: &[StackMeta],
    ) -> Result<Self> {
        let mut stacks = Vec::with_capacity(metas.len());
        for (expected, meta) in metas.iter().enumerate() {
            if meta.page_id != expected as PageId {
                return Err(LstoreError::Catalog(format!(
                    "stack ids are not contiguous: expected {}, found {}",
                    expected, meta.page_id
                )));
            }
            stacks.push(Arc::new(PageStack::open(
                dir,
                Arc::clone(&column_types),
                sync,
                meta,
            )?));
        }
        Ok(Self::with_stacks(dir, column_types, sync, stacks))
    }

    fn with_stacks(
        dir: &Path,
        column_types: Arc<[ValueType]>,
        sync: bool,
        stacks: Vec<Arc<PageStack>>,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            column_types,
            sync,
            stacks: RwLock::new(stacks),
            expansion_lock: Mutex::new(()),
            tail_lock: Mutex::new(()),
        }
    }

    // =========================================================================
    // Stacks
    // =========================================================================

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stack_count(&self) -> usize {
        self.stacks.read().len()
    }

    pub fn stack(&self, page_id: PageId) -> Result<Arc<PageStack>> {
        self.stacks
            .read()
            .get(page_id as usize)
            .cloned()
            .ok_or(LstoreError::StackNotFound(page_id))
    }

    /// Snapshot of all stacks in page id order
    pub fn stacks(&self) -> Vec<Arc<PageStack>> {
        self.stacks.read().clone()
    }

    pub fn lock_expansion(&self) -> ExpansionGuard<'_> {
        self.expansion_lock.lock()
    }

    /// Base page set of `page_id`, creating the stack if it is the next one.
    /// Idempotent; only one caller ever installs a given stack.
    pub fn get_or_create_base(&self, page_id: PageId) -> Result<Arc<PageSet>> {
        if let Ok(stack) = self.stack(page_id) {
            return Ok(stack.base());
        }
        let guard = self.lock_expansion();
        Ok(self.get_or_create_stack(&guard, page_id)?.base())
    }

    fn get_or_create_stack(&self, _guard: &ExpansionGuard<'_>, page_id: PageId) -> Result<Arc<PageStack>> {
        let mut stacks = self.stacks.write();
        if let Some(stack) = stacks.get(page_id as usize) {
            return Ok(Arc::clone(stack));
        }
        if page_id as usize != stacks.len() {
            return Err(LstoreError::StackNotFound(page_id));
        }
        let stack = Arc::new(PageStack::create(
            page_id,
            &self.dir,
            Arc::clone(&self.column_types),
            self.sync,
        ));
        stacks.push(Arc::clone(&stack));
        tracing::debug!(page_id, "created page stack");
        Ok(stack)
    }

    /// Write a new base record into the first stack with room, creating the
    /// next stack when the last one is full.
    pub fn append_base(&self, guard: &ExpansionGuard<'_>, values: &[Value]) -> Result<Location> {
        let mut page_id = self.stack_count().saturating_sub(1) as PageId;
        loop {
            let stack = self.get_or_create_stack(guard, page_id)?;
            if let Some(rid) = stack.base().append(values, NONE_RID)? {
                return Ok(Location::new(page_id, rid));
            }
            page_id += 1;
        }
    }

    /// Allocate the next tail page set of `page_id`
    pub fn add_tail(&self, page_id: PageId) -> Result<Arc<PageSet>> {
        let stack = self.stack(page_id)?;
        let _guard = self.tail_lock.lock();
        Ok(stack.push_tail())
    }

    /// Append a tail record to `page_id`, allocating a tail page set when the
    /// current one is full. Returns the new tail RID.
    pub fn append_tail(&self, page_id: PageId, values: &[Value], older: Rid) -> Result<Rid> {
        let stack = self.stack(page_id)?;
        let _guard = self.tail_lock.lock();
        loop {
            let tail = match stack.current_tail() {
                Some(tail) if tail.has_capacity() => tail,
                _ => stack.push_tail(),
            };
            if let Some(rid) = tail.append(values, older)? {
                return Ok(rid);
            }
        }
    }

    // =========================================================================
    // Addressing
    // =========================================================================

    /// Resolve a location to its physical address, checking that it was
    /// written
    pub fn resolve(&self, location: Location) -> Result<RecordAddress> {
        let address = RecordAddress::from(location);
        let set = self.page_set(&address)?;
        if address.slot >= set.len() {
            return Err(LstoreError::CorruptPage(format!(
                "rid {} of stack {} points past the written slots",
                location.rid, location.page_id
            )));
        }
        Ok(address)
    }

    /// Page set holding `address`
    pub fn page_set(&self, address: &RecordAddress) -> Result<Arc<PageSet>> {
        self.stack(address.page_id)?
            .page_set(address.stack_index)
            .ok_or_else(|| {
                LstoreError::CorruptPage(format!(
                    "stack {} has no page set at index {}",
                    address.page_id, address.stack_index
                ))
            })
    }

    // =========================================================================
    // Write-back / Eviction
    // =========================================================================

    /// Flush every dirty page set of every stack
    pub fn flush_all(&self) -> Result<usize> {
        let mut written = 0;
        for stack in self.stacks() {
            written += stack.flush()?;
        }
        Ok(written)
    }

    /// Number of page sets holding resident pages
    pub fn resident_count(&self) -> usize {
        self.stacks()
            .iter()
            .flat_map(|s| s.page_sets())
            .filter(|s| s.is_resident())
            .count()
    }

    /// Evict unpinned page sets until at most `limit` remain resident.
    /// Oldest stacks go first. Returns how many were evicted.
    pub fn evict_to(&self, limit: usize) -> Result<usize> {
        let resident: Vec<Arc<PageSet>> = self
            .stacks()
            .iter()
            .flat_map(|s| s.page_sets())
            .filter(|s| s.is_resident())
            .collect();
        if resident.len() <= limit {
            return Ok(0);
        }

        let mut excess = resident.len() - limit;
        let mut evicted = 0;
        for set in resident {
            if excess == 0 {
                break;
            }
            if set.evict()? {
                excess -= 1;
                evicted += 1;
            }
        }
        tracing::debug!(evicted, limit, "evicted page sets");
        Ok(evicted)
    }

    /// Catalog entries for all stacks
    pub fn metas(&self) -> Vec<StackMeta> {
        self.stacks().iter().map(|s| s.meta()).collect()
    }
}
