//! Page Set
//!
//! The pages of one stack index: `rid` and `indirection` meta columns plus
//! one page per user column, sharing one slot numbering.
//!
//! ## Concurrency
//! - `state`: RwLock; readers take an upgradable read and only upgrade when
//!   an attribute still has to be loaded from disk
//! - `dirty`, `pins`, `retired`: atomics (lock-free)
//! - `previous`: the page set this one replaced during a merge, kept so the
//!   newer of the two indirection values is always visible

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{
    Mutex, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard,
};

use crate::error::{LstoreError, Result};

use super::{
    newer_rid, Page, PageHeader, PageId, Rid, Value, ValueType, NONE_RID, PAGE_SIZE,
    SLOT_LIMIT, TOMBSTONE_RID,
};

/// Attribute slot of the `rid` meta column
const RID_ATTR: usize = 0;

/// Attribute slot of the `indirection` meta column
const INDIRECTION_ATTR: usize = 1;

/// Attribute slot of user column 0
const FIRST_COLUMN_ATTR: usize = 2;

/// Position of a page set inside the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageSetId {
    pub page_id: PageId,
    pub stack_index: usize,
}

// =============================================================================
// Backing Files
// =============================================================================

/// Where a page set lives on disk: one file per attribute in the stack
/// directory, the page set occupying one 4096-byte region of each.
#[derive(Debug, Clone)]
pub struct PageFiles {
    dir: PathBuf,
    prefix: &'static str,
    region: u64,
    sync: bool,
}

impl PageFiles {
    pub fn new(dir: impl Into<PathBuf>, prefix: &'static str, region: usize, sync: bool) -> Self {
        Self {
            dir: dir.into(),
            prefix,
            region: region as u64,
            sync,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// "info.bin", or "origin_info.bin" for the original base image
    pub fn header_path(&self) -> PathBuf {
        self.dir.join(format!("{}info.bin", self.prefix))
    }

    pub fn attr_path(&self, attr: usize) -> PathBuf {
        let name = match attr {
            RID_ATTR => "rid".to_string(),
            INDIRECTION_ATTR => "indirection".to_string(),
            n => format!("column{}", n - FIRST_COLUMN_ATTR),
        };
        self.dir.join(format!("{}{}.bin", self.prefix, name))
    }

    fn offset(&self) -> u64 {
        self.region * PAGE_SIZE as u64
    }

    /// Read this page set's region of `path` in one sequential read.
    /// Returns `None` if the file or the region does not exist.
    fn read_region(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if file.metadata()?.len() < self.offset() + PAGE_SIZE as u64 {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(self.offset()))?;
        let mut buf = vec![0u8; PAGE_SIZE];
        file.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    fn write_region(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.seek(SeekFrom::Start(self.offset()))?;
        file.write_all(bytes)?;
        if self.sync {
            file.sync_data()?;
        }
        Ok(())
    }
}

// =============================================================================
// Page Set
// =============================================================================

#[derive(Clone)]
struct PageSetState {
    initialized: bool,
    num_records: usize,
    /// rid, indirection, column 0..N; `None` = not loaded yet
    attrs: Vec<Option<Page>>,
    tps: Vec<Rid>,
}

impl PageSetState {
    fn page(&self, attr: usize) -> Result<&Page> {
        self.attrs[attr]
            .as_ref()
            .ok_or_else(|| LstoreError::CorruptPage(format!("attribute {attr} not loaded")))
    }

    fn page_mut(&mut self, attr: usize) -> Result<&mut Page> {
        self.attrs[attr]
            .as_mut()
            .ok_or_else(|| LstoreError::CorruptPage(format!("attribute {attr} not loaded")))
    }
}

/// One stack index worth of pages (the slotted page of the design)
pub struct PageSet {
    id: PageSetId,
    files: PageFiles,
    column_types: Arc<[ValueType]>,
    state: RwLock<PageSetState>,
    dirty: AtomicBool,
    pins: AtomicUsize,
    retired: AtomicBool,
    previous: Mutex<Option<Arc<PageSet>>>,
}

impl PageSet {
    /// Create an empty, fully resident page set. It starts dirty so its
    /// header reaches disk even if no record is ever written.
    pub fn create(id: PageSetId, files: PageFiles, column_types: Arc<[ValueType]>) -> Self {
        let attr_count = FIRST_COLUMN_ATTR + column_types.len();
        let state = PageSetState {
            initialized: false,
            num_records: 0,
            attrs: (0..attr_count).map(|_| Some(Page::new())).collect(),
            tps: vec![NONE_RID; column_types.len()],
        };
        Self::with_state(id, files, column_types, state, true)
    }

    /// Open a page set from disk. Only the header is read; attributes are
    /// loaded on first use.
    pub fn open(id: PageSetId, files: PageFiles, column_types: Arc<[ValueType]>) -> Result<Self> {
        let bytes = files.read_region(&files.header_path())?.ok_or_else(|| {
            LstoreError::CorruptPage(format!(
                "missing header for stack {} index {} in {}",
                id.page_id,
                id.stack_index,
                files.dir().display()
            ))
        })?;
        let header = PageHeader::decode(&bytes)?;
        if header.column_types.as_slice() != &column_types[..] {
            return Err(LstoreError::CorruptPage(format!(
                "stack {} index {}: header column types {:?} do not match table {:?}",
                id.page_id, id.stack_index, header.column_types, column_types
            )));
        }

        let attr_count = FIRST_COLUMN_ATTR + column_types.len();
        let state = PageSetState {
            initialized: header.initialized,
            num_records: header.num_records,
            attrs: vec![None; attr_count],
            tps: header.tps,
        };
        Ok(Self::with_state(id, files, column_types, state, false))
    }

    fn with_state(
        id: PageSetId,
        files: PageFiles,
        column_types: Arc<[ValueType]>,
        state: PageSetState,
        dirty: bool,
    ) -> Self {
        Self {
            id,
            files,
            column_types,
            state: RwLock::new(state),
            dirty: AtomicBool::new(dirty),
            pins: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            previous: Mutex::new(None),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> PageSetId {
        self.id
    }

    pub fn column_types(&self) -> &[ValueType] {
        &self.column_types
    }

    /// Number of slots written
    pub fn len(&self) -> usize {
        self.state.read().num_records
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_capacity(&self) -> bool {
        self.len() < SLOT_LIMIT
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// True if any attribute is loaded in memory
    pub fn is_resident(&self) -> bool {
        self.state.read().attrs.iter().any(Option::is_some)
    }

    /// Loaded flag of user column `column`
    pub fn is_column_loaded(&self, column: usize) -> bool {
        self.state
            .read()
            .attrs
            .get(FIRST_COLUMN_ATTR + column)
            .is_some_and(Option::is_some)
    }

    /// Per-column high-water marks
    pub fn tps(&self) -> Vec<Rid> {
        self.state.read().tps.clone()
    }

    /// First RID of this page set
    pub fn base_rid(&self) -> Rid {
        (self.id.stack_index * SLOT_LIMIT) as Rid
    }

    // =========================================================================
    // Lazy Loading
    // =========================================================================

    fn attr_count(&self) -> usize {
        FIRST_COLUMN_ATTR + self.column_types.len()
    }

    fn load_missing(&self, state: &mut PageSetState, attrs: &[usize]) -> Result<()> {
        for &attr in attrs {
            if state.attrs[attr].is_some() {
                continue;
            }
            let page = if state.num_records == 0 {
                Page::new()
            } else {
                let path = self.files.attr_path(attr);
                let bytes = self.files.read_region(&path)?.ok_or_else(|| {
                    LstoreError::CorruptPage(format!(
                        "stack {} index {}: {} holds no page for {} records",
                        self.id.page_id,
                        self.id.stack_index,
                        path.display(),
                        state.num_records
                    ))
                })?;
                Page::from_bytes(bytes)?
            };
            tracing::trace!(
                page_id = self.id.page_id,
                stack_index = self.id.stack_index,
                attr,
                "loaded attribute"
            );
            state.attrs[attr] = Some(page);
        }
        Ok(())
    }

    /// Read access with `attrs` guaranteed resident
    fn read_state(&self, attrs: &[usize]) -> Result<RwLockReadGuard<'_, PageSetState>> {
        let guard = self.state.upgradable_read();
        if attrs.iter().all(|&a| guard.attrs[a].is_some()) {
            return Ok(RwLockUpgradableReadGuard::downgrade(guard));
        }
        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
        self.load_missing(&mut guard, attrs)?;
        Ok(RwLockWriteGuard::downgrade(guard))
    }

    /// Write access with `attrs` guaranteed resident
    fn write_state(&self, attrs: &[usize]) -> Result<RwLockWriteGuard<'_, PageSetState>> {
        let mut guard = self.state.write();
        self.load_missing(&mut guard, attrs)?;
        Ok(guard)
    }

    fn all_attrs(&self) -> Vec<usize> {
        (0..self.attr_count()).collect()
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Append a record. The RID is derived from the slot; returns `None`
    /// when the page set is full.
    pub fn append(&self, values: &[Value], indirection: Rid) -> Result<Option<Rid>> {
        if values.len() != self.column_types.len() {
            return Err(LstoreError::InvalidValue(format!(
                "expected {} values, got {}",
                self.column_types.len(),
                values.len()
            )));
        }
        let encoded = values
            .iter()
            .zip(self.column_types.iter())
            .map(|(v, ty)| v.encode(*ty))
            .collect::<Result<Vec<_>>>()?;

        let mut state = self.write_state(&self.all_attrs())?;
        if state.num_records >= SLOT_LIMIT {
            return Ok(None);
        }

        let slot = state.num_records;
        let rid = self.base_rid() + slot as Rid;
        state.page_mut(RID_ATTR)?.write_rid(slot, rid);
        state.page_mut(INDIRECTION_ATTR)?.write_rid(slot, indirection);
        for (column, bytes) in encoded.into_iter().enumerate() {
            state
                .page_mut(FIRST_COLUMN_ATTR + column)?
                .write_slot(slot, bytes);
        }
        state.num_records += 1;
        state.initialized = true;
        self.dirty.store(true, Ordering::Release);

        Ok(Some(rid))
    }

    /// Read the wanted columns of `slot`. Unwanted columns come back as
    /// `None`; a slot never written reads as `Value::Null`.
    pub fn read(&self, slot: usize, wanted: &[bool]) -> Result<Vec<Option<Value>>> {
        let columns: Vec<usize> = (0..self.column_types.len())
            .filter(|&c| wanted.get(c).copied().unwrap_or(false))
            .collect();
        let attrs: Vec<usize> = columns.iter().map(|c| FIRST_COLUMN_ATTR + c).collect();

        let mut out = vec![None; self.column_types.len()];
        if columns.is_empty() {
            return Ok(out);
        }

        let state = self.read_state(&attrs)?;
        for column in columns {
            let value = if slot < state.num_records {
                let bytes = state.page(FIRST_COLUMN_ATTR + column)?.read_slot(slot);
                Value::decode(bytes, self.column_types[column])?
            } else {
                Value::Null
            };
            out[column] = Some(value);
        }
        Ok(out)
    }

    /// Read every column of `slot`
    pub fn read_all(&self, slot: usize) -> Result<Vec<Value>> {
        let wanted = vec![true; self.column_types.len()];
        Ok(self
            .read(slot, &wanted)?
            .into_iter()
            .map(|v| v.unwrap_or(Value::Null))
            .collect())
    }

    fn read_meta(&self, attr: usize, slot: usize) -> Result<Rid> {
        let state = self.read_state(&[attr])?;
        if slot >= state.num_records {
            return Ok(NONE_RID);
        }
        Ok(state.page(attr)?.read_rid(slot))
    }

    /// Stored RID of `slot` (`TOMBSTONE_RID` once deleted)
    pub fn rid_at(&self, slot: usize) -> Result<Rid> {
        let own = self.read_meta(RID_ATTR, slot)?;
        if own == TOMBSTONE_RID {
            return Ok(own);
        }
        if let Some(prev) = self.previous() {
            if prev.read_meta(RID_ATTR, slot)? == TOMBSTONE_RID {
                return Ok(TOMBSTONE_RID);
            }
        }
        Ok(own)
    }

    pub fn is_deleted(&self, slot: usize) -> Result<bool> {
        Ok(self.rid_at(slot)? == TOMBSTONE_RID)
    }

    /// Indirection of `slot`: the newer of this page set's value and the
    /// value in the page set it replaced
    pub fn indirection_at(&self, slot: usize) -> Result<Rid> {
        let own = self.read_meta(INDIRECTION_ATTR, slot)?;
        match self.previous() {
            Some(prev) => Ok(newer_rid(own, prev.read_meta(INDIRECTION_ATTR, slot)?)),
            None => Ok(own),
        }
    }

    pub fn set_indirection(&self, slot: usize, rid: Rid) -> Result<()> {
        self.write_meta(INDIRECTION_ATTR, slot, rid)
    }

    /// Tombstone `slot` by overwriting its RID
    pub fn mark_deleted(&self, slot: usize) -> Result<()> {
        self.write_meta(RID_ATTR, slot, TOMBSTONE_RID)
    }

    fn write_meta(&self, attr: usize, slot: usize, value: Rid) -> Result<()> {
        let mut state = self.write_state(&[attr])?;
        if slot >= state.num_records {
            return Err(LstoreError::CorruptPage(format!(
                "stack {} index {}: slot {} was never written",
                self.id.page_id, self.id.stack_index, slot
            )));
        }
        state.page_mut(attr)?.write_rid(slot, value);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    // =========================================================================
    // Pinning
    // =========================================================================

    /// Pin this page set for the lifetime of the returned guard
    pub fn pin(self: &Arc<Self>) -> PinGuard {
        self.pins.fetch_add(1, Ordering::AcqRel);
        PinGuard {
            set: Arc::clone(self),
        }
    }

    pub fn pin_count(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    // =========================================================================
    // Merge Support
    // =========================================================================

    /// The page set this one replaced, if any
    pub fn previous(&self) -> Option<Arc<PageSet>> {
        self.previous.lock().clone()
    }

    /// Drop the back-reference once no writer can still target it
    pub fn clear_previous(&self) {
        self.previous.lock().take();
    }

    /// Fold the replaced page set's last writes into this one and drop the
    /// back-reference. Callers must ensure no writer still targets it.
    pub fn release_previous(&self) -> Result<()> {
        if self.previous.lock().is_none() {
            return Ok(());
        }
        let mut state = self.write_state(&[RID_ATTR, INDIRECTION_ATTR])?;
        self.absorb_previous(&mut state)?;
        self.dirty.store(true, Ordering::Release);
        self.clear_previous();
        Ok(())
    }

    /// Mark as replaced: never flushed or evicted again
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Fold newer indirection values and tombstones of `previous` into `state`
    fn absorb_previous(&self, state: &mut PageSetState) -> Result<()> {
        let Some(prev) = self.previous() else {
            return Ok(());
        };
        let prev_state = prev.read_state(&[RID_ATTR, INDIRECTION_ATTR])?;
        let shared = state.num_records.min(prev_state.num_records);
        for slot in 0..shared {
            let theirs = prev_state.page(INDIRECTION_ATTR)?.read_rid(slot);
            let ours = state.page(INDIRECTION_ATTR)?.read_rid(slot);
            let newest = newer_rid(ours, theirs);
            if newest != ours {
                state.page_mut(INDIRECTION_ATTR)?.write_rid(slot, newest);
            }
            if prev_state.page(RID_ATTR)?.read_rid(slot) == TOMBSTONE_RID {
                state.page_mut(RID_ATTR)?.write_rid(slot, TOMBSTONE_RID);
            }
        }
        Ok(())
    }

    /// Full resident copy of this page set's current contents
    fn resident_copy(&self) -> Result<PageSetState> {
        let mut state = self.read_state(&self.all_attrs())?.clone();
        self.absorb_previous(&mut state)?;
        Ok(state)
    }

    /// Build a merged base snapshot of `current`: every attribute is copied,
    /// then column `c` slots `0..folded[c].len()` are replaced by the folded
    /// values. The snapshot keeps `current` as its back-reference.
    pub fn merged_from(
        current: &Arc<PageSet>,
        folded: &[Vec<Value>],
        tps: Vec<Rid>,
    ) -> Result<PageSet> {
        let mut state = current.resident_copy()?;
        for (column, values) in folded.iter().enumerate() {
            let ty = current.column_types[column];
            let page = state.page_mut(FIRST_COLUMN_ATTR + column)?;
            for (slot, value) in values.iter().enumerate() {
                page.write_slot(slot, value.encode(ty)?);
            }
        }
        state.tps = tps;

        let snapshot = Self::with_state(
            current.id,
            current.files.clone(),
            Arc::clone(&current.column_types),
            state,
            true,
        );
        *snapshot.previous.lock() = Some(Arc::clone(current));
        Ok(snapshot)
    }

    /// Copy of this page set stored under different files (original image)
    pub fn copy_to(&self, files: PageFiles) -> Result<PageSet> {
        let mut state = self.resident_copy()?;
        state.tps = vec![NONE_RID; self.column_types.len()];
        Ok(Self::with_state(
            self.id,
            files,
            Arc::clone(&self.column_types),
            state,
            true,
        ))
    }

    /// Append the slots of `source` beyond this page set's length.
    /// Returns the number of slots copied.
    pub fn extend_from(&self, source: &PageSet) -> Result<usize> {
        let src = source.read_state(&source.all_attrs())?;
        let mut state = self.write_state(&self.all_attrs())?;
        let start = state.num_records;
        if src.num_records <= start {
            return Ok(0);
        }
        for attr in 0..self.attr_count() {
            let from = src.page(attr)?;
            let to = state.page_mut(attr)?;
            for slot in start..src.num_records {
                to.write_slot(slot, from.read_slot(slot));
            }
        }
        state.num_records = src.num_records;
        state.initialized = true;
        self.dirty.store(true, Ordering::Release);
        Ok(src.num_records - start)
    }

    // =========================================================================
    // Write-back / Eviction
    // =========================================================================

    /// Write header and resident attributes to disk if dirty.
    /// Returns whether anything was written.
    pub fn flush(&self) -> Result<bool> {
        if self.is_retired() || !self.needs_flush() {
            return Ok(false);
        }
        let mut state = self.state.write();
        self.flush_locked(&mut state)
    }

    /// Dirty, or still backed by a replaced page set that writers may have
    /// touched after the merge copied it
    fn needs_flush(&self) -> bool {
        self.is_dirty() || self.previous.lock().is_some()
    }

    fn flush_locked(&self, state: &mut PageSetState) -> Result<bool> {
        if !self.needs_flush() {
            return Ok(false);
        }
        if self.previous.lock().is_some() {
            self.load_missing(state, &[RID_ATTR, INDIRECTION_ATTR])?;
            self.absorb_previous(state)?;
        }

        std::fs::create_dir_all(self.files.dir())?;
        for (attr, page) in state.attrs.iter().enumerate() {
            if let Some(page) = page {
                self.files
                    .write_region(&self.files.attr_path(attr), page.as_bytes())?;
            }
        }
        let header = PageHeader {
            initialized: state.initialized,
            num_records: state.num_records,
            column_types: self.column_types.to_vec(),
            tps: state.tps.clone(),
        };
        self.files
            .write_region(&self.files.header_path(), &header.encode())?;
        self.dirty.store(false, Ordering::Release);

        tracing::trace!(
            page_id = self.id.page_id,
            stack_index = self.id.stack_index,
            records = state.num_records,
            "flushed page set"
        );
        Ok(true)
    }

    /// Write back if dirty and drop all resident pages. Pinned and retired
    /// page sets are left alone. Returns whether the page set was evicted.
    pub fn evict(&self) -> Result<bool> {
        if self.is_retired() || self.pin_count() > 0 {
            return Ok(false);
        }
        let mut state = self.state.write();
        if self.pin_count() > 0 {
            return Ok(false);
        }
        self.flush_locked(&mut state)?;
        for attr in state.attrs.iter_mut() {
            *attr = None;
        }
        Ok(true)
    }
}

impl std::fmt::Debug for PageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSet")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("dirty", &self.is_dirty())
            .field("pins", &self.pin_count())
            .finish()
    }
}

/// Keeps a page set pinned while alive
pub struct PinGuard {
    set: Arc<PageSet>,
}

impl Deref for PinGuard {
    type Target = PageSet;

    fn deref(&self) -> &PageSet {
        &self.set
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.set.pins.fetch_sub(1, Ordering::AcqRel);
    }
}
