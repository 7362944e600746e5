//! Table Module
//!
//! The public operation surface: one table owning its record directory,
//! chain splicer, range indexes and merge workers.
//!
//! ## Responsibilities
//! - Insert, select (any version), range select, update, delete, sum
//! - Keep the range indexes in step with the newest values
//! - Count updates per stack and queue merges
//! - Keep the number of resident page sets under the configured limit
//! - Persist the catalog on flush / close and reopen from it
//!
//! ## Lock Order
//! ```text
//! insert:          expansion ─▶ index(write)
//! update / delete: splice ticket ─▶ index ─▶ tail allocation
//! merge:           stack merge lock ─▶ splice quiesce ─▶ expansion
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::Config;
use crate::error::{LstoreError, Result};
use crate::index::{ColumnIndex, Index};
use crate::merge::{merge_stack, MergeReport, MergeScheduler};
use crate::page::{PageId, Rid, Value, ValueType};
use crate::schema::Schema;
use crate::storage::{Location, PageStack, RecordAddress, RecordDirectory, TableCatalog};
use crate::version::{self, ChainSplicer};

/// Writes between two residency checks
const EVICTION_INTERVAL: u64 = 64;

/// One version of a record as returned by reads
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Base record location
    pub location: Location,
    /// RID of the version the columns were read from
    pub rid: Rid,
    /// Wanted columns; unwanted ones are `None`
    pub columns: Vec<Option<Value>>,
}

impl Record {
    pub fn value(&self, column: usize) -> Option<&Value> {
        self.columns.get(column).and_then(Option::as_ref)
    }
}

/// Point-in-time counters for a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStats {
    pub name: String,
    pub num_columns: usize,
    pub key_column: usize,
    pub stacks: usize,
    pub tail_page_sets: usize,
    pub live_records: usize,
    pub resident_page_sets: usize,
    pub indexed_columns: Vec<usize>,
    pub pending_merges: usize,
}

/// A table of fixed-width columns with log-structured updates
///
/// ## Concurrency Model
/// - Inserts serialize on the directory's expansion lock
/// - Updates and deletes of one record serialize through the chain splicer;
///   different records proceed in parallel
/// - Reads take no table-wide lock beyond a shared index read
/// - Merges run on background workers alongside reads and writes
pub struct Table {
    name: String,
    dir: PathBuf,
    config: Config,
    schema: Schema,
    directory: Arc<RecordDirectory>,
    splicer: Arc<ChainSplicer>,
    index: RwLock<Index>,
    merges: MergeScheduler,
    writes: AtomicU64,
    closed: AtomicBool,
}

/// Index lock held across a tail write
enum IndexGuard<'a> {
    Shared(RwLockReadGuard<'a, Index>),
    Exclusive(RwLockWriteGuard<'a, Index>),
}

impl IndexGuard<'_> {
    fn index(&self) -> &Index {
        match self {
            IndexGuard::Shared(guard) => &**guard,
            IndexGuard::Exclusive(guard) => &**guard,
        }
    }
}

impl Table {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a table under `config.data_dir/name`, replacing any table of
    /// the same name
    pub fn create(name: &str, schema: Schema, config: Config) -> Result<Self> {
        config.validate()?;
        check_name(name)?;

        let dir = config.data_dir.join(name);
        if dir.exists() {
            tracing::info!(table = name, "replacing existing table");
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        let column_types: Arc<[ValueType]> = schema.column_types().into();
        let directory = RecordDirectory::create(&dir, column_types, config.sync_on_flush);

        let mut index = Index::new(schema.num_columns());
        index.install(schema.key_column(), ColumnIndex::new());

        let table = Self::assemble(name, dir, config, schema, directory, index);
        table.save_catalog()?;
        tracing::info!(
            table = name,
            columns = table.schema.num_columns(),
            key_column = table.schema.key_column(),
            "created table"
        );
        Ok(table)
    }

    /// Reopen a table from its catalog
    pub fn open(name: &str, config: Config) -> Result<Self> {
        config.validate()?;
        check_name(name)?;

        let dir = config.data_dir.join(name);
        if !TableCatalog::exists(&dir) {
            return Err(LstoreError::TableNotFound(name.to_string()));
        }
        let catalog = TableCatalog::load(&dir)?;
        if catalog.name != name {
            return Err(LstoreError::Catalog(format!(
                "catalog in {} belongs to table {}",
                dir.display(),
                catalog.name
            )));
        }

        let schema = catalog.schema.clone();
        let column_types: Arc<[ValueType]> = schema.column_types().into();
        let directory =
            RecordDirectory::open(&dir, column_types, config.sync_on_flush, &catalog.stacks)?;
        let index = Index::from_snapshots(schema.num_columns(), &catalog.indices);

        let table = Self::assemble(name, dir, config, schema, directory, index);
        let key_column = table.schema.key_column();
        if !table.index.read().has_index(key_column) {
            tracing::warn!(table = name, "key index missing from catalog, rebuilding");
            let rebuilt = table.build_index(key_column)?;
            table.index.write().install(key_column, rebuilt);
        }

        tracing::info!(
            table = name,
            stacks = table.directory.stack_count(),
            "opened table"
        );
        Ok(table)
    }

    /// Delete a table's files. Returns false if it did not exist.
    pub fn drop_table(name: &str, config: &Config) -> Result<bool> {
        check_name(name)?;
        let dir = config.data_dir.join(name);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        tracing::info!(table = name, "dropped table");
        Ok(true)
    }

    fn assemble(
        name: &str,
        dir: PathBuf,
        config: Config,
        schema: Schema,
        directory: RecordDirectory,
        index: Index,
    ) -> Self {
        let directory = Arc::new(directory);
        let splicer = Arc::new(ChainSplicer::new());
        let merges = MergeScheduler::start(
            Arc::clone(&directory),
            Arc::clone(&splicer),
            config.merge_workers,
        );
        Self {
            name: name.to_string(),
            dir,
            config,
            schema,
            directory,
            splicer,
            index: RwLock::new(index),
            merges,
            writes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Write every dirty page set and the catalog
    pub fn flush(&self) -> Result<()> {
        let written = self.directory.flush_all()?;
        self.save_catalog()?;
        tracing::debug!(table = %self.name, written, "flushed table");
        Ok(())
    }

    /// Finish queued merges, stop the workers and flush. Later calls are
    /// no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.merges.wait_idle();
        self.merges.shutdown();
        self.flush()?;
        tracing::info!(table = %self.name, "closed table");
        Ok(())
    }

    fn save_catalog(&self) -> Result<()> {
        let catalog = TableCatalog {
            name: self.name.clone(),
            schema: self.schema.clone(),
            stacks: self.directory.metas(),
            indices: self.index.read().snapshots(),
        };
        catalog.save(&self.dir, self.config.sync_on_flush)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn directory(&self) -> &RecordDirectory {
        &self.directory
    }

    pub fn stack(&self, page_id: PageId) -> Result<Arc<PageStack>> {
        self.directory.stack(page_id)
    }

    /// High-water marks of a stack's base page set
    pub fn tps(&self, page_id: PageId) -> Result<Vec<Rid>> {
        Ok(self.directory.stack(page_id)?.base().tps())
    }

    /// RID holding the version `relative_version` of the record at
    /// `location`, reading every column
    pub fn resolve_version(&self, location: Location, relative_version: i64) -> Result<Rid> {
        let stack = self.directory.stack(location.page_id)?;
        let wanted = vec![true; self.schema.num_columns()];
        version::resolve_version(&stack, location.rid, relative_version, &wanted)
    }

    /// Base location of the live record with `key`
    pub fn locate_key(&self, key: &Value) -> Result<Option<Location>> {
        let index = self.index.read();
        self.live_key(&index, key)
    }

    pub fn has_index(&self, column: usize) -> bool {
        self.index.read().has_index(column)
    }

    pub fn stats(&self) -> Result<TableStats> {
        let stacks = self.directory.stacks();
        let mut live_records = 0;
        for stack in &stacks {
            let base = stack.base();
            for slot in 0..base.len() {
                if !base.is_deleted(slot)? {
                    live_records += 1;
                }
            }
        }
        Ok(TableStats {
            name: self.name.clone(),
            num_columns: self.schema.num_columns(),
            key_column: self.schema.key_column(),
            stacks: stacks.len(),
            tail_page_sets: stacks.iter().map(|s| s.tail_count()).sum(),
            live_records,
            resident_page_sets: self.directory.resident_count(),
            indexed_columns: self.index.read().indexed_columns(),
            pending_merges: self.merges.outstanding(),
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert a full row. Returns false if a live record already has the key.
    pub fn insert(&self, values: Vec<Value>) -> Result<bool> {
        self.schema.check_row(&values)?;
        let key = &values[self.schema.key_column()];

        let location = {
            let expansion = self.directory.lock_expansion();
            let mut index = self.index.write();
            if self.live_key(&index, key)?.is_some() {
                tracing::trace!(table = %self.name, %key, "duplicate key");
                return Ok(false);
            }
            let location = self.directory.append_base(&expansion, &values)?;
            index.insert_row(&values, location);
            location
        };

        tracing::trace!(table = %self.name, page_id = location.page_id, rid = location.rid, "inserted");
        self.after_write()?;
        Ok(true)
    }

    /// Overwrite the columns given as `Some`. Returns false if no live record
    /// has `key`, or if the key column would collide with another record.
    pub fn update(&self, key: &Value, values: Vec<Option<Value>>) -> Result<bool> {
        if values.len() != self.schema.num_columns() {
            return Err(LstoreError::InvalidValue(format!(
                "expected {} columns, got {}",
                self.schema.num_columns(),
                values.len()
            )));
        }
        for (value, ty) in values.iter().zip(self.schema.column_types()) {
            if let Some(value) = value {
                value.check(*ty)?;
            }
        }
        if matches!(&values[self.schema.key_column()], Some(Value::Null)) {
            return Err(LstoreError::InvalidValue("key column cannot be NULL".to_string()));
        }

        self.modify(key, |row| {
            Ok(Some(
                row.iter()
                    .zip(&values)
                    .map(|(old, new)| new.clone().unwrap_or_else(|| old.clone()))
                    .collect(),
            ))
        })
    }

    /// Add one to an integer column. Returns false if no live record has
    /// `key` or the current value is NULL.
    pub fn increment(&self, key: &Value, column: usize) -> Result<bool> {
        self.schema.check_column(column)?;
        if self.schema.column_types()[column] != ValueType::Int {
            return Err(LstoreError::InvalidValue(format!(
                "column {} is {}, not int",
                column,
                self.schema.column_types()[column]
            )));
        }

        self.modify(key, |row| {
            let Some(current) = row[column].as_int() else {
                return Ok(None);
            };
            let next = current
                .checked_add(1)
                .ok_or_else(|| LstoreError::InvalidValue(format!("{} + 1 overflows", current)))?;
            let mut row = row.to_vec();
            row[column] = Value::Int(next);
            Ok(Some(row))
        })
    }

    /// Logically delete the record with `key`: its base record and every
    /// tail version are tombstoned. Returns false if no live record has it.
    pub fn delete(&self, key: &Value) -> Result<bool> {
        let Some(location) = self.locate_key(key)? else {
            return Ok(false);
        };
        let stack = self.directory.stack(location.page_id)?;
        let slot = location.rid as usize;

        let ticket = self
            .splicer
            .begin(location.page_id, location.rid, || stack.base().indirection_at(slot))?;
        let base = stack.base();
        if base.is_deleted(slot)? {
            return Ok(false);
        }
        base.mark_deleted(slot)?;
        for rid in version::chain(&stack, location.rid)? {
            let address = RecordAddress::from_rid(location.page_id, rid);
            self.directory.page_set(&address)?.mark_deleted(address.slot)?;
        }
        drop(ticket);

        tracing::trace!(table = %self.name, %key, "deleted");
        self.after_write()?;
        Ok(true)
    }

    /// Read-modify-write of the newest version of the record with `key`.
    /// `f` gets the newest full row and returns the new one, or `None` to
    /// leave the record alone.
    fn modify<F>(&self, key: &Value, f: F) -> Result<bool>
    where
        F: FnOnce(&[Value]) -> Result<Option<Vec<Value>>>,
    {
        let Some(location) = self.locate_key(key)? else {
            return Ok(false);
        };
        let page_id = location.page_id;
        let stack = self.directory.stack(page_id)?;
        let slot = location.rid as usize;

        // Step 1: Mark the newest version; concurrent writers of this record
        // wait here and then see our tail as the newest
        let ticket = self
            .splicer
            .begin(page_id, location.rid, || stack.base().indirection_at(slot))?;
        if stack.base().is_deleted(slot)? {
            return Ok(false);
        }

        // Step 2: Build the new row from the newest one
        let current = version::latest_row(&stack, location.rid)?;
        let Some(row) = f(&current)? else {
            return Ok(false);
        };
        if row.len() != current.len() {
            return Err(LstoreError::InvalidValue(format!(
                "expected {} values, got {}",
                current.len(),
                row.len()
            )));
        }
        let changed: Vec<usize> = (0..row.len()).filter(|&c| row[c] != current[c]).collect();

        // Step 3: Lock the index; exclusively if an indexed column changes
        let mut guard = IndexGuard::Shared(self.index.read());
        if changed.iter().any(|&c| guard.index().has_index(c)) {
            drop(guard);
            guard = IndexGuard::Exclusive(self.index.write());
        }

        let key_column = self.schema.key_column();
        if changed.contains(&key_column) {
            if let Some(other) = self.live_key(guard.index(), &row[key_column])? {
                if other != location {
                    tracing::trace!(table = %self.name, key = %row[key_column], "update collides with existing key");
                    return Ok(false);
                }
            }
        }

        // Step 4: Append the tail version and splice it in front of the chain
        let tail_rid = self
            .directory
            .append_tail(page_id, &row, ticket.latest())?;
        stack.base().set_indirection(slot, tail_rid)?;

        if let IndexGuard::Exclusive(index) = &mut guard {
            for &column in &changed {
                index.update_value(column, &current[column], &row[column], location);
            }
        }
        drop(guard);
        drop(ticket);

        tracing::trace!(table = %self.name, page_id, rid = location.rid, tail_rid, "updated");

        // Step 5: Count the update and queue a merge at the threshold
        if stack.record_update(self.config.merge_threshold) && self.config.background_merge {
            self.merges.schedule(page_id);
        }
        self.after_write()?;
        Ok(true)
    }

    fn after_write(&self) -> Result<()> {
        let writes = self.writes.fetch_add(1, Ordering::AcqRel) + 1;
        if writes % EVICTION_INTERVAL == 0 {
            self.directory.evict_to(self.config.page_cache_limit)?;
        }
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Records whose newest `column` value equals `value`, read at
    /// `relative_version` (0 = newest, -1 = one update back, ...)
    pub fn select(
        &self,
        value: &Value,
        column: usize,
        wanted: &[bool],
        relative_version: i64,
    ) -> Result<Vec<Record>> {
        self.schema.check_column(column)?;
        let located = self.index.read().locate(column, value);
        let locations = match located {
            Some(locations) => locations,
            None => self
                .scan_newest(column, |v| v == value)?
                .into_iter()
                .map(|(_, location)| location)
                .collect(),
        };
        self.read_records(locations, wanted, relative_version)
    }

    /// Records whose newest `column` value lies in `[begin, end]`, ordered
    /// by that value
    pub fn select_range(
        &self,
        begin: &Value,
        end: &Value,
        column: usize,
        wanted: &[bool],
        relative_version: i64,
    ) -> Result<Vec<Record>> {
        self.schema.check_column(column)?;
        let located = self.index.read().locate_range(column, begin, end);
        let locations = match located {
            Some(locations) => locations,
            None => {
                let mut matches = self.scan_newest(column, |v| begin <= v && v <= end)?;
                matches.sort();
                matches.into_iter().map(|(_, location)| location).collect()
            }
        };
        self.read_records(locations, wanted, relative_version)
    }

    /// Sum of integer column `value_column` over records whose `key_column`
    /// lies in `[begin, end]`, read at `relative_version`. `None` if no live
    /// record is in range or the column is not an integer column. NULLs are
    /// skipped.
    pub fn sum_range(
        &self,
        begin: &Value,
        end: &Value,
        key_column: usize,
        value_column: usize,
        relative_version: i64,
    ) -> Result<Option<i64>> {
        self.schema.check_column(value_column)?;
        if self.schema.column_types()[value_column] != ValueType::Int {
            return Ok(None);
        }
        let mut wanted = vec![false; self.schema.num_columns()];
        wanted[value_column] = true;

        let records = self.select_range(begin, end, key_column, &wanted, relative_version)?;
        if records.is_empty() {
            return Ok(None);
        }
        let mut sum: i64 = 0;
        for record in &records {
            if let Some(v) = record.value(value_column).and_then(Value::as_int) {
                sum = sum.checked_add(v).ok_or_else(|| {
                    LstoreError::InvalidValue(format!("sum over column {} overflows", value_column))
                })?;
            }
        }
        Ok(Some(sum))
    }

    fn read_records(
        &self,
        locations: Vec<Location>,
        wanted: &[bool],
        relative_version: i64,
    ) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(locations.len());
        for location in locations {
            if let Some(record) = self.read_record(location, wanted, relative_version)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// One version of a live record; `None` if it was deleted
    fn read_record(
        &self,
        location: Location,
        wanted: &[bool],
        relative_version: i64,
    ) -> Result<Option<Record>> {
        let stack = self.directory.stack(location.page_id)?;
        if !is_live(&stack, location.rid)? {
            return Ok(None);
        }
        let at = version::locate_version(&stack, location.rid, relative_version, wanted)?;
        let columns = version::read_version(&stack, at, wanted)?;
        Ok(Some(Record {
            location,
            rid: at.rid(),
            columns,
        }))
    }

    fn live_key(&self, index: &Index, key: &Value) -> Result<Option<Location>> {
        let key_column = self.schema.key_column();
        let candidates = match index.locate(key_column, key) {
            Some(locations) => locations,
            None => self
                .scan_newest(key_column, |v| v == key)?
                .into_iter()
                .map(|(_, location)| location)
                .collect(),
        };
        for location in candidates {
            let stack = self.directory.stack(location.page_id)?;
            if is_live(&stack, location.rid)? {
                return Ok(Some(location));
            }
        }
        Ok(None)
    }

    /// Newest `column` value of every live record accepted by `keep`
    fn scan_newest<F>(&self, column: usize, keep: F) -> Result<Vec<(Value, Location)>>
    where
        F: Fn(&Value) -> bool,
    {
        let mut wanted = vec![false; self.schema.num_columns()];
        wanted[column] = true;

        let mut out = Vec::new();
        for stack in self.directory.stacks() {
            let len = stack.base().len();
            for slot in 0..len {
                let rid = slot as Rid;
                if !is_live(&stack, rid)? {
                    continue;
                }
                let at = version::locate_version(&stack, rid, 0, &wanted)?;
                let value = version::read_version(&stack, at, &wanted)?
                    .swap_remove(column)
                    .unwrap_or(Value::Null);
                if keep(&value) {
                    out.push((value, Location::new(stack.page_id(), rid)));
                }
            }
        }
        Ok(out)
    }

    // =========================================================================
    // Indexes
    // =========================================================================

    /// Build a range index on `column` from the newest values. Returns false
    /// if the column is already indexed.
    pub fn create_index(&self, column: usize) -> Result<bool> {
        self.schema.check_column(column)?;
        let mut index = self.index.write();
        if index.has_index(column) {
            return Ok(false);
        }
        let built = self.build_index(column)?;
        tracing::debug!(table = %self.name, column, entries = built.entry_count(), "built index");
        index.install(column, built);
        Ok(true)
    }

    /// Remove the index on `column`. The key column's index cannot be
    /// dropped.
    pub fn drop_index(&self, column: usize) -> Result<bool> {
        self.schema.check_column(column)?;
        if column == self.schema.key_column() {
            return Err(LstoreError::Schema(
                "the key column index cannot be dropped".to_string(),
            ));
        }
        Ok(self.index.write().drop_index(column))
    }

    fn build_index(&self, column: usize) -> Result<ColumnIndex> {
        let mut built = ColumnIndex::new();
        for (value, location) in self.scan_newest(column, |_| true)? {
            built.insert(value, location);
        }
        Ok(built)
    }

    // =========================================================================
    // Merges
    // =========================================================================

    /// Merge one page stack now, on the calling thread
    pub fn merge(&self, page_id: PageId) -> Result<Option<MergeReport>> {
        merge_stack(&self.directory, &self.splicer, page_id)
    }

    /// Block until every queued background merge has finished
    pub fn wait_for_merges(&self) {
        self.merges.wait_idle();
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(table = %self.name, error = %e, "failed to close table");
        }
    }
}

fn is_live(stack: &PageStack, rid: Rid) -> Result<bool> {
    let base = stack.base();
    let slot = rid as usize;
    Ok(slot < base.len() && !base.is_deleted(slot)?)
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(LstoreError::Schema(format!("invalid table name: {:?}", name)));
    }
    Ok(())
}
