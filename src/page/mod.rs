//! Page Module
//!
//! Physical storage for one partition's columns.
//!
//! ## Responsibilities
//! - Fixed-width 8-byte slot codec for integer, text and boolean values
//! - 4096-byte pages, one per attribute
//! - Page sets: the pages of one stack index plus header, loaded lazily per
//!   attribute and written back on flush
//! - Pinning so that pages in use are not evicted
//!
//! ## Page Set Layout
//! ```text
//! ┌────────────┬────────────────┬──────────┬─────┬──────────────┐
//! │ rid (4096) │ indirection    │ column 0 │ ... │ column N-1   │
//! │ 512 slots  │ (4096)         │ (4096)   │     │ (4096)       │
//! └────────────┴────────────────┴──────────┴─────┴──────────────┘
//!   slot i of every page belongs to the same record
//! ```

mod header;
#[allow(clippy::module_inception)]
mod page;
mod page_set;
mod value;

pub use header::PageHeader;
pub use page::Page;
pub use page_set::{PageFiles, PageSet, PageSetId, PinGuard};
pub use value::{Value, ValueType};

// =============================================================================
// Shared Constants
// =============================================================================

/// Size of one physical page in bytes
pub const PAGE_SIZE: usize = 4096;

/// Width of one slot in bytes
pub const SLOT_SIZE: usize = 8;

/// Slots per page; also the RID stride between stack indexes
pub const SLOT_LIMIT: usize = PAGE_SIZE / SLOT_SIZE;

/// Maximum number of user columns a table may declare
pub const MAX_COLUMNS: usize = 64;

/// Record identifier, scoped to one page stack
pub type Rid = u64;

/// Identifier of a page stack
pub type PageId = u64;

/// Indirection sentinel: no version in that direction
pub const NONE_RID: Rid = u64::MAX;

/// Stored in the `rid` meta column of a deleted record
pub const TOMBSTONE_RID: Rid = u64::MAX - 1;

/// Return whichever of two indirection values is newer, treating
/// `NONE_RID` as absent.
pub fn newer_rid(a: Rid, b: Rid) -> Rid {
    match (a, b) {
        (NONE_RID, other) | (other, NONE_RID) => other,
        (a, b) => a.max(b),
    }
}
