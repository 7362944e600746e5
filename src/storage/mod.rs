//! Storage Module
//!
//! Page stacks, the record directory and the table catalog.
//!
//! ## Responsibilities
//! - Group one base page set and its tail page sets under a page id
//! - Compute record addresses from RIDs (no per-record address table)
//! - Serialize stack creation and tail allocation
//! - Persist the catalog blob that lets a table reopen without a scan
//!
//! ## On-disk Layout
//! ```text
//! {data_dir}/{table}/
//!   ├── catalog.bin
//!   └── stack{page_id}/
//!         ├── info.bin          (page set headers)
//!         ├── rid.bin
//!         ├── indirection.bin
//!         ├── column{c}.bin
//!         └── origin_*.bin      (original base image, after first merge)
//!
//! each file: [stack index 0 | stack index 1 | ...], 4096 bytes per region
//! ```

mod catalog;
mod directory;
mod stack;

pub use catalog::{IndexSnapshot, StackMeta, TableCatalog};
pub use directory::{ExpansionGuard, Location, RecordAddress, RecordDirectory};
pub use stack::PageStack;
