//! # lstore
//!
//! A single-node columnar storage engine with log-structured updates:
//! - Records are never overwritten; every update appends a tail version
//! - Per-record indirection chains give reads "as of N updates ago"
//! - Background merges fold tail versions back into base pages
//! - Per-column range indexes for point and range lookups
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Table                               │
//! │     insert / select / update / delete / sum / increment      │
//! └──────┬───────────────────┬──────────────────────┬───────────┘
//!        │                   │                      │
//!        ▼                   ▼                      ▼
//! ┌─────────────┐    ┌───────────────┐      ┌──────────────┐
//! │    Index    │    │    Version    │      │    Merge     │
//! │  (BTreeMap  │    │ chain walk +  │      │  scheduler + │
//! │  per column)│    │ chain splicer │      │   workers    │
//! └─────────────┘    └───────┬───────┘      └──────┬───────┘
//!                            │                     │
//!                            ▼                     ▼
//!                    ┌─────────────────────────────────────┐
//!                    │     Record Directory / Page Stacks   │
//!                    │  RID = stack_index * 512 + slot      │
//!                    └──────────────────┬──────────────────┘
//!                                       │
//!                                       ▼
//!                    ┌─────────────────────────────────────┐
//!                    │   Page Sets (one 4096-byte page per  │
//!                    │   attribute, lazily loaded, pinned)  │
//!                    └─────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod page;
pub mod schema;
pub mod storage;
pub mod index;
pub mod version;
pub mod merge;
pub mod table;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{LstoreError, Result};
pub use config::Config;
pub use page::{Value, ValueType};
pub use schema::Schema;
pub use storage::Location;
pub use table::{Record, Table, TableStats};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of lstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
