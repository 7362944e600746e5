//! Table Catalog
//!
//! Small blob persisted on close and read on open so a table resumes
//! without rescanning.
//!
//! ## File Format
//! ```text
//! ┌───────────┬─────────────┬───────────┬─────────────┬──────────────────┐
//! │ Magic (4) │ Version (2) │ CRC32 (4) │ Length (8)  │ bincode payload  │
//! └───────────┴─────────────┴───────────┴─────────────┴──────────────────┘
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LstoreError, Result};
use crate::page::{PageId, Value};
use crate::schema::Schema;

use super::Location;

/// Magic bytes identifying a catalog file
const MAGIC: &[u8; 4] = b"LSCT";

/// Current catalog format version
const VERSION: u16 = 1;

/// Magic (4) + Version (2) + CRC (4) + Length (8)
const HEADER_SIZE: usize = 18;

/// Per-stack bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackMeta {
    pub page_id: PageId,
    pub tail_count: usize,
    /// Base records written (farthest slot + 1)
    pub farthest: usize,
    pub updates_since_merge: u64,
    /// Whether an original base image exists (stack merged at least once)
    pub has_origin: bool,
}

/// Contents of one prebuilt range index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub column: usize,
    pub entries: Vec<(Value, Vec<Location>)>,
}

/// Everything needed to reopen a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCatalog {
    pub name: String,
    pub schema: Schema,
    pub stacks: Vec<StackMeta>,
    pub indices: Vec<IndexSnapshot>,
}

impl TableCatalog {
    pub const FILENAME: &'static str = "catalog.bin";

    pub fn path(table_dir: &Path) -> PathBuf {
        table_dir.join(Self::FILENAME)
    }

    pub fn exists(table_dir: &Path) -> bool {
        Self::path(table_dir).is_file()
    }

    /// Number of allocated page stacks
    pub fn num_stacks(&self) -> usize {
        self.stacks.len()
    }

    /// Last written base position as (page id, slot)
    pub fn farthest(&self) -> Option<(PageId, usize)> {
        self.stacks
            .iter()
            .rev()
            .find(|s| s.farthest > 0)
            .map(|s| (s.page_id, s.farthest - 1))
    }

    /// Write atomically (temp file + rename)
    pub fn save(&self, table_dir: &Path, sync: bool) -> Result<()> {
        let payload = bincode::serialize(self)?;
        let crc = crc32fast::hash(&payload);

        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&payload);

        fs::create_dir_all(table_dir)?;
        let tmp = table_dir.join(format!("{}.tmp", Self::FILENAME));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            if sync {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, Self::path(table_dir))?;
        Ok(())
    }

    pub fn load(table_dir: &Path) -> Result<Self> {
        let bytes = fs::read(Self::path(table_dir))?;
        if bytes.len() < HEADER_SIZE {
            return Err(LstoreError::Catalog(format!(
                "catalog is {} bytes",
                bytes.len()
            )));
        }
        if &bytes[0..4] != MAGIC {
            return Err(LstoreError::Catalog(format!(
                "invalid catalog magic: {:?}",
                &bytes[0..4]
            )));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(LstoreError::Catalog(format!(
                "unsupported catalog version: {}",
                version
            )));
        }

        let crc = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[10..18]);
        let len = u64::from_le_bytes(len_bytes) as usize;

        let payload = bytes
            .get(HEADER_SIZE..HEADER_SIZE + len)
            .ok_or_else(|| LstoreError::Catalog("truncated catalog".to_string()))?;
        if crc32fast::hash(payload) != crc {
            return Err(LstoreError::Catalog("catalog checksum mismatch".to_string()));
        }

        Ok(bincode::deserialize(payload)?)
    }
}
