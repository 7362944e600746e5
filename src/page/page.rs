//! A single 4096-byte physical page of 8-byte slots.

use crate::error::{LstoreError, Result};

use super::{Rid, PAGE_SIZE, SLOT_LIMIT, SLOT_SIZE};

/// Fixed-size buffer holding one attribute for 512 records
#[derive(Clone)]
pub struct Page {
    data: Box<[u8]>,
}

impl Page {
    /// Create a zeroed page
    pub fn new() -> Self {
        Self {
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
        }
    }

    /// Wrap bytes read from disk; must be exactly one page
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(LstoreError::CorruptPage(format!(
                "page is {} bytes, expected {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }
        Ok(Self {
            data: bytes.into_boxed_slice(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn read_slot(&self, slot: usize) -> [u8; SLOT_SIZE] {
        debug_assert!(slot < SLOT_LIMIT);
        let offset = slot * SLOT_SIZE;
        let mut out = [0u8; SLOT_SIZE];
        out.copy_from_slice(&self.data[offset..offset + SLOT_SIZE]);
        out
    }

    pub fn write_slot(&mut self, slot: usize, bytes: [u8; SLOT_SIZE]) {
        debug_assert!(slot < SLOT_LIMIT);
        let offset = slot * SLOT_SIZE;
        self.data[offset..offset + SLOT_SIZE].copy_from_slice(&bytes);
    }

    /// Meta columns (rid, indirection) hold plain little-endian u64
    pub fn read_rid(&self, slot: usize) -> Rid {
        u64::from_le_bytes(self.read_slot(slot))
    }

    pub fn write_rid(&mut self, slot: usize, rid: Rid) {
        self.write_slot(slot, rid.to_le_bytes());
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").field("len", &self.data.len()).finish()
    }
}
