//! Page set header
//!
//! Must be read before any column of a page set can be decoded, because the
//! type tags decide integer vs. text vs. boolean decoding.
//!
//! ## Format (one 4096-byte region of `info.bin`, flat 8-byte slots)
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ slot 0: Magic "LSPG" (4) | CRC32 (4)          │
//! │ slot 1: initialized flag                      │
//! │ slot 2: record count                          │
//! │ slot 3: column count N                        │
//! │ slots 4 .. 4+N: value type tag per column     │
//! │ slots 4+N .. 4+2N: high-water mark per column │
//! └───────────────────────────────────────────────┘
//! CRC covers slots 1 .. 4+2N.
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{LstoreError, Result};

use super::{Rid, ValueType, MAX_COLUMNS, PAGE_SIZE, SLOT_LIMIT, SLOT_SIZE};

/// Magic bytes identifying a page set header
const MAGIC: &[u8; 4] = b"LSPG";

/// Decoded page set header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHeader {
    pub initialized: bool,
    pub num_records: usize,
    pub column_types: Vec<ValueType>,
    /// Newest tail RID folded into each column (`NONE_RID` if never merged)
    pub tps: Vec<Rid>,
}

impl PageHeader {
    /// Encode into a full page region
    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(PAGE_SIZE);
        body.put_u64_le(self.initialized as u64);
        body.put_u64_le(self.num_records as u64);
        body.put_u64_le(self.column_types.len() as u64);
        for ty in &self.column_types {
            body.put_u64_le(ty.tag());
        }
        for tps in &self.tps {
            body.put_u64_le(*tps);
        }

        let crc = crc32fast::hash(&body);

        let mut out = BytesMut::with_capacity(PAGE_SIZE);
        out.put_slice(MAGIC);
        out.put_u32_le(crc);
        out.put_slice(&body);
        out.resize(PAGE_SIZE, 0);
        out.to_vec()
    }

    /// Decode a page region; any inconsistency is a corrupt page
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 * SLOT_SIZE {
            return Err(LstoreError::CorruptPage(format!(
                "header is {} bytes",
                bytes.len()
            )));
        }
        if &bytes[0..4] != MAGIC {
            return Err(LstoreError::CorruptPage(format!(
                "invalid header magic: {:?}",
                &bytes[0..4]
            )));
        }

        let mut buf = &bytes[4..];
        let stored_crc = buf.get_u32_le();

        let column_count = u64::from_le_bytes(
            bytes[3 * SLOT_SIZE..4 * SLOT_SIZE]
                .try_into()
                .map_err(|_| LstoreError::CorruptPage("truncated header".to_string()))?,
        ) as usize;
        if column_count > MAX_COLUMNS {
            return Err(LstoreError::CorruptPage(format!(
                "header declares {column_count} columns"
            )));
        }

        let body_len = (3 + 2 * column_count) * SLOT_SIZE;
        if bytes.len() < SLOT_SIZE + body_len {
            return Err(LstoreError::CorruptPage("truncated header".to_string()));
        }
        let body = &bytes[SLOT_SIZE..SLOT_SIZE + body_len];
        let crc = crc32fast::hash(body);
        if crc != stored_crc {
            return Err(LstoreError::CorruptPage(format!(
                "header checksum mismatch: stored {stored_crc:#010x}, computed {crc:#010x}"
            )));
        }

        let mut body = body;
        let initialized = body.get_u64_le() != 0;
        let num_records = body.get_u64_le() as usize;
        let _ = body.get_u64_le();
        if num_records > SLOT_LIMIT {
            return Err(LstoreError::CorruptPage(format!(
                "header declares {num_records} records"
            )));
        }

        let mut column_types = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let tag = body.get_u64_le();
            let ty = ValueType::from_tag(tag).ok_or_else(|| {
                LstoreError::CorruptPage(format!("unknown value type tag {tag}"))
            })?;
            column_types.push(ty);
        }
        let tps = (0..column_count).map(|_| body.get_u64_le()).collect();

        Ok(Self {
            initialized,
            num_records,
            column_types,
            tps,
        })
    }
}
