//! Fixed-size basic block records
//!
//! Every covered block is stored as the DRCOV `bb_entry_t` layout:
//!
//! ```text
//! ┌──────────────┬──────────┬─────────────┐
//! │ offset (u32) │ size(u16)│ module (u16)│   little-endian, 8 bytes
//! └──────────────┴──────────┴─────────────┘
//! ```
//!
//! The 8-byte encoding is also the identity used for deduplication.

use serde::{Deserialize, Serialize};

/// Size of one encoded block record in bytes
pub const BLOCK_RECORD_SIZE: usize = 8;

/// Canonical encoding of a [`BlockRecord`]
pub type EncodedBlock = [u8; BLOCK_RECORD_SIZE];

/// A module-relative basic block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Block start minus the owning module's base
    pub offset: u32,
    /// Block length in bytes
    pub size: u16,
    /// Index into the module table
    pub module_id: u16,
}

impl BlockRecord {
    pub fn new(module_id: u16, offset: u32, size: u16) -> Self {
        Self {
            offset,
            size,
            module_id,
        }
    }

    /// Encode as `offset(4) | size(2) | module_id(2)`, little-endian
    pub fn to_bytes(&self) -> EncodedBlock {
        let mut out = [0u8; BLOCK_RECORD_SIZE];
        out[0..4].copy_from_slice(&self.offset.to_le_bytes());
        out[4..6].copy_from_slice(&self.size.to_le_bytes());
        out[6..8].copy_from_slice(&self.module_id.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &EncodedBlock) -> Self {
        Self {
            offset: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            size: u16::from_le_bytes([bytes[4], bytes[5]]),
            module_id: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Ordering key used for stable snapshots
    pub(crate) fn sort_key(&self) -> (u16, u32, u16) {
        (self.module_id, self.offset, self.size)
    }
}

/// Split a payload of concatenated records into blocks
///
/// Returns the decoded records and the number of trailing bytes that did not
/// form a complete record.
pub fn decode_records(payload: &[u8]) -> (Vec<BlockRecord>, usize) {
    let chunks = payload.chunks_exact(BLOCK_RECORD_SIZE);
    let remainder = chunks.remainder().len();
    let records = chunks
        .map(|chunk| {
            let mut bytes = [0u8; BLOCK_RECORD_SIZE];
            bytes.copy_from_slice(chunk);
            BlockRecord::from_bytes(&bytes)
        })
        .collect();
    (records, remainder)
}
