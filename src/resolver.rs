//! Block resolution: raw `(start, end)` pairs to module-relative records
//!
//! Resolution is pure and reads only the immutable module table, so any
//! number of producer threads may call [`resolve`] concurrently.
//!
//! Blocks that cannot be represented are dropped rather than truncated:
//! a truncated size or offset would point coverage tools at the wrong code.

use crate::block::BlockRecord;
use crate::module_table::ModuleTable;
use serde::{Deserialize, Serialize};

/// One executed block as reported by the host engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub start: u64,
    /// One past the last byte of the block
    pub end: u64,
}

impl BlockEvent {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }
}

/// Why an event did not produce a block record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Start address lies outside every tracked module
    Unresolved,
    /// Block length does not fit the 16-bit size field
    Oversized { size: u64 },
    /// Offset from the module base does not fit the 32-bit offset field
    OffsetOverflow { offset: u64 },
    /// `end <= start`, or the event could not be decoded
    Malformed,
}

/// Outcome of resolving one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Covered(BlockRecord),
    Skipped(SkipReason),
}

/// Resolve a raw block against the module table
pub fn resolve(event: BlockEvent, table: &ModuleTable) -> Resolution {
    if event.end <= event.start {
        return Resolution::Skipped(SkipReason::Malformed);
    }

    let module = match table.lookup(event.start) {
        Some(module) => module,
        None => return Resolution::Skipped(SkipReason::Unresolved),
    };

    let size = event.end - event.start;
    let size = match u16::try_from(size) {
        Ok(size) => size,
        Err(_) => return Resolution::Skipped(SkipReason::Oversized { size }),
    };

    let offset = event.start - module.base;
    let offset = match u32::try_from(offset) {
        Ok(offset) => offset,
        Err(_) => return Resolution::Skipped(SkipReason::OffsetOverflow { offset }),
    };

    Resolution::Covered(BlockRecord::new(module.id, offset, size))
}
