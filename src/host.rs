//! Instrumentation host boundary
//!
//! Decoders for what the host engine hands over: its live module list, raw
//! block events (binary pairs or text lines) and the module-map message that
//! carries the built table to the consumer before tracing starts.

use crate::error::{CoverageError, Result};
use crate::module_table::{HostModule, Module, ModuleTable};
use crate::resolver::BlockEvent;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

/// Size of one binary `(start, end)` event pair
pub const RAW_EVENT_SIZE: usize = 16;

/// Message type tag of the module-map message
pub const MODULE_MAP_TYPE: &str = "mmap";

/// Parse an address literal: `0x`-prefixed hex or decimal
pub fn parse_address(literal: &str) -> Result<u64> {
    let literal = literal.trim();
    let parsed = match literal
        .strip_prefix("0x")
        .or_else(|| literal.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => literal.parse::<u64>(),
    };
    parsed.map_err(|_| CoverageError::InvalidAddress(literal.to_string()))
}

/// Serde helper accepting an address as integer or string literal
pub fn deserialize_address<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Address {
        Int(u64),
        Str(String),
    }

    match Address::deserialize(deserializer)? {
        Address::Int(value) => Ok(value),
        Address::Str(literal) => parse_address(&literal).map_err(serde::de::Error::custom),
    }
}

fn serialize_hex<S>(value: &u64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&format!("{:#x}", value))
}

/// Load the host's module list from a JSON array
pub fn load_host_modules(path: &Path) -> Result<Vec<HostModule>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Parse one text event line: `start end` or `start,end`
///
/// Returns `Ok(None)` for blank lines and `#` comments.
pub fn parse_event_line(line: &str) -> Result<Option<BlockEvent>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut fields = line
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|f| !f.is_empty());

    match (fields.next(), fields.next(), fields.next()) {
        (Some(start), Some(end), None) => Ok(Some(BlockEvent::new(
            parse_address(start)?,
            parse_address(end)?,
        ))),
        _ => Err(CoverageError::InvalidAddress(line.to_string())),
    }
}

/// Decode binary events: little-endian `start:u64, end:u64` pairs
///
/// Returns the events and the number of trailing bytes that did not form a
/// complete pair.
pub fn decode_raw_pairs(payload: &[u8]) -> (Vec<BlockEvent>, usize) {
    let chunks = payload.chunks_exact(RAW_EVENT_SIZE);
    let remainder = chunks.remainder().len();
    let events = chunks
        .map(|chunk| {
            let (start, end) = chunk.split_at(8);
            let mut s = [0u8; 8];
            let mut e = [0u8; 8];
            s.copy_from_slice(start);
            e.copy_from_slice(end);
            BlockEvent::new(u64::from_le_bytes(s), u64::from_le_bytes(e))
        })
        .collect();
    (events, remainder)
}

/// Encode events in the binary pair format
pub fn encode_raw_pairs(events: &[BlockEvent]) -> Vec<u8> {
    let mut out = Vec::with_capacity(events.len() * RAW_EVENT_SIZE);
    for event in events {
        out.extend_from_slice(&event.start.to_le_bytes());
        out.extend_from_slice(&event.end.to_le_bytes());
    }
    out
}

/// One module entry of the module-map message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMapEntry {
    pub id: u16,
    #[serde(default)]
    pub name: String,
    pub path: String,
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_address")]
    pub base: u64,
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_address")]
    pub end: u64,
    #[serde(default)]
    pub size: u64,
}

/// `{"type": "mmap", "content": [...]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMapMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Vec<ModuleMapEntry>,
}

impl ModuleMapMessage {
    pub fn from_table(table: &ModuleTable) -> Self {
        let content = table
            .modules()
            .iter()
            .map(|m| ModuleMapEntry {
                id: m.id,
                name: m.name.clone(),
                path: m.path.clone(),
                base: m.base,
                end: m.end,
                size: m.size(),
            })
            .collect();
        Self {
            kind: MODULE_MAP_TYPE.to_string(),
            content,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let message: Self = serde_json::from_str(json)?;
        if message.kind != MODULE_MAP_TYPE {
            return Err(CoverageError::Format(format!(
                "expected message type {:?}, found {:?}",
                MODULE_MAP_TYPE, message.kind
            )));
        }
        Ok(message)
    }

    /// Rebuild the module table carried by this message
    pub fn into_table(self) -> Result<ModuleTable> {
        let modules = self
            .content
            .into_iter()
            .map(|entry| Module {
                id: entry.id,
                name: entry.name,
                base: entry.base,
                end: entry.end,
                path: entry.path,
            })
            .collect();
        ModuleTable::from_modules(modules)
    }
}
