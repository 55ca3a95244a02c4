//! DRCOV version 2 coverage files
//!
//! ```text
//! DRCOV VERSION: 2
//! DRCOV FLAVOR: <tag>
//! Module Table: version 2, count N
//! Columns: id, base, end, entry, checksum, timestamp, path
//! <id>, <base>, <end>, 0, 0, 0, <path>        (N lines, decimal addresses)
//! BB Table: M bbs
//! <M x 8-byte block records>
//! ```
//!
//! Writing goes through a temporary file in the destination directory that
//! is renamed over the target, so readers never observe a partial file.

use crate::block::{decode_records, BlockRecord, BLOCK_RECORD_SIZE};
use crate::coverage_set::CoverageSnapshot;
use crate::error::{CoverageError, Result};
use crate::module_table::ModuleTable;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Flavor tag written when none is configured
pub const DEFAULT_FLAVOR: &str = "frida";

const VERSION_LINE: &str = "DRCOV VERSION: 2";
const FLAVOR_PREFIX: &str = "DRCOV FLAVOR: ";
const MODULE_TABLE_PREFIX: &str = "Module Table: version 2, count ";
const COLUMNS_LINE: &str = "Columns: id, base, end, entry, checksum, timestamp, path";
const BB_TABLE_PREFIX: &str = "BB Table: ";
const BB_TABLE_SUFFIX: &str = " bbs";

/// Reject flavor tags that would break the line-oriented header
pub fn validate_flavor(flavor: &str) -> Result<()> {
    if flavor.is_empty() || flavor.contains(['\n', '\r']) {
        return Err(CoverageError::InvalidFlavor(flavor.to_string()));
    }
    Ok(())
}

/// Render the text header: version, flavor and module table
pub fn render_header(table: &ModuleTable, flavor: &str) -> Vec<u8> {
    let mut header = String::new();
    header.push_str(VERSION_LINE);
    header.push('\n');
    header.push_str(FLAVOR_PREFIX);
    header.push_str(flavor);
    header.push('\n');
    header.push_str(&format!("{}{}\n", MODULE_TABLE_PREFIX, table.len()));
    header.push_str(COLUMNS_LINE);
    header.push('\n');

    for m in table.modules() {
        header.push_str(&format!(
            "{}, {}, {}, 0, 0, 0, {}\n",
            m.id, m.base, m.end, m.path
        ));
    }

    header.into_bytes()
}

/// Render `BB Table: <count> bbs\n` followed by the raw records
pub fn render_block_section(snapshot: &CoverageSnapshot) -> Vec<u8> {
    let mut section = format!("{}{}{}\n", BB_TABLE_PREFIX, snapshot.len(), BB_TABLE_SUFFIX)
        .into_bytes();
    section.extend_from_slice(&snapshot.to_bytes());
    section
}

/// Render a complete coverage file
pub fn render(table: &ModuleTable, snapshot: &CoverageSnapshot, flavor: &str) -> Vec<u8> {
    let mut contents = render_header(table, flavor);
    contents.extend_from_slice(&render_block_section(snapshot));
    contents
}

/// Replace `path` with `contents` in one step
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let write_err = |source: std::io::Error| CoverageError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(contents).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// A module line read back from a coverage file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrcovModule {
    pub id: u16,
    pub base: u64,
    pub end: u64,
    pub path: String,
}

/// A parsed DRCOV version 2 file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageFile {
    pub flavor: String,
    pub modules: Vec<DrcovModule>,
    pub blocks: Vec<BlockRecord>,
}

impl CoverageFile {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read(path)?;
        parse(&contents)
    }

    /// Unique block count for each module id
    pub fn blocks_per_module(&self) -> Vec<usize> {
        let mut counts = vec![0; self.modules.len()];
        for block in &self.blocks {
            if let Some(count) = counts.get_mut(usize::from(block.module_id)) {
                *count += 1;
            }
        }
        counts
    }
}

struct Lines<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Lines<'a> {
    fn next_line(&mut self, what: &str) -> Result<&'a str> {
        let data = self.data;
        let rest = &data[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| format_err(format!("missing {} line", what)))?;
        self.pos += len + 1;
        std::str::from_utf8(&rest[..len])
            .map_err(|_| format_err(format!("{} line is not UTF-8", what)))
    }

    fn rest(&self) -> &'a [u8] {
        let data = self.data;
        &data[self.pos..]
    }
}

fn format_err(msg: impl Into<String>) -> CoverageError {
    CoverageError::Format(msg.into())
}

fn parse_count(line: &str, prefix: &str, suffix: &str, what: &str) -> Result<usize> {
    line.strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(suffix))
        .and_then(|count| count.trim().parse().ok())
        .ok_or_else(|| format_err(format!("bad {} line: {:?}", what, line)))
}

fn parse_module_line(line: &str, expected_id: usize) -> Result<DrcovModule> {
    let fields: Vec<&str> = line.splitn(7, ", ").collect();
    if fields.len() != 7 {
        return Err(format_err(format!("bad module line: {:?}", line)));
    }
    let number = |field: &str| -> Result<u64> {
        field
            .trim()
            .parse()
            .map_err(|_| format_err(format!("bad number {:?} in module line", field)))
    };

    let id = number(fields[0])?;
    if id != expected_id as u64 {
        return Err(format_err(format!(
            "module id {} out of order, expected {}",
            id, expected_id
        )));
    }
    Ok(DrcovModule {
        id: u16::try_from(id).map_err(|_| format_err("module id exceeds 16 bits"))?,
        base: number(fields[1])?,
        end: number(fields[2])?,
        path: fields[6].to_string(),
    })
}

/// Parse a DRCOV version 2 file
pub fn parse(data: &[u8]) -> Result<CoverageFile> {
    let mut lines = Lines { data, pos: 0 };

    if lines.next_line("version")? != VERSION_LINE {
        return Err(format_err("unsupported DRCOV version"));
    }
    let flavor = lines
        .next_line("flavor")?
        .strip_prefix(FLAVOR_PREFIX)
        .ok_or_else(|| format_err("bad flavor line"))?
        .to_string();

    let module_count = parse_count(
        lines.next_line("module table")?,
        MODULE_TABLE_PREFIX,
        "",
        "module table",
    )?;
    if lines.next_line("columns")? != COLUMNS_LINE {
        return Err(format_err("unsupported module table columns"));
    }

    let mut modules = Vec::with_capacity(module_count.min(crate::module_table::MAX_MODULES));
    for expected_id in 0..module_count {
        modules.push(parse_module_line(lines.next_line("module")?, expected_id)?);
    }

    let block_count = parse_count(
        lines.next_line("BB table")?,
        BB_TABLE_PREFIX,
        BB_TABLE_SUFFIX,
        "BB table",
    )?;

    let payload = lines.rest();
    if block_count.checked_mul(BLOCK_RECORD_SIZE) != Some(payload.len()) {
        return Err(format_err(format!(
            "BB table declares {} bbs but payload holds {} bytes",
            block_count,
            payload.len()
        )));
    }
    let (blocks, _) = decode_records(payload);

    Ok(CoverageFile {
        flavor,
        modules,
        blocks,
    })
}
