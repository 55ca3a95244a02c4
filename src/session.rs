//! Coverage session: one module table plus one coverage set
//!
//! A session is an explicitly owned object. Producers share it by reference
//! (or through an `Arc`) and call the `record_*` methods concurrently; the
//! module table is never mutated after construction, so only the coverage
//! set synchronizes. Per-event problems are counted, never returned.
//!
//! # Example
//!
//! ```
//! use blockcov::module_table::{HostModule, Whitelist};
//! use blockcov::resolver::BlockEvent;
//! use blockcov::session::CoverageSession;
//!
//! # fn main() -> blockcov::error::Result<()> {
//! let session = CoverageSession::start(
//!     &[HostModule::new("a.dll", 0x1000, 0x1000)],
//!     &Whitelist::All,
//!     &[],
//! )?;
//!
//! session.record(BlockEvent::new(0x1050, 0x1060));
//! session.record(BlockEvent::new(0x1050, 0x1060));
//! session.record(BlockEvent::new(0x5000, 0x5010));
//!
//! let stats = session.stats();
//! assert_eq!(stats.unique_blocks, 1);
//! assert_eq!(stats.duplicates, 1);
//! assert_eq!(stats.unresolved, 1);
//! # Ok(())
//! # }
//! ```

use crate::block::{decode_records, BlockRecord};
use crate::coverage_set::{CoverageSet, CoverageSnapshot};
use crate::drcov::{self, DEFAULT_FLAVOR};
use crate::error::Result;
use crate::host::decode_raw_pairs;
use crate::module_table::{CustomRegion, HostModule, ModuleTable, Whitelist};
use crate::resolver::{resolve, BlockEvent, Resolution, SkipReason};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct Counters {
    events: AtomicU64,
    inserted: AtomicU64,
    duplicates: AtomicU64,
    unresolved: AtomicU64,
    oversized: AtomicU64,
    offset_overflow: AtomicU64,
    malformed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Collection counters for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SessionStats {
    /// Events seen, including skipped ones
    pub events: u64,
    /// Events that added a new block
    pub inserted: u64,
    /// Events whose block was already covered
    pub duplicates: u64,
    pub unresolved: u64,
    pub oversized: u64,
    pub offset_overflow: u64,
    pub malformed: u64,
    /// Current size of the coverage set
    pub unique_blocks: u64,
}

impl SessionStats {
    /// Events dropped for any reason
    pub fn skipped(&self) -> u64 {
        self.unresolved + self.oversized + self.offset_overflow + self.malformed
    }
}

/// Summary of a successful finalize
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizeReport {
    pub path: PathBuf,
    pub modules: usize,
    pub blocks: usize,
    pub bytes: usize,
}

/// Live coverage state for one trace
#[derive(Debug)]
pub struct CoverageSession {
    table: ModuleTable,
    coverage: CoverageSet,
    flavor: String,
    counters: Counters,
}

impl CoverageSession {
    /// Create a session over an already built module table
    pub fn new(table: ModuleTable) -> Self {
        Self {
            table,
            coverage: CoverageSet::new(),
            flavor: DEFAULT_FLAVOR.to_string(),
            counters: Counters::default(),
        }
    }

    /// Enumerate modules once and open a session over them
    pub fn start(
        host_modules: &[HostModule],
        whitelist: &Whitelist,
        custom: &[CustomRegion],
    ) -> Result<Self> {
        Ok(Self::new(ModuleTable::build(host_modules, whitelist, custom)?))
    }

    /// Set the flavor tag written into the header
    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Result<Self> {
        let flavor = flavor.into();
        drcov::validate_flavor(&flavor)?;
        self.flavor = flavor;
        Ok(self)
    }

    /// Use a coverage set with a specific shard count
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.coverage = CoverageSet::with_shards(shards);
        self
    }

    pub fn table(&self) -> &ModuleTable {
        &self.table
    }

    pub fn coverage(&self) -> &CoverageSet {
        &self.coverage
    }

    pub fn flavor(&self) -> &str {
        &self.flavor
    }

    /// Resolve and record one raw block event
    pub fn record(&self, event: BlockEvent) -> Resolution {
        self.apply(event).0
    }

    /// Record a batch of events, returning how many added new blocks
    pub fn record_events(&self, events: &[BlockEvent]) -> usize {
        events.iter().filter(|&&event| self.apply(event).1).count()
    }

    fn apply(&self, event: BlockEvent) -> (Resolution, bool) {
        Counters::bump(&self.counters.events);
        let resolution = resolve(event, &self.table);
        let added = match resolution {
            Resolution::Covered(record) => self.insert(record),
            Resolution::Skipped(reason) => {
                self.note_skip(event, reason);
                false
            }
        };
        (resolution, added)
    }

    /// Record binary `(start, end)` pairs; a trailing partial pair is malformed
    pub fn record_raw_pairs(&self, payload: &[u8]) -> usize {
        let (events, remainder) = decode_raw_pairs(payload);
        if remainder != 0 {
            tracing::debug!(bytes = remainder, "Trailing partial event pair dropped");
            self.note_malformed();
        }
        self.record_events(&events)
    }

    /// Record a payload of already encoded 8-byte block records
    ///
    /// Records naming an unknown module or with a zero size are skipped.
    pub fn record_encoded(&self, payload: &[u8]) -> usize {
        let (records, remainder) = decode_records(payload);
        if remainder != 0 {
            tracing::debug!(bytes = remainder, "Trailing partial block record dropped");
            self.note_malformed();
        }

        tracing::debug!(blocks = records.len(), "Collecting encoded basic blocks");
        let mut added = 0;
        for record in records {
            Counters::bump(&self.counters.events);
            if self.table.get(record.module_id).is_none() {
                tracing::trace!(module_id = record.module_id, "Block names unknown module");
                Counters::bump(&self.counters.unresolved);
            } else if record.size == 0 {
                Counters::bump(&self.counters.malformed);
            } else if self.insert(record) {
                added += 1;
            }
        }
        added
    }

    /// Count an event that could not be decoded at all
    pub fn note_malformed(&self) {
        Counters::bump(&self.counters.events);
        Counters::bump(&self.counters.malformed);
    }

    fn insert(&self, record: BlockRecord) -> bool {
        let inserted = self.coverage.insert(record);
        if inserted {
            Counters::bump(&self.counters.inserted);
        } else {
            Counters::bump(&self.counters.duplicates);
        }
        inserted
    }

    fn note_skip(&self, event: BlockEvent, reason: SkipReason) {
        match reason {
            SkipReason::Unresolved => {
                tracing::trace!(
                    start = format_args!("{:#x}", event.start),
                    "Block outside tracked modules"
                );
                Counters::bump(&self.counters.unresolved);
            }
            SkipReason::Oversized { size } => {
                tracing::warn!(
                    start = format_args!("{:#x}", event.start),
                    size,
                    "Block too large for DRCOV size field, dropped"
                );
                Counters::bump(&self.counters.oversized);
            }
            SkipReason::OffsetOverflow { offset } => {
                tracing::warn!(
                    start = format_args!("{:#x}", event.start),
                    offset,
                    "Block offset too large for DRCOV offset field, dropped"
                );
                Counters::bump(&self.counters.offset_overflow);
            }
            SkipReason::Malformed => {
                tracing::debug!(start = event.start, end = event.end, "Malformed block event");
                Counters::bump(&self.counters.malformed);
            }
        }
    }

    pub fn stats(&self) -> SessionStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SessionStats {
            events: load(&self.counters.events),
            inserted: load(&self.counters.inserted),
            duplicates: load(&self.counters.duplicates),
            unresolved: load(&self.counters.unresolved),
            oversized: load(&self.counters.oversized),
            offset_overflow: load(&self.counters.offset_overflow),
            malformed: load(&self.counters.malformed),
            unique_blocks: self.coverage.len() as u64,
        }
    }

    pub fn snapshot(&self) -> CoverageSnapshot {
        self.coverage.snapshot()
    }

    /// Render the complete DRCOV file for the current coverage
    pub fn render(&self) -> Vec<u8> {
        drcov::render(&self.table, &self.snapshot(), &self.flavor)
    }

    /// Write the coverage file, replacing any existing file at `path`
    ///
    /// Call only once producers have quiesced. On failure the session keeps
    /// its data and finalize may be retried.
    pub fn finalize(&self, path: &Path) -> Result<FinalizeReport> {
        let snapshot = self.snapshot();
        let contents = drcov::render(&self.table, &snapshot, &self.flavor);
        drcov::write_atomic(path, &contents)?;

        let report = FinalizeReport {
            path: path.to_path_buf(),
            modules: self.table.len(),
            blocks: snapshot.len(),
            bytes: contents.len(),
        };
        tracing::info!(
            path = %path.display(),
            modules = report.modules,
            blocks = report.blocks,
            "Coverage file written"
        );
        Ok(report)
    }

    /// Begin an independent session over a freshly enumerated table
    pub fn reset(&mut self, table: ModuleTable) {
        self.table = table;
        self.coverage.clear();
        self.counters = Counters::default();
    }
}
