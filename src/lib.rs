//! Blockcov - basic block coverage recording in DRCOV format
//!
//! This library turns the raw `(start, end)` block events emitted by a
//! dynamic instrumentation engine into a deduplicated, module-relative
//! coverage set, and serializes it as a DRCOV version 2 file that coverage
//! visualization tools can load.

pub mod block;
pub mod cli;
pub mod collector;
pub mod config;
pub mod coverage_set;
pub mod drcov;
pub mod error;
pub mod host;
pub mod module_table;
pub mod resolver;
pub mod session;
