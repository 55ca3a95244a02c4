//! Error types for coverage recording
//!
//! Only table construction, host message decoding and the finalize step
//! return errors. Per-event problems are classified as
//! [`SkipReason`](crate::resolver::SkipReason) and counted instead.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while building a session or writing coverage
#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("Invalid module region {path}: {reason}")]
    InvalidRegion { path: String, reason: String },

    #[error("Module table holds {count} modules, block records can address at most 65536")]
    TooManyModules { count: usize },

    #[error("Module ids must be consecutive from 0: expected {expected}, found {found}")]
    NonSequentialId { expected: usize, found: usize },

    #[error("Invalid flavor tag: {0:?}")]
    InvalidFlavor(String),

    #[error("Invalid address literal: {0:?}")]
    InvalidAddress(String),

    #[error("Malformed coverage file: {0}")]
    Format(String),

    #[error("Failed to write coverage file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Collector thread panicked")]
    CollectorPanicked,

    #[error("Invalid host message: {0}")]
    Message(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for coverage operations
pub type Result<T> = std::result::Result<T, CoverageError>;
