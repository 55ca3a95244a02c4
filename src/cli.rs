//! CLI argument parsing for blockcov

use crate::host::parse_address;
use crate::module_table::CustomRegion;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "blockcov")]
#[command(version)]
#[command(about = "Basic block coverage recorder producing DRCOV files", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build a module table, collect block events and write a DRCOV file
    Record(RecordArgs),
    /// Summarize an existing DRCOV file
    Info(InfoArgs),
}

#[derive(Args, Debug)]
pub struct RecordArgs {
    /// TOML session configuration
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host module list (JSON array of {name, base, size, path})
    #[arg(short, long, value_name = "FILE", conflicts_with = "module_map")]
    pub modules: Option<PathBuf>,

    /// Prebuilt module-map message (JSON {"type": "mmap", ...})
    #[arg(long, value_name = "FILE")]
    pub module_map: Option<PathBuf>,

    /// Module name to track (repeatable; "all" tracks every module)
    #[arg(short, long = "whitelist", value_name = "NAME")]
    pub whitelist: Vec<String>,

    /// Custom region as BASE:SIZE:PATH (repeatable)
    #[arg(long = "custom", value_name = "BASE:SIZE:PATH", value_parser = parse_custom_region)]
    pub custom: Vec<CustomRegion>,

    /// Text events, one "start end" pair per line (repeatable)
    #[arg(short, long = "events", value_name = "FILE")]
    pub events: Vec<PathBuf>,

    /// Binary events, little-endian u64 start/end pairs (repeatable)
    #[arg(long = "raw-events", value_name = "FILE")]
    pub raw_events: Vec<PathBuf>,

    /// Pre-encoded 8-byte block records (repeatable)
    #[arg(short, long = "blocks", value_name = "FILE")]
    pub blocks: Vec<PathBuf>,

    /// Flavor tag for the DRCOV header
    #[arg(long, value_name = "TAG")]
    pub flavor: Option<String>,

    /// Output coverage file
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Also write the module-map message for the built table
    #[arg(long, value_name = "FILE")]
    pub emit_module_map: Option<PathBuf>,

    /// Bound the producer channel to this many batches
    #[arg(long, value_name = "BATCHES")]
    pub channel_capacity: Option<usize>,

    /// Summary format
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// DRCOV file to read
    pub file: PathBuf,

    /// Print every block record
    #[arg(long)]
    pub dump: bool,

    /// Summary format
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,
}

/// Parse `BASE:SIZE:PATH`; the path may itself contain colons
pub fn parse_custom_region(spec: &str) -> Result<CustomRegion, String> {
    let mut parts = spec.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(base), Some(size), Some(path)) if !path.is_empty() => {
            let base = parse_address(base).map_err(|e| e.to_string())?;
            let size = parse_address(size).map_err(|e| e.to_string())?;
            Ok(CustomRegion::new(base, size, path))
        }
        _ => Err(format!("expected BASE:SIZE:PATH, got {:?}", spec)),
    }
}
