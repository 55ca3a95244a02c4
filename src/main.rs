use anyhow::{Context, Result};
use blockcov::block::{BlockRecord, BLOCK_RECORD_SIZE};
use blockcov::cli::{Cli, Command, InfoArgs, OutputFormat, RecordArgs};
use blockcov::collector::{Collector, Delivery, EventSender, FeedOutcome};
use blockcov::config::SessionConfig;
use blockcov::drcov::CoverageFile;
use blockcov::host::{self, ModuleMapMessage, RAW_EVENT_SIZE};
use blockcov::module_table::ModuleTable;
use blockcov::session::{CoverageSession, FinalizeReport, SessionStats};
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Records per batch for binary inputs
const BINARY_BATCH: usize = 8192;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Merge the config file with command line overrides
fn load_config(args: &RecordArgs) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };

    if let Some(flavor) = &args.flavor {
        config.flavor = flavor.clone();
    }
    if let Some(output) = &args.output {
        config.output = output.clone();
    }
    if !args.whitelist.is_empty() {
        config.whitelist = args.whitelist.clone();
    }
    config.custom.extend(args.custom.iter().cloned());
    Ok(config)
}

/// Build the module table from a module-map message or the host module list
fn build_table(args: &RecordArgs, config: &SessionConfig) -> Result<ModuleTable> {
    if let Some(map_path) = &args.module_map {
        if !config.custom.is_empty() {
            anyhow::bail!("Custom regions cannot be added to a prebuilt module map");
        }
        let json = std::fs::read_to_string(map_path)
            .with_context(|| format!("Failed to read module map {}", map_path.display()))?;
        return Ok(ModuleMapMessage::from_json(&json)?.into_table()?);
    }

    let host_modules = match &args.modules {
        Some(path) => host::load_host_modules(path)
            .with_context(|| format!("Failed to load host modules {}", path.display()))?,
        None => Vec::new(),
    };
    Ok(ModuleTable::build(
        &host_modules,
        &config.whitelist(),
        &config.custom,
    )?)
}

/// Producer for a text event file
fn feed_text_events(path: &Path, sender: &EventSender) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open events {}", path.display()))?;
    let outcome = sender
        .feed_lines(std::io::BufReader::new(file))
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if outcome == FeedOutcome::Disconnected {
        anyhow::bail!("Collector stopped accepting events from {}", path.display());
    }
    Ok(())
}

/// Producer for a binary file, split into record-aligned batches
fn feed_binary(
    path: &Path,
    sender: &EventSender,
    unit: usize,
    wrap: fn(Vec<u8>) -> Delivery,
) -> Result<()> {
    let data =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    for chunk in data.chunks(unit * BINARY_BATCH) {
        if !sender.send(wrap(chunk.to_vec())) {
            anyhow::bail!("Collector stopped accepting events from {}", path.display());
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum InputKind {
    TextEvents,
    RawEvents,
    Blocks,
}

fn feed_input(kind: InputKind, path: &Path, sender: &EventSender) -> Result<()> {
    match kind {
        InputKind::TextEvents => feed_text_events(path, sender),
        InputKind::RawEvents => feed_binary(path, sender, RAW_EVENT_SIZE, Delivery::RawPairs),
        InputKind::Blocks => feed_binary(path, sender, BLOCK_RECORD_SIZE, Delivery::Encoded),
    }
}

/// Run one producer thread per input file against the collector
fn collect_inputs(args: &RecordArgs, collector: &Collector) -> Result<()> {
    let inputs: Vec<(InputKind, &PathBuf)> = args
        .events
        .iter()
        .map(|p| (InputKind::TextEvents, p))
        .chain(args.raw_events.iter().map(|p| (InputKind::RawEvents, p)))
        .chain(args.blocks.iter().map(|p| (InputKind::Blocks, p)))
        .collect();

    std::thread::scope(|scope| {
        let handles: Vec<_> = inputs
            .iter()
            .filter_map(|&(kind, path)| {
                let sender = collector.sender()?;
                Some(scope.spawn(move || feed_input(kind, path, &sender)))
            })
            .collect();

        handles.into_iter().try_for_each(|handle| {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("Producer thread panicked"))?
        })
    })
}

#[derive(Serialize)]
struct RecordSummary<'a> {
    report: &'a FinalizeReport,
    stats: &'a SessionStats,
}

fn print_record_summary(
    report: &FinalizeReport,
    stats: &SessionStats,
    format: OutputFormat,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&RecordSummary { report, stats })?;
            println!("{}", json);
        }
        OutputFormat::Text => {
            println!(
                "Wrote {} ({} modules, {} blocks, {} bytes)",
                report.path.display(),
                report.modules,
                report.blocks,
                report.bytes
            );
            println!(
                "events: {}  new: {}  duplicates: {}  unresolved: {}  oversized: {}  offset overflow: {}  malformed: {}",
                stats.events,
                stats.inserted,
                stats.duplicates,
                stats.unresolved,
                stats.oversized,
                stats.offset_overflow,
                stats.malformed
            );
        }
    }
    Ok(())
}

fn run_record(args: RecordArgs) -> Result<()> {
    let config = load_config(&args)?;
    let table = build_table(&args, &config)?;
    if table.is_empty() {
        tracing::warn!("Module table is empty, every block will be skipped");
    }

    if let Some(path) = &args.emit_module_map {
        let json = ModuleMapMessage::from_table(&table).to_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write module map {}", path.display()))?;
    }

    let session = CoverageSession::new(table).with_flavor(config.flavor.clone())?;
    let collector = Collector::spawn(Arc::new(session), args.channel_capacity);
    collect_inputs(&args, &collector)?;
    let session = collector.shutdown()?;

    let report = session.finalize(&config.output)?;
    print_record_summary(&report, &session.stats(), args.format)
}

#[derive(Serialize)]
struct ModuleSummary<'a> {
    id: u16,
    base: u64,
    end: u64,
    path: &'a str,
    blocks: usize,
}

#[derive(Serialize)]
struct InfoSummary<'a> {
    flavor: &'a str,
    modules: Vec<ModuleSummary<'a>>,
    blocks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    records: Option<&'a [BlockRecord]>,
}

fn run_info(args: InfoArgs) -> Result<()> {
    let file = CoverageFile::from_file(&args.file)
        .with_context(|| format!("Failed to read coverage file {}", args.file.display()))?;
    let per_module = file.blocks_per_module();

    match args.format {
        OutputFormat::Json => {
            let summary = InfoSummary {
                flavor: &file.flavor,
                modules: file
                    .modules
                    .iter()
                    .zip(&per_module)
                    .map(|(m, &blocks)| ModuleSummary {
                        id: m.id,
                        base: m.base,
                        end: m.end,
                        path: &m.path,
                        blocks,
                    })
                    .collect(),
                blocks: file.blocks.len(),
                records: args.dump.then_some(file.blocks.as_slice()),
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text => {
            println!("Flavor: {}", file.flavor);
            println!("Modules: {}", file.modules.len());
            println!("Blocks: {}", file.blocks.len());
            for (m, blocks) in file.modules.iter().zip(&per_module) {
                println!(
                    "  [{}] {:#x}-{:#x} {} ({} blocks)",
                    m.id, m.base, m.end, m.path, blocks
                );
            }
            if args.dump {
                for block in &file.blocks {
                    println!(
                        "{} {:#x} {} {}",
                        block.module_id,
                        block.offset,
                        block.size,
                        hex::encode(block.to_bytes())
                    );
                }
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        Command::Record(args) => run_record(args),
        Command::Info(args) => run_info(args),
    }
}
