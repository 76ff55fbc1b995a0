//! CLI entrypoint for the BO cache harness.

use std::io::Write;
use std::path::{Path, PathBuf};

use bocache_core::config::debug_flags;
use bocache_harness::structured_log::{
    ArtifactIndex, LogEmitter, LogEntry, LogLevel, sha256_hex, validate_log_file,
};
use bocache_harness::{ChurnConfig, ChurnReport, HarnessError, Workload};
use clap::{Parser, Subcommand};

/// Workload and log tooling for the BO cache.
#[derive(Debug, Parser)]
#[command(name = "bocache-harness")]
#[command(about = "Workload driver and log tooling for the BO cache")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a seeded churn workload and report cache behavior.
    Churn {
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xB0CA_C4E0", value_parser = parse_seed)]
        seed: u64,
        /// Number of workload operations.
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Backend memory budget in MiB (0 = unlimited).
        #[arg(long, default_value_t = 0)]
        budget_mib: usize,
        /// Chance per create, out of 1000, of a shared BO.
        #[arg(long, default_value_t = 20)]
        shared_permille: u32,
        /// Advance the clock one second every N ops.
        #[arg(long, default_value_t = 250)]
        tick_every: usize,
        /// Structured JSONL lifecycle log output path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Report JSON output path (if omitted, prints to stdout).
        #[arg(long)]
        report: Option<PathBuf>,
        /// Artifact index JSON output path (hashes the log and report).
        #[arg(long)]
        artifact_index: Option<PathBuf>,
    },
    /// Run a churn workload, keep its BOs live and print the label report.
    Dump {
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xB0CA_C4E0", value_parser = parse_seed)]
        seed: u64,
        /// Number of workload operations.
        #[arg(long, default_value_t = 1_000)]
        ops: usize,
        /// Include the per-handle listing.
        #[arg(long)]
        verbose: bool,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        /// JSONL log path.
        #[arg(long)]
        log: PathBuf,
    },
}

fn parse_seed(raw: &str) -> Result<u64, String> {
    let cleaned = raw.trim().replace('_', "");
    let parsed = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse::<u64>(),
    };
    parsed.map_err(|err| format!("invalid seed '{raw}': {err}"))
}

struct ChurnArgs {
    seed: u64,
    ops: usize,
    budget_mib: usize,
    shared_permille: u32,
    tick_every: usize,
    log: Option<PathBuf>,
    report: Option<PathBuf>,
    artifact_index: Option<PathBuf>,
}

fn run_churn(args: ChurnArgs) -> Result<(), HarnessError> {
    let run_id = format!("churn-{:x}", args.seed);
    let mut workload = Workload::new(ChurnConfig {
        seed: args.seed,
        ops: args.ops,
        budget_bytes: (args.budget_mib != 0).then(|| args.budget_mib << 20),
        shared_permille: args.shared_permille,
        tick_every: args.tick_every,
        debug: debug_flags(),
        keep_logs: args.log.is_some(),
    });

    let mut emitter = match &args.log {
        Some(path) => Some(LogEmitter::to_file(path, &run_id)?),
        None => None,
    };
    if let Some(emitter) = emitter.as_mut() {
        emitter.emit_entry(
            LogEntry::new("", LogLevel::Info, "run_start")
                .with_op("churn")
                .with_details(serde_json::json!({
                    "seed": args.seed,
                    "ops": args.ops,
                    "budget_mib": args.budget_mib,
                    "shared_permille": args.shared_permille,
                    "tick_every": args.tick_every,
                })),
        )?;
    }

    for _ in 0..args.ops {
        workload.step()?;
        if let Some(emitter) = emitter.as_mut() {
            for record in workload.take_records() {
                emitter.emit_record(&record)?;
            }
        }
    }
    workload.release_all();

    let mut report = workload.report();
    if let Some(mut emitter) = emitter.take() {
        for record in workload.take_records() {
            emitter.emit_record(&record)?;
        }
        let stats = &report.final_stats;
        emitter.emit_entry(
            LogEntry::new("", LogLevel::Info, "run_end")
                .with_op("churn")
                .with_counters(stats.cached_bytes, report.hits, report.misses),
        )?;
        emitter.flush()?;
    }
    if let Some(path) = &args.log {
        report.log_sha256 = Some(sha256_hex(&std::fs::read(path)?));
    }

    write_report(&report, args.report.as_deref())?;
    eprintln!(
        "churn: {} ops, {} creates, {} hits, {} misses, {} ooms, {} evictions",
        report.ops, report.creates, report.hits, report.misses, report.ooms, report.evictions
    );

    if let Some(index_path) = &args.artifact_index {
        let mut index = ArtifactIndex::new(&run_id);
        if let Some(path) = &args.log {
            index.add_file(path, "log")?;
        }
        if let Some(path) = &args.report {
            index.add_file(path, "report")?;
        }
        std::fs::write(index_path, index.to_json()?)?;
    }
    Ok(())
}

fn write_report(report: &ChurnReport, path: Option<&Path>) -> Result<(), HarnessError> {
    let json = serde_json::to_string_pretty(report)?;
    match path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, json + "\n")?;
        }
        None => {
            let mut out = std::io::stdout().lock();
            writeln!(out, "{json}")?;
        }
    }
    Ok(())
}

fn run_dump(seed: u64, ops: usize, verbose: bool) -> Result<(), HarnessError> {
    let mut workload = Workload::new(ChurnConfig {
        seed,
        ops,
        debug: debug_flags(),
        ..ChurnConfig::default()
    });
    workload.run()?;

    let report = workload.device().report();
    let mut out = std::io::stdout().lock();
    report.write_to(&mut out, verbose)?;
    out.flush()?;
    Ok(())
}

fn run_validate_log(log: PathBuf) -> Result<(), HarnessError> {
    let (lines, errors) = validate_log_file(&log)?;
    for err in &errors {
        eprintln!("{err}");
    }
    if !errors.is_empty() {
        return Err(HarnessError::InvalidLog {
            path: log,
            lines,
            errors: errors.len(),
        });
    }
    println!("{}: {lines} valid line(s)", log.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Churn {
            seed,
            ops,
            budget_mib,
            shared_permille,
            tick_every,
            log,
            report,
            artifact_index,
        } => run_churn(ChurnArgs {
            seed,
            ops,
            budget_mib,
            shared_permille,
            tick_every,
            log,
            report,
            artifact_index,
        })?,
        Command::Dump { seed, ops, verbose } => run_dump(seed, ops, verbose)?,
        Command::ValidateLog { log } => run_validate_log(log)?,
    }
    Ok(())
}
