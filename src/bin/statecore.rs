//! statecore operator CLI
//!
//! Every command opens the store and runs crash recovery first, the same
//! startup contract the library enforces.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use statecore::cpu::{self, ThreadHandle};
use statecore::wal::now_millis;
use statecore::{Config, Engine, EngineStatus, RecoveryReport, StateError};
use tracing_subscriber::{fmt, EnvFilter};

/// statecore
#[derive(Parser, Debug)]
#[command(name = "statecore")]
#[command(about = "Durable state core: atomic commits, crash recovery, CPU accounting")]
#[command(version)]
struct Args {
    /// Data directory (WAL under wal/, snapshots under snapshots/)
    #[arg(short, long, default_value = "./statecore_data")]
    data_dir: PathBuf,

    /// JSON config file; overrides --data-dir
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for recovery reports
    #[arg(short, long)]
    report_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run crash recovery and print the report
    Recover,

    /// Print lifecycle, digest and key count
    Status,

    /// Commit `key = value`
    Put {
        key: String,
        value: String,
    },

    /// Commit removal of a key
    Del {
        key: String,
    },

    /// Print a committed value
    Get {
        key: String,
    },

    /// Rewrite the WAL to one record per transaction
    Compact,

    /// Save the verified state as the restore point
    Checkpoint,

    /// Replace the canonical snapshot with the checkpoint
    RestoreCheckpoint,

    /// Show which thread CPU clock this platform uses
    CpuProbe,
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,statecore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            if let Some(hint) = e.hint() {
                eprintln!("hint: {}", hint);
            }
            ExitCode::from(1)
        }
    }
}

fn run(args: Args) -> statecore::Result<ExitCode> {
    if let Commands::CpuProbe = args.command {
        return cpu_probe();
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::builder().data_dir(&args.data_dir).build(),
    };
    if args.report_dir.is_some() {
        config.report_dir = args.report_dir.clone();
    }

    tracing::info!("statecore v{}", statecore::VERSION);
    let engine = Engine::open(config)?;
    let report = engine.recover_from_crash()?;

    // Restoring is the one command that runs on a halted store
    if let Commands::RestoreCheckpoint = args.command {
        let digest = engine.restore_checkpoint()?;
        println!("restored checkpoint, digest {}", digest);
        return Ok(ExitCode::SUCCESS);
    }

    if let EngineStatus::Halted(failure) = engine.status() {
        print_report(&report)?;
        eprintln!("store halted: {}", failure.message);
        if let Some(hint) = &failure.hint {
            eprintln!("hint: {}", hint);
        }
        return Ok(ExitCode::from(2));
    }

    match args.command {
        Commands::Recover => print_report(&report)?,
        Commands::Status => {
            println!("status:  ready");
            println!("digest:  {}", engine.snapshot_digest()?);
            println!("keys:    {}", engine.len());
            println!("pending: {}", engine.list_uncommitted()?.len());
        }
        Commands::Put { key, value } => {
            let mut tx = engine.begin_transaction(cli_tx_id())?;
            tx.put(key, value.into_bytes());
            let receipt = engine.commit_transaction(&mut tx)?;
            println!(
                "committed {} at lsn {}, digest {}",
                receipt.tx_id, receipt.commit_lsn, receipt.digest
            );
        }
        Commands::Del { key } => {
            let mut tx = engine.begin_transaction(cli_tx_id())?;
            tx.delete(key);
            let receipt = engine.commit_transaction(&mut tx)?;
            println!("committed {} at lsn {}", receipt.tx_id, receipt.commit_lsn);
        }
        Commands::Get { key } => match engine.get(&key)? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => {
                println!("(nil)");
                return Ok(ExitCode::from(3));
            }
        },
        Commands::Compact => {
            let stats = engine.compact()?;
            println!(
                "compacted {} -> {} entries ({} -> {} bytes)",
                stats.entries_before, stats.entries_after, stats.bytes_before, stats.bytes_after
            );
        }
        Commands::Checkpoint => {
            let meta = engine.checkpoint()?;
            println!("checkpoint at lsn {}, digest {}", meta.lsn, meta.digest);
        }
        Commands::RestoreCheckpoint | Commands::CpuProbe => {}
    }

    engine.close()?;
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &RecoveryReport) -> statecore::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn cpu_probe() -> statecore::Result<ExitCode> {
    let clock = match cpu::probe() {
        Ok(clock) => clock,
        Err(e @ StateError::PlatformUnsupported(_)) => {
            println!("{}", e);
            return Ok(ExitCode::from(1));
        }
        Err(e) => return Err(e),
    };

    let me = ThreadHandle::current();
    let before = clock.thread_cpu_time_ms(me)?;
    let started = Instant::now();
    let mut acc = 0u64;
    while started.elapsed().as_millis() < 20 {
        acc = acc.wrapping_mul(6364136223846793005).wrapping_add(1);
    }
    std::hint::black_box(acc);
    let after = clock.thread_cpu_time_ms(me)?;

    println!("clock:  {}", clock.name());
    println!("thread: {}", me);
    println!("spun {:.1} ms wall, {:.3} ms cpu", started.elapsed().as_secs_f64() * 1_000.0, after - before);
    Ok(ExitCode::SUCCESS)
}

fn cli_tx_id() -> String {
    format!("cli-{}-{}", now_millis(), std::process::id())
}
