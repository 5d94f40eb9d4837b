//! `refork-setup`: first-run bulk indexing of the transcript tree.
//!
//! Modes:
//! - standard: everything in one process, optional `--workers N`
//! - `--batch-mode`: a fresh child process per `--batch-size` sessions so
//!   memory is fully returned between batches (constrained hosts)
//! - `--single-batch`: internal child entry; exit code 0 = done, 1 = more
//!   remaining, 2 = error
//!
//! Exit codes: 0 success, 1 failure, 2 invalid arguments (clap), 130
//! interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use refork_config::Config;
use refork_indexer::{
    BatchOutcome, SessionIndexer, SetupEvent, SetupOptions, SetupOrchestrator, SetupOutcome,
};
use refork_registry::SessionRegistry;
use refork_vector_store::{EmbeddingGateway, EmbeddingModel, GatewayLimits, VectorStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_INTERRUPTED: i32 = 130;

const CHILD_EXIT_MORE_REMAINING: i32 = 1;
const CHILD_EXIT_ERROR: i32 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "refork-setup",
    version,
    about = "Index historical transcripts into the refork search database"
)]
pub struct Args {
    /// Spawn a fresh child process per batch (recommended for >100 sessions)
    #[arg(long)]
    pub batch_mode: bool,

    /// Sessions per batch in batch mode
    #[arg(long, default_value_t = 5)]
    pub batch_size: usize,

    /// Force CPU inference (skip GPU device selection)
    #[arg(long)]
    pub use_cpu: bool,

    /// Per-session timeout in seconds
    #[arg(long, default_value_t = 30.0)]
    pub timeout: f64,

    /// Parallel workers (standard mode)
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Storage directory (default ~/.refork; STORAGE_DIR overrides)
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Transcript directory (default ~/.claude; PRODUCER_DIR overrides)
    #[arg(long)]
    pub claude_dir: Option<PathBuf>,

    /// Resume from a previous interrupted run
    #[arg(long)]
    pub resume: bool,

    /// Re-queue sessions that previously timed out
    #[arg(long)]
    pub retry_timeouts: bool,

    /// Internal: process one batch and exit with 0/1/2
    #[arg(long, hide = true)]
    pub single_batch: bool,
}

pub async fn main_entry() -> Result<i32> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args = Args::parse();
    if args.use_cpu {
        // Device selection is delegated to the embedding backend; this pins
        // it to CPU for memory-constrained hosts.
        std::env::set_var("ORT_DISABLE_GPU", "1");
    }

    if args.batch_mode {
        return run_batch_mode(&args).await;
    }

    let orchestrator = build_orchestrator(&args)?;
    let options = SetupOptions {
        resume: args.resume || args.single_batch,
        retry_timeouts: args.retry_timeouts,
        workers: args.workers.max(1),
        timeout_per_session: Duration::from_secs_f64(args.timeout.max(0.001)),
        batch_size: args.batch_size.max(1),
    };

    if args.single_batch {
        return match orchestrator.run_single_batch(&options).await {
            Ok(BatchOutcome::AllDone) => Ok(EXIT_SUCCESS),
            Ok(BatchOutcome::MoreRemaining) => Ok(CHILD_EXIT_MORE_REMAINING),
            Err(err) => {
                eprintln!("Batch failed: {err}");
                Ok(CHILD_EXIT_ERROR)
            }
        };
    }

    run_standard(orchestrator, options).await
}

async fn run_standard(orchestrator: SetupOrchestrator, options: SetupOptions) -> Result<i32> {
    let orchestrator = Arc::new(orchestrator);

    // Ctrl-C requests a graceful stop: finish the in-flight session, save
    // state, exit 130 so the caller can offer resume.
    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupt received, finishing the current session...");
                orchestrator.cancel();
            }
        });
    }

    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("Progress display skipped {skipped} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let outcome = orchestrator.run(&options).await;
    printer.abort();

    match outcome {
        Ok(SetupOutcome::Completed(stats)) => {
            println!(
                "\nSetup complete: {} files, {} chunks, {} empty, {} timeouts, {} failures in {}",
                stats.files_processed,
                stats.chunks_indexed,
                stats.empty_files,
                stats.timeouts,
                stats.failures,
                format_duration(stats.elapsed_secs),
            );
            if stats.timeouts > 0 {
                println!(
                    "Run again with --resume --retry-timeouts to retry the timed-out sessions."
                );
            }
            Ok(EXIT_SUCCESS)
        }
        Ok(SetupOutcome::Interrupted(stats)) => {
            println!(
                "\nInterrupted after {} files. Run again with --resume to continue.",
                stats.files_processed
            );
            Ok(EXIT_INTERRUPTED)
        }
        Err(err) => {
            eprintln!("Setup failed: {err}");
            Ok(EXIT_FAILURE)
        }
    }
}

/// Batch mode: re-exec ourselves with `--single-batch` until the child
/// reports completion. The state file carries progress between children, so
/// a crashed child never repeats finished work.
async fn run_batch_mode(args: &Args) -> Result<i32> {
    let exe = std::env::current_exe().context("locating refork-setup binary")?;
    let mut batch = 0usize;
    loop {
        batch += 1;
        println!("--- batch {batch} ---");
        let mut command = tokio::process::Command::new(&exe);
        command
            .arg("--single-batch")
            .arg("--batch-size")
            .arg(args.batch_size.to_string())
            .arg("--timeout")
            .arg(args.timeout.to_string());
        if args.use_cpu {
            command.arg("--use-cpu");
        }
        if let Some(dir) = &args.storage_dir {
            command.arg("--storage-dir").arg(dir);
        }
        if let Some(dir) = &args.claude_dir {
            command.arg("--claude-dir").arg(dir);
        }

        let status = command.status().await.context("spawning batch child")?;
        match status.code() {
            Some(0) => {
                println!("All sessions processed in {batch} batches.");
                return Ok(EXIT_SUCCESS);
            }
            Some(code) if code == CHILD_EXIT_MORE_REMAINING => {
                log::info!("Batch {batch} done, more sessions remaining");
                continue;
            }
            Some(code) => {
                eprintln!("Batch {batch} failed with exit code {code}");
                return Ok(EXIT_FAILURE);
            }
            None => {
                eprintln!("Batch {batch} was killed by a signal");
                return Ok(EXIT_INTERRUPTED);
            }
        }
    }
}

fn build_orchestrator(args: &Args) -> Result<SetupOrchestrator> {
    let mut config = {
        let probe = Config {
            storage_dir: args.storage_dir.clone(),
            ..Default::default()
        };
        Config::load(&Config::config_path(&probe.storage_dir()))?
    };
    if args.storage_dir.is_some() {
        config.storage_dir = args.storage_dir.clone();
    }
    if args.claude_dir.is_some() {
        config.producer_dir = args.claude_dir.clone();
    }

    let storage_dir = config.storage_dir();
    let producer_dir = config.producer_dir();
    std::fs::create_dir_all(&storage_dir)
        .with_context(|| format!("creating storage dir {}", storage_dir.display()))?;

    let store = Arc::new(
        VectorStore::open(&storage_dir, config.embedding.dimension)
            .context("opening vector store")?,
    );
    let registry = Arc::new(
        SessionRegistry::open(&storage_dir.join("session-registry.json"))
            .context("opening session registry")?,
    );
    let gateway = Arc::new(
        EmbeddingGateway::new(
            EmbeddingModel::new(config.embedding.dimension)
                .context("initialising embedding model")?,
            &storage_dir.join("embedding_cache"),
            GatewayLimits {
                min_batch: config.embedding.min_batch_size,
                max_batch: config.embedding.max_batch_size,
                memory_threshold_mb: config.memory.max_memory_mb / 4,
            },
        )
        .context("opening embedding cache")?,
    );
    let indexer = Arc::new(SessionIndexer::new(
        &config,
        &storage_dir,
        gateway,
        store,
        registry,
    )?);

    Ok(SetupOrchestrator::new(indexer, &producer_dir, &storage_dir))
}

fn print_event(event: &SetupEvent) {
    match event {
        SetupEvent::Started { total, remaining } => {
            println!("Found {total} transcripts, {remaining} to index.");
        }
        SetupEvent::Progress {
            processed,
            total,
            elapsed,
            eta,
            current_file,
        } => {
            let percent = if *total > 0 {
                *processed as f64 / *total as f64 * 100.0
            } else {
                100.0
            };
            let eta = eta
                .map(|d| format!(" | ETA {}", format_duration(d.as_secs_f64())))
                .unwrap_or_default();
            println!(
                "Indexing {} of {total} ({percent:.1}%) - {current_file} | elapsed {}{eta}",
                processed + 1,
                format_duration(elapsed.as_secs_f64()),
            );
        }
        SetupEvent::Warning(message) => println!("warning: {message}"),
        SetupEvent::Error(message) => eprintln!("error: {message}"),
        SetupEvent::Done { stats } => {
            println!(
                "Done: {} files, {} chunks indexed.",
                stats.files_processed, stats.chunks_indexed
            );
        }
    }
}

fn format_duration(seconds: f64) -> String {
    let seconds = seconds.max(0.0) as u64;
    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
