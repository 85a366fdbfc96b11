//! # Main — CLI Entry Point
//!
//! Parses the command line, initialises logging and hands off to the
//! subcommand runners in `cli.rs`.
//!
//! ## Subcommands
//!
//! - `check <n>`: single primality answer.
//! - `up-to <limit>`: every prime `<= limit`.
//! - `first-n <count>`: the first `count` primes.
//!
//! The two search subcommands are checkpointed: rerunning the same command
//! after a timeout or Ctrl-C resumes from the last checkpoint.
//!
//! ## Global Options
//!
//! - `--threads`: worker threads (default: all logical cores).
//! - `--time-limit`: wall-clock budget in seconds.
//! - `--checkpoint` / `--work-dir` (`PRIMECRAWL_WORK_DIR`): checkpoint location.
//! - `--config`: TOML file with search tuning; flags override it.
//! - `--output`: write the final prime list to a file instead of stdout.
//!
//! ## Exit Status
//!
//! 0 success (including a timeout that saved progress), 2 configuration
//! error, 3 checkpoint failure, 4 work unit failure, 1 anything else.

mod cli;

use clap::{Parser, Subcommand};
use primecrawl::config::DEFAULT_CHECKPOINT_FILE;
use primecrawl::SearchError;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "primecrawl",
    version,
    about = "Enumerate primes in parallel with resumable checkpoints"
)]
struct Cli {
    /// Number of worker threads (defaults to all logical cores)
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Wall-clock budget in seconds; progress is checkpointed when it runs out
    #[arg(long, global = true)]
    time_limit: Option<f64>,

    /// Candidates per work unit
    #[arg(long, global = true)]
    batch_size: Option<u64>,

    /// Save a checkpoint after this many newly found primes
    #[arg(long, global = true)]
    checkpoint_every: Option<u64>,

    /// Save a checkpoint at least this often, in seconds
    #[arg(long, global = true)]
    checkpoint_interval: Option<u64>,

    /// Checkpoint file for resuming searches (relative to --work-dir if set)
    #[arg(long, global = true, default_value = DEFAULT_CHECKPOINT_FILE)]
    checkpoint: PathBuf,

    /// Directory holding the checkpoint and prime log
    #[arg(long, global = true, env = "PRIMECRAWL_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// TOML file with search settings (flags take precedence)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write found primes to this file, one per line, instead of stdout
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    /// Ignore and discard any existing checkpoint
    #[arg(long, global = true)]
    no_resume: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether a single number is prime
    Check {
        /// Number to test (negative values are never prime)
        #[arg(allow_hyphen_values = true)]
        n: String,
    },
    /// Find every prime less than or equal to LIMIT
    UpTo {
        /// Inclusive upper bound
        limit: u64,
    },
    /// Find the first COUNT primes
    FirstN {
        /// Number of primes to find
        count: u64,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // LOG_FORMAT=json for log shippers, human-readable otherwise. Both go to
    // stderr so stdout only carries results.
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_logging();

    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Check { n } => cli::run_check(n),
        Commands::UpTo { .. } | Commands::FirstN { .. } => cli::run_search(&cli),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            let code = e
                .downcast_ref::<SearchError>()
                .map(SearchError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}
