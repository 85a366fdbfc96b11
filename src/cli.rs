//! # CLI Execution Functions
//!
//! Subcommand runners kept out of `main.rs`: configuration layering,
//! checkpoint placement, the Ctrl-C stop flag and result printing.

use anyhow::{Context, Result};
use primecrawl::config::{resolve_checkpoint_path, SearchConfig};
use primecrawl::coordinator::{SearchCoordinator, SearchOutcome, SearchState};
use primecrawl::partition::Goal;
use primecrawl::SearchError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use super::{Cli, Commands};

// ── Check ───────────────────────────────────────────────────────

/// Parse `input` as an integer and print whether it is prime.
///
/// Negative numbers are valid input and never prime; values past `u64::MAX`
/// are a configuration error.
pub fn run_check(input: &str) -> Result<()> {
    let value: i128 = input
        .trim()
        .parse()
        .map_err(|_| SearchError::config(format!("'{}' is not an integer", input)))?;
    let prime = match u64::try_from(value) {
        Ok(n) => primecrawl::is_prime(n),
        Err(_) if value < 0 => false,
        Err(_) => {
            return Err(SearchError::config(format!(
                "{} exceeds the largest supported candidate {}",
                value,
                u64::MAX
            ))
            .into())
        }
    };
    if prime {
        println!("{} is prime", value);
    } else {
        println!("{} is not prime", value);
    }
    Ok(())
}

// ── Search ──────────────────────────────────────────────────────

fn goal_for(cmd: &Commands) -> Option<Goal> {
    match cmd {
        Commands::UpTo { limit } => Some(Goal::UpTo(*limit)),
        Commands::FirstN { count } => Some(Goal::FirstN(*count)),
        Commands::Check { .. } => None,
    }
}

/// Defaults, then the `--config` file, then flags.
fn build_config(cli: &Cli) -> Result<SearchConfig> {
    let mut config = match &cli.config {
        Some(path) => SearchConfig::load(path)?,
        None => SearchConfig::default(),
    };
    if cli.threads.is_some() {
        config.threads = cli.threads;
    }
    if cli.time_limit.is_some() {
        config.time_limit_secs = cli.time_limit;
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(every) = cli.checkpoint_every {
        config.checkpoint_every = every;
    }
    if let Some(interval) = cli.checkpoint_interval {
        config.checkpoint_interval_secs = interval;
    }
    if cli.no_resume {
        config.resume = false;
    }
    config.validate()?;
    Ok(config)
}

/// First call sets `stop` so the coordinator drains and checkpoints; a
/// second call exits without waiting.
fn stop_handler(stop: Arc<AtomicBool>) -> impl FnMut() + Send + 'static {
    move || {
        if stop.swap(true, Ordering::SeqCst) {
            warn!("second stop request, exiting without final checkpoint");
            std::process::exit(130);
        }
        info!("stop requested, finishing in-flight work and saving checkpoint");
    }
}

fn install_stop_handler(stop: Arc<AtomicBool>) {
    if let Err(e) = ctrlc::set_handler(stop_handler(stop)) {
        warn!(error = %e, "could not install Ctrl-C handler");
    }
}

/// Run an `up-to` or `first-n` search to completion or its time limit.
pub fn run_search(cli: &Cli) -> Result<()> {
    let goal = goal_for(&cli.command).context("not a search subcommand")?;
    let config = build_config(cli)?;

    if let Some(dir) = &cli.work_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating work directory {}", dir.display()))?;
    }
    let checkpoint = resolve_checkpoint_path(cli.work_dir.as_deref(), &cli.checkpoint);

    info!(
        goal = %goal,
        threads = config.parallelism(),
        checkpoint = %checkpoint.display(),
        "primecrawl starting"
    );

    let mut coordinator = SearchCoordinator::new(goal, config, &checkpoint)?;
    if let Some(output) = &cli.output {
        coordinator = coordinator.with_result_sink(output);
    }
    install_stop_handler(coordinator.stop_flag());

    let outcome = coordinator.run()?;
    print_outcome(cli, &outcome);
    Ok(())
}

fn print_outcome(cli: &Cli, outcome: &SearchOutcome) {
    let count = outcome.primes.len();
    match outcome.state {
        SearchState::Completed => match (&cli.output, outcome.goal) {
            (Some(path), _) => {
                println!("Wrote {} primes to {}", count, path.display());
            }
            (None, Goal::UpTo(limit)) => {
                println!("Primes up to {}: {:?}", limit, outcome.primes);
                println!("Total: {} primes", count);
            }
            (None, Goal::FirstN(n)) => {
                println!("First {} primes: {:?}", n, outcome.primes);
            }
        },
        _ => {
            println!(
                "Time limit reached after {} primes (next candidate {}, {:.1}s total); \
                 rerun the same command to resume",
                outcome.progress.discovered_count,
                outcome.progress.cursor,
                outcome.progress.elapsed_seconds
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    // ── Config Layering ─────────────────────────────────────────────

    /// Flags beat the TOML file, which beats the defaults.
    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("search.toml");
        std::fs::write(&file, "batch_size = 50\nthreads = 2\ncheckpoint_every = 7\n").unwrap();

        let cli = Cli::try_parse_from([
            "primecrawl",
            "--config",
            file.to_str().unwrap(),
            "--batch-size",
            "99",
            "--no-resume",
            "up-to",
            "100",
        ])
        .unwrap();
        let config = build_config(&cli).unwrap();
        assert_eq!(config.batch_size, 99);
        assert_eq!(config.threads, Some(2));
        assert_eq!(config.checkpoint_every, 7);
        assert!(!config.resume);
        assert_eq!(goal_for(&cli.command), Some(Goal::UpTo(100)));
    }

    /// Validation runs after layering, so a bad flag is exit 2.
    #[test]
    fn invalid_flag_value_is_config_error() {
        let cli = Cli::try_parse_from(["primecrawl", "first-n", "5", "--threads", "0"]).unwrap();
        let err = build_config(&cli).unwrap_err();
        assert_eq!(err.downcast_ref::<SearchError>().unwrap().exit_code(), 2);
    }

    /// Budgets that cannot become a `Duration` fail layering with exit 2.
    #[test]
    fn oversized_time_limit_is_config_error() {
        let cli =
            Cli::try_parse_from(["primecrawl", "up-to", "30", "--time-limit", "1e20"]).unwrap();
        let err = build_config(&cli).unwrap_err();
        assert_eq!(err.downcast_ref::<SearchError>().unwrap().exit_code(), 2);
    }

    // ── Stop Handling ───────────────────────────────────────────────

    /// One Ctrl-C only raises the shared flag; the process keeps running.
    #[test]
    fn first_stop_request_sets_flag() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handler = stop_handler(Arc::clone(&stop));
        handler();
        assert!(stop.load(Ordering::SeqCst));
    }

    // ── Check ───────────────────────────────────────────────────────

    /// Negative input is answered; input past `u64::MAX` or non-numeric is not.
    #[test]
    fn check_rejects_out_of_range_input() {
        for input in ["18446744073709551616", "seventeen", ""] {
            let err = run_check(input).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<SearchError>(),
                Some(SearchError::Config(_))
            ));
        }
        run_check("-5").unwrap();
        run_check("17").unwrap();
    }
}
