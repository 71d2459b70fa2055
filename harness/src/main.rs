//! Test Harness - Runner
//!
//! Discovers bundle executables, asks each for its tests, and runs them one
//! bundle at a time. Results go to stdout either as a control-message stream
//! for a driving framework or, with `--manual`, as a human-readable log.

mod bundle_process;
mod coordinator;
mod discovery;
mod error;
mod manual;
mod pipe_watcher;
mod session;
mod shutdown;

use anyhow::Result;
use clap::{Parser, Subcommand};
use coordinator::{ProcessClient, RunOptions};
use error::RunnerError;
use shutdown::Shutdown;
use harness_common::{ExitStatus, ListEntitiesRequest, LogConfig, RunnerConfig, init_logging};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "harness")]
#[command(author, version, about = "Test harness runner - discovers bundles and runs their tests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the runner config file
    #[arg(short, long, global = true, env = "HARNESS_CONFIG")]
    config: Option<PathBuf>,

    /// Glob matching bundle executables
    #[arg(long, global = true)]
    bundle_glob: Option<String>,

    /// SIGTERM other runner instances before starting
    #[arg(long, global = true)]
    kill_stale: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List tests matching the patterns (all tests when none are given)
    List {
        /// Print full test metadata as JSON
        #[arg(long)]
        json: bool,

        /// Test name globs, or a single parenthesized attribute expression
        patterns: Vec<String>,
    },

    /// Run tests matching the patterns
    Run {
        /// Print a human-readable log instead of control messages
        ///
        /// Exits non-zero when no tests match or any test fails.
        #[arg(long)]
        manual: bool,

        /// Directory receiving run results
        #[arg(short, long)]
        out_dir: Option<PathBuf>,

        /// Root of per-package data directories
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Skip tests whose software dependencies are unavailable
        #[arg(long)]
        check_deps: bool,

        /// Grace period after a test's timeout before it is abandoned (e.g. "30s")
        #[arg(long, value_parser = humantime::parse_duration)]
        exit_timeout: Option<Duration>,

        /// Test name globs, or a single parenthesized attribute expression
        patterns: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitStatus::BadArgs.into()
            } else {
                ExitStatus::Success.into()
            };
        }
    };

    let mut log_config = LogConfig::from_env("warn").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = match init_logging(&log_config) {
        Ok(guards) => Some(guards),
        Err(err) => {
            eprintln!("Failed to initialize logging: {err}");
            None
        }
    };

    // A signal between bundle runs aborts the next one.
    let shutdown = match Shutdown::install() {
        Ok(shutdown) => shutdown,
        Err(err) => {
            warn!("Cannot install signal handlers: {err}");
            Shutdown::never()
        }
    };

    match run(cli, shutdown).await {
        Ok(status) => status.into(),
        Err(err) => {
            eprintln!("Error: {err:#}");
            err.downcast_ref::<RunnerError>()
                .map(RunnerError::exit_status)
                .unwrap_or(ExitStatus::BadArgs)
                .into()
        }
    }
}

async fn run(cli: Cli, shutdown: Shutdown) -> Result<ExitStatus> {
    let mut config = RunnerConfig::load(cli.config.as_deref()).map_err(RunnerError::from)?;
    if let Some(glob) = cli.bundle_glob {
        config.bundle_glob = glob;
    }
    if cli.kill_stale {
        config.kill_stale_runners = true;
    }
    debug!(?config, "Effective runner config");

    if config.kill_stale_runners {
        let killed = session::kill_stale_runners();
        if killed > 0 {
            info!(killed, "Terminated stale runner instances");
        }
    }

    let client = Arc::new(ProcessClient::new(shutdown));
    match cli.command {
        Commands::List { json, patterns } => {
            let req = ListEntitiesRequest { patterns };
            let bundles =
                coordinator::get_bundles_and_tests(client, &config.bundle_glob, &req).await?;
            let tests: Vec<_> = bundles.into_iter().flat_map(|b| b.tests).collect();
            let mut out = std::io::stdout().lock();
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&tests)?)?;
            } else {
                for test in &tests {
                    writeln!(out, "{}", test.name)?;
                }
            }
            Ok(ExitStatus::Success)
        }
        Commands::Run {
            manual,
            out_dir,
            data_dir,
            check_deps,
            exit_timeout,
            patterns,
        } => {
            if let Some(dir) = out_dir {
                config.out_dir = dir;
            }
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if check_deps {
                config.check_test_deps = true;
            }
            if exit_timeout.is_some() {
                config.exit_timeout = exit_timeout;
            }
            let opts = RunOptions::from_config(&config, patterns);

            if manual {
                Ok(manual::run_manual(client, &opts).await?)
            } else {
                let mut stdout = tokio::io::stdout();
                coordinator::run(client, &opts, &mut stdout, false).await?;
                Ok(ExitStatus::Success)
            }
        }
    }
}
