//! Runkit CLI - run directive-driven test suites
//!
//! Usage:
//!   runkit tests/                 # Run every *.test file under tests/
//!   runkit -j 8 tests/ suite.test # Eight workers, explicit extra file
//!   runkit -D tool=/opt/bin/tool  # Bind %{tool} in directives
//!
//! Extra flags can be supplied through the RUNKIT_OPTS environment
//! variable; they are tokenized with directive quoting rules and take
//! precedence over flags given on the command line.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use runkit::config::OPTS_ENV_VAR;
use runkit::sched::RunSummary;
use runkit::{RunConfig, discover, merge_env_opts, run_all};

/// Runkit - directive-driven test runner
#[derive(Parser, Debug)]
#[command(name = "runkit")]
#[command(author, version, about, long_about = None)]
// Options may repeat with last-wins semantics so flags injected through
// RUNKIT_OPTS can override what is on the command line.
#[command(args_override_self = true)]
struct Args {
    /// Files or directories to include in the run
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Number of parallel test workers
    #[arg(short = 'j', long = "workers", default_value_t = 1, value_name = "N")]
    workers: usize,

    /// Print only the final summary counts
    #[arg(short = 's', long = "summary-only")]
    summary_only: bool,

    /// List every result, not just failing ones
    #[arg(short = 'a', long = "show-all")]
    show_all: bool,

    /// Bind a macro for directive substitution (repeatable)
    #[arg(short = 'D', long = "param", value_name = "NAME=VALUE")]
    params: Vec<String>,

    /// Hard wall-clock cap per pipeline, in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Kill a pipeline after this many seconds without output
    #[arg(long = "idle-timeout", value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// Only run tests whose path contains this substring
    #[arg(long, value_name = "SUBSTRING")]
    filter: Option<String>,

    /// Test file suffix for directory walks (repeatable; default: test)
    #[arg(long = "suffix", value_name = "EXT")]
    suffixes: Vec<String>,

    /// Declare an available feature for REQUIRES: gates (repeatable)
    #[arg(long = "feature", value_name = "NAME")]
    features: Vec<String>,

    /// Use conventional last-stage pipeline exit codes instead of pipefail
    #[arg(long = "no-pipefail")]
    no_pipefail: bool,

    /// Write the summary as JSON to this path
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUNKIT_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let argv = merge_env_opts(
        std::env::args().collect(),
        std::env::var(OPTS_ENV_VAR).ok().as_deref(),
    )
    .with_context(|| format!("invalid {OPTS_ENV_VAR} value"))?;
    let args = Args::parse_from(argv);
    let config = build_config(&args)?;

    let units = discover(&args.paths, &config).context("test discovery failed")?;
    tracing::info!(units = units.len(), workers = config.workers, "discovery finished");
    if units.is_empty() {
        println!("no tests discovered");
        return Ok(());
    }
    if !args.summary_only {
        println!("-- Testing: {} tests, {} workers --", units.len(), config.workers);
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted, terminating in-flight tests...");
            let _ = cancel_tx.send(true);
        }
    });

    let summary = run_all(units, &config, cancel_rx).await;

    print_report(&summary, &args);
    if let Some(path) = &args.output {
        let file = std::fs::File::create(path)
            .with_context(|| format!("cannot create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &summary)
            .with_context(|| format!("cannot write {}", path.display()))?;
    }

    std::process::exit(if summary.success() { 0 } else { 1 });
}

fn build_config(args: &Args) -> Result<RunConfig> {
    let mut config = RunConfig {
        workers: args.workers.max(1),
        pipefail: !args.no_pipefail,
        filter: args.filter.clone(),
        ..RunConfig::default()
    };
    config.policy.overall = args.timeout.map(Duration::from_secs);
    config.policy.idle = args.idle_timeout.map(Duration::from_secs);
    for param in &args.params {
        let (name, value) = param
            .split_once('=')
            .with_context(|| format!("-D expects NAME=VALUE, got '{param}'"))?;
        config.params.insert(name.to_string(), value.to_string());
    }
    config.features = args.features.iter().cloned().collect();
    if !args.suffixes.is_empty() {
        config.suffixes = args.suffixes.clone();
    }
    Ok(config)
}

fn print_report(summary: &RunSummary, args: &Args) {
    if !args.summary_only {
        if args.show_all {
            for report in &summary.reports {
                println!("{}: {}", report.verdict.label(), report.path.display());
            }
        }
        for report in &summary.reports {
            let Some(output) = &report.output else { continue };
            println!(
                "{:*^60}",
                format!(" {} '{}' ", report.verdict.label(), report.path.display())
            );
            print!("{output}");
            println!("{:*^60}", "");
        }
    }

    let counts = [
        ("Passes", summary.pass),
        ("Expected Failures", summary.expected_fail),
        ("Skipped", summary.skipped),
        ("Unresolved", summary.unresolved),
        ("Unexpected Passes", summary.unexpected_pass),
        ("Failures", summary.fail),
    ];
    for (label, count) in counts {
        if count > 0 {
            println!("{label:<20}: {count}");
        }
    }
    if summary.cancelled {
        println!("Run cancelled after {} of its tests finished.", summary.total());
    }
}
