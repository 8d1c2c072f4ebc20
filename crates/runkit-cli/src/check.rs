//! runkit-check - minimal ordered-pattern verifier
//!
//! Reads `CHECK:` patterns from a file and verifies each appears, in
//! order, in the text arriving on stdin. Exists as a pipeline sink for
//! test directives:
//!
//!   RUN: mytool %s | runkit-check %s

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;

/// Verify stdin against CHECK: patterns from a file
#[derive(Parser, Debug)]
#[command(name = "runkit-check", version, about)]
struct Args {
    /// File containing the patterns
    check_file: PathBuf,

    /// Marker introducing a pattern line
    #[arg(long, default_value = "CHECK:", value_name = "MARKER")]
    marker: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("runkit-check: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(args: &Args) -> Result<bool> {
    let source = std::fs::read_to_string(&args.check_file)
        .with_context(|| format!("cannot read {}", args.check_file.display()))?;
    let patterns: Vec<&str> = source
        .lines()
        .filter_map(|line| {
            line.find(&args.marker)
                .map(|at| line[at + args.marker.len()..].trim())
        })
        .filter(|pattern| !pattern.is_empty())
        .collect();
    if patterns.is_empty() {
        bail!(
            "no '{}' patterns in {}",
            args.marker,
            args.check_file.display()
        );
    }

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("cannot read stdin")?;

    let mut rest = input.as_str();
    for pattern in patterns {
        match rest.find(pattern) {
            Some(at) => rest = &rest[at + pattern.len()..],
            None => {
                eprintln!("runkit-check: pattern not found in order: {pattern}");
                return Ok(false);
            }
        }
    }
    Ok(true)
}
