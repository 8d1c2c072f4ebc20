//! Runkit - directive-driven test runner
//!
//! Test files embed `RUN:` lines written in a small shell dialect. Runkit
//! expands macros in each line, parses it into an explicit pipeline of
//! commands, executes the pipeline as real OS processes under overall and
//! idle timeout supervision, and reduces the results of a whole test tree
//! into one deterministic summary, scheduling units across a bounded pool
//! of parallel workers.
//!
//! # Example
//!
//! ```no_run
//! use runkit::{RunConfig, discover, run_all};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> runkit::Result<()> {
//!     let config = RunConfig::default();
//!     let units = discover(&["tests/suite".into()], &config)?;
//!     let (_cancel, cancel_rx) = watch::channel(false);
//!     let summary = run_all(units, &config, cancel_rx).await;
//!     assert!(summary.success());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
mod error;
pub mod exec;
pub mod parser;
pub mod runner;
pub mod sched;
pub mod subst;

pub use config::{RunConfig, merge_env_opts};
pub use discovery::discover;
pub use error::{Error, Result};
pub use exec::{ProcessResult, Supervisor, TimeoutKind, TimeoutPolicy};
pub use parser::{Command, Parser, Pipeline};
pub use runner::{TestUnit, UnitOutcome, Verdict};
pub use sched::{RunSummary, run_all};
