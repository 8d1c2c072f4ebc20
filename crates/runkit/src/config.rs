//! Run configuration
//!
//! All knobs a run needs, assembled once at startup. Extra flags may
//! arrive through the `RUNKIT_OPTS` environment variable; its value is
//! tokenized with the same quoting rules as directive text and merged
//! over the command line by a pure function, so there is no ambient
//! global state consulted mid-run.

use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::exec::TimeoutPolicy;
use crate::parser::Lexer;

/// Environment variable holding extra command-line flags.
pub const OPTS_ENV_VAR: &str = "RUNKIT_OPTS";

/// Configuration for a whole run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Worker pool size, minimum 1. Defaults to a single worker so runs
    /// are deterministic unless parallelism is asked for.
    pub workers: usize,
    pub policy: TimeoutPolicy,
    /// Stamp pipelines with pipefail so any failing stage fails the
    /// directive; on by default because test commands hide real failures
    /// behind last-stage filters otherwise.
    pub pipefail: bool,
    /// User macro bindings (`-D name=value`).
    pub params: HashMap<String, String>,
    /// Available feature names checked against `REQUIRES:` lines.
    pub features: HashSet<String>,
    /// File extensions (without dot) that mark test files during
    /// directory walks.
    pub suffixes: Vec<String>,
    /// Substring filter on unit paths.
    pub filter: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            policy: TimeoutPolicy::none(),
            pipefail: true,
            params: HashMap::new(),
            features: HashSet::new(),
            suffixes: vec!["test".to_string()],
            filter: None,
        }
    }
}

/// Merge flags from the options environment variable over an argv vector.
///
/// The variable's value is split with directive quoting rules, so a value
/// like `-D name='two words' -j 4` carries through intact. The extra
/// flags are appended after the command-line ones; for single-occurrence
/// options the parser's last-wins rule makes the environment take
/// precedence, matching how an outer harness overrides a checked-in
/// invocation.
pub fn merge_env_opts(argv: Vec<String>, extra: Option<&str>) -> Result<Vec<String>> {
    let Some(extra) = extra else { return Ok(argv) };
    let mut merged = argv;
    merged.extend(Lexer::split_words(extra)?);
    Ok(merged)
}
