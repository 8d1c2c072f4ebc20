//! Test unit runner
//!
//! A test unit is one discovered file: an ordered list of `RUN:` directive
//! lines, an expected-outcome classification, and the substitution context
//! the directives are expanded with. The runner executes each directive's
//! pipelines strictly in source order inside a fresh scratch working
//! directory and reduces the sequence of results into one verdict.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::exec::{ProcessResult, Supervisor, TimeoutKind};
use crate::parser::{Parser, Pipeline};
use crate::subst::Substitutions;

/// Final classification of a test unit's outcome. Immutable once
/// produced; only the runner creates these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Verdict {
    Pass,
    Fail,
    ExpectedFail,
    UnexpectedPass,
    Unresolved,
    Skipped,
}

impl Verdict {
    /// Whether this verdict makes the whole run fail.
    pub fn is_failure(self) -> bool {
        matches!(self, Verdict::Fail | Verdict::UnexpectedPass | Verdict::Unresolved)
    }

    /// Short uppercase label used in result listings.
    pub fn label(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::ExpectedFail => "XFAIL",
            Verdict::UnexpectedPass => "XPASS",
            Verdict::Unresolved => "UNRESOLVED",
            Verdict::Skipped => "SKIPPED",
        }
    }
}

/// One extracted directive: the raw text after its keyword, plus the
/// source line it started on.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub line: usize,
    pub text: String,
}

/// One discovered test file, ready to execute.
#[derive(Debug, Clone)]
pub struct TestUnit {
    pub path: PathBuf,
    pub directives: Vec<Directive>,
    /// Marked expected-to-fail by an `XFAIL:` line.
    pub expected_fail: bool,
    /// Feature names from `REQUIRES:` lines; unsatisfied names skip the unit.
    pub requires: Vec<String>,
    /// Macro context the directives are expanded with.
    pub substitutions: Substitutions,
}

static KEYWORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:(RUN|XFAIL|REQUIRES):|(END\.))").expect("keyword regex"));

impl TestUnit {
    /// Read and scan a test file.
    pub fn from_file(path: &Path, config: &RunConfig) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(Self::from_source(path, &source, config))
    }

    /// Scan test source for directive keywords. `RUN:` lines become
    /// directives, with a trailing `\` joining the next `RUN:` line;
    /// `XFAIL:` flags the unit expected-to-fail; `REQUIRES:` collects
    /// feature names; `END.` stops the scan. Unknown keywords are ignored.
    pub fn from_source(path: &Path, source: &str, config: &RunConfig) -> Self {
        let mut directives: Vec<Directive> = Vec::new();
        let mut expected_fail = false;
        let mut requires = Vec::new();

        'lines: for (index, line) in source.lines().enumerate() {
            let Some(found) = KEYWORD_RE.captures(line) else {
                continue;
            };
            if found.get(2).is_some() {
                break 'lines;
            }
            let keyword = found.get(1).expect("keyword group").as_str();
            let body = line[found.get(0).expect("match").end()..].trim();
            match keyword {
                "RUN" => match directives.last_mut() {
                    Some(prev) if prev.text.ends_with('\\') => {
                        prev.text.pop();
                        prev.text.push(' ');
                        prev.text.push_str(body);
                    }
                    _ => directives.push(Directive {
                        line: index + 1,
                        text: body.to_string(),
                    }),
                },
                "XFAIL" => expected_fail = true,
                "REQUIRES" => {
                    requires.extend(
                        body.split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(String::from),
                    );
                }
                _ => unreachable!("regex only captures known keywords"),
            }
        }
        // A continuation left dangling at end of file is dropped.
        if let Some(last) = directives.last_mut() {
            if last.text.ends_with('\\') {
                last.text.pop();
                last.text = last.text.trim_end().to_string();
            }
        }

        let mut substitutions = Substitutions::new();
        for (name, value) in &config.params {
            substitutions.define(name.clone(), value.clone());
        }
        substitutions.define("s", path.display().to_string());
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        substitutions.define("S", parent.display().to_string());

        Self {
            path: path.to_path_buf(),
            directives,
            expected_fail,
            requires,
            substitutions,
        }
    }
}

/// Execution context shared by all units of a run.
pub struct RunContext {
    pub supervisor: Supervisor,
    pub pipefail: bool,
    pub features: HashSet<String>,
}

/// The ProcessResults of one directive, in pipeline order.
#[derive(Debug, Clone, Serialize)]
pub struct DirectiveResult {
    /// The directive after macro substitution.
    pub text: String,
    pub line: usize,
    pub results: Vec<ProcessResult>,
}

/// The verdict plus everything captured while producing it.
#[derive(Debug, Clone, Serialize)]
pub struct UnitOutcome {
    pub verdict: Verdict,
    pub results: Vec<DirectiveResult>,
    /// Why the unit was unresolved or skipped, when it was.
    pub note: Option<String>,
}

impl UnitOutcome {
    pub(crate) fn unresolved(note: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Unresolved,
            results: Vec::new(),
            note: Some(note.into()),
        }
    }

    /// Human-readable account of the executed directives, for failure
    /// listings.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for directive in &self.results {
            for result in &directive.results {
                let _ = writeln!(out, "$ {}", result.command);
                match result.timeout {
                    TimeoutKind::Overall => {
                        let _ = writeln!(out, "terminated: overall timeout");
                    }
                    TimeoutKind::Idle => {
                        let _ = writeln!(out, "terminated: idle timeout");
                    }
                    TimeoutKind::None => {
                        let _ = writeln!(out, "exit code: {}", result.exit_code);
                    }
                }
                if !result.stdout.is_empty() {
                    let _ = writeln!(out, "-- stdout --\n{}", result.stdout.trim_end());
                }
                if !result.stderr.is_empty() {
                    let _ = writeln!(out, "-- stderr --\n{}", result.stderr.trim_end());
                }
            }
        }
        if let Some(note) = &self.note {
            let _ = writeln!(out, "{note}");
        }
        out
    }
}

/// Execute one unit: expand, parse and run each directive in order, then
/// reduce to a verdict. Returns `Err` only on cancellation.
pub async fn run_unit(unit: &TestUnit, ctx: &RunContext) -> Result<UnitOutcome> {
    let missing: Vec<&str> = unit
        .requires
        .iter()
        .filter(|f| !ctx.features.contains(f.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Ok(UnitOutcome {
            verdict: Verdict::Skipped,
            results: Vec::new(),
            note: Some(format!("missing required features: {}", missing.join(", "))),
        });
    }
    if unit.directives.is_empty() {
        return Ok(UnitOutcome::unresolved("no RUN directives in test file"));
    }

    let scratch = match tempfile::Builder::new().prefix("runkit-").tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            return Ok(UnitOutcome::unresolved(format!(
                "cannot create scratch directory: {e}"
            )));
        }
    };
    let mut substitutions = unit.substitutions.clone();
    substitutions.define("t", scratch.path().join("output.tmp").display().to_string());
    substitutions.define("T", scratch.path().display().to_string());

    let outcome = execute_directives(unit, ctx, &substitutions, scratch.path()).await;
    // Verdict correctness outranks cleanup fidelity: a failed removal is
    // logged and otherwise ignored.
    if let Err(e) = scratch.close() {
        warn!(unit = %unit.path.display(), error = %e, "failed to remove scratch directory");
    }
    let outcome = outcome?;
    debug!(unit = %unit.path.display(), verdict = outcome.verdict.label(), "unit finished");
    Ok(outcome)
}

async fn execute_directives(
    unit: &TestUnit,
    ctx: &RunContext,
    substitutions: &Substitutions,
    cwd: &Path,
) -> Result<UnitOutcome> {
    let mut results = Vec::new();
    let mut failed = false;

    'directives: for directive in &unit.directives {
        let text = match substitutions.apply(&directive.text) {
            Ok(text) => text,
            Err(e) => {
                return Ok(UnitOutcome {
                    verdict: Verdict::Unresolved,
                    results,
                    note: Some(format!("line {}: {e}", directive.line)),
                });
            }
        };
        let pipelines = match Parser::new(&text).pipefail(ctx.pipefail).parse() {
            Ok(pipelines) => pipelines,
            Err(e) => {
                return Ok(UnitOutcome {
                    verdict: Verdict::Unresolved,
                    results,
                    note: Some(format!("line {}: {e}", directive.line)),
                });
            }
        };

        let mut directive_result = DirectiveResult {
            text,
            line: directive.line,
            results: Vec::new(),
        };
        for pipeline in &pipelines {
            match ctx.supervisor.run(pipeline, cwd).await {
                Ok(result) => {
                    let ok = result.success();
                    directive_result.results.push(result);
                    if !ok {
                        failed = true;
                    }
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    // Spawn and redirect failures are recorded against the
                    // unit, never escalated beyond it.
                    directive_result.results.push(spawn_failure(pipeline, &e));
                    failed = true;
                }
            }
            if failed {
                break;
            }
        }
        results.push(directive_result);
        if failed {
            break 'directives;
        }
    }

    let verdict = match (unit.expected_fail, failed) {
        (false, false) => Verdict::Pass,
        (false, true) => Verdict::Fail,
        (true, true) => Verdict::ExpectedFail,
        (true, false) => Verdict::UnexpectedPass,
    };
    Ok(UnitOutcome {
        verdict,
        results,
        note: None,
    })
}

/// A pipeline that never ran: record the failure in result form so it
/// flows through the same reporting as ordinary non-zero exits.
fn spawn_failure(pipeline: &Pipeline, error: &Error) -> ProcessResult {
    ProcessResult {
        command: pipeline.render(),
        stage_codes: Vec::new(),
        exit_code: 127,
        killed: false,
        stdout: String::new(),
        stderr: error.to_string(),
        duration: Duration::ZERO,
        timeout: TimeoutKind::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn unit(source: &str) -> TestUnit {
        TestUnit::from_source(Path::new("/suite/sample.test"), source, &RunConfig::default())
    }

    #[test]
    fn extracts_run_directives_in_order() {
        let unit = unit(
            "// A test.\n\
             // RUN: first %s\n\
             some unrelated text\n\
             // RUN: second\n",
        );
        assert_eq!(
            unit.directives,
            vec![
                Directive {
                    line: 2,
                    text: "first %s".into()
                },
                Directive {
                    line: 4,
                    text: "second".into()
                },
            ]
        );
        assert!(!unit.expected_fail);
    }

    #[test]
    fn trailing_backslash_joins_run_lines() {
        let unit = unit(
            "// RUN: tool --flag \\\n\
             // RUN: more args\n",
        );
        assert_eq!(
            unit.directives,
            vec![Directive {
                line: 1,
                text: "tool --flag more args".into()
            }]
        );
    }

    #[test]
    fn xfail_marks_expected_failure() {
        let unit = unit("// XFAIL: *\n// RUN: tool\n");
        assert!(unit.expected_fail);
    }

    #[test]
    fn requires_collects_feature_names() {
        let unit = unit("// REQUIRES: shell, native-arch\n// RUN: tool\n");
        assert_eq!(unit.requires, vec!["shell", "native-arch"]);
    }

    #[test]
    fn end_marker_stops_scanning() {
        let unit = unit("// RUN: before\n// END.\n// RUN: after\n");
        assert_eq!(unit.directives.len(), 1);
        assert_eq!(unit.directives[0].text, "before");
    }

    #[test]
    fn own_path_is_bound_for_substitution() {
        let unit = unit("// RUN: check %s\n");
        assert_eq!(unit.substitutions.get("s"), Some("/suite/sample.test"));
        assert_eq!(unit.substitutions.get("S"), Some("/suite"));
    }

    #[test]
    fn verdict_failure_classification() {
        assert!(Verdict::Fail.is_failure());
        assert!(Verdict::UnexpectedPass.is_failure());
        assert!(Verdict::Unresolved.is_failure());
        assert!(!Verdict::Pass.is_failure());
        assert!(!Verdict::ExpectedFail.is_failure());
        assert!(!Verdict::Skipped.is_failure());
    }
}
