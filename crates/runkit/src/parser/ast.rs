//! Shell command model
//!
//! The in-memory representation of a parsed pipeline: ordered stages, each
//! with an argument vector, inline environment assignments and redirection
//! specs, plus trailing redirections scoped to the pipeline as a whole.
//! The model is a closed set of plain data types with structural equality;
//! [`Pipeline::render`] turns a value back into literal shell text that
//! re-parses to an equal value.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;

pub use super::tokens::RedirectOp;

/// Where a redirection points: a file path, or another descriptor for
/// `N>&M` duplications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RedirectTarget {
    Path(String),
    Fd(i32),
}

/// A single redirection spec. Targets are resolved against the unit's
/// working directory at execution time, never at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Redirect {
    pub op: RedirectOp,
    /// Source descriptor the redirect overrides; `None` means the
    /// operator's default (0 for `<`, 1 otherwise).
    pub fd: Option<i32>,
    pub target: RedirectTarget,
}

impl Redirect {
    /// The descriptor this redirect rebinds.
    pub fn source_fd(&self) -> i32 {
        self.fd.unwrap_or(match self.op {
            RedirectOp::In => 0,
            _ => 1,
        })
    }

    fn render(&self, out: &mut String) {
        if let Some(fd) = self.fd {
            let _ = write!(out, "{fd}");
        }
        out.push_str(match self.op {
            RedirectOp::In => "<",
            RedirectOp::Out => ">",
            RedirectOp::Append => ">>",
            RedirectOp::DupOut => ">&",
        });
        match &self.target {
            RedirectTarget::Fd(fd) => {
                let _ = write!(out, "{fd}");
            }
            RedirectTarget::Path(path) => {
                out.push(' ');
                out.push_str(&quote_word(path));
            }
        }
    }
}

/// One pipeline stage: argv, inline env assignments, redirections.
///
/// Assignment insertion order is irrelevant to both equality and
/// execution, so the map is kept sorted for deterministic rendering.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Command {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub redirects: Vec<Redirect>,
}

impl Command {
    /// Build a command from an argument vector; test and embedding helper.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    fn render(&self, out: &mut String) {
        for (name, value) in &self.env {
            let _ = write!(out, "{name}={} ", quote_word(value));
        }
        for (i, arg) in self.argv.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&quote_word(arg));
        }
        for redirect in &self.redirects {
            out.push(' ');
            redirect.render(out);
        }
    }
}

/// An ordered sequence of commands connected by pipes, executed as one
/// logical unit with a single effective exit code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pipeline {
    pub stages: Vec<Command>,
    /// With pipefail, the first failing stage decides the effective exit
    /// code; without it only the last stage counts.
    pub pipefail: bool,
    /// Trailing redirections scoped to the whole pipeline: `<` rebinds the
    /// first stage's stdin, output redirects rebind the last stage.
    pub redirects: Vec<Redirect>,
}

impl Pipeline {
    pub fn new(stages: Vec<Command>) -> Self {
        Self {
            stages,
            pipefail: false,
            redirects: Vec::new(),
        }
    }

    pub fn with_pipefail(mut self, pipefail: bool) -> Self {
        self.pipefail = pipefail;
        self
    }

    /// Render back into literal shell syntax. Parsing the result with the
    /// same pipefail setting yields a structurally equal pipeline.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                out.push_str(" | ");
            }
            stage.render(&mut out);
        }
        for redirect in &self.redirects {
            out.push(' ');
            redirect.render(&mut out);
        }
        out
    }

    /// Reduce per-stage exit codes to the pipeline's effective exit code.
    pub fn effective_code(&self, stage_codes: &[i32]) -> i32 {
        if self.pipefail {
            stage_codes.iter().copied().find(|c| *c != 0).unwrap_or(0)
        } else {
            stage_codes.last().copied().unwrap_or(0)
        }
    }
}

/// Quote a word so the lexer reads it back verbatim. Plain words pass
/// through untouched; anything else is single-quoted, with embedded single
/// quotes spliced via the `'\''` idiom the lexer reassembles.
pub(crate) fn quote_word(word: &str) -> String {
    if !word.is_empty() && word.chars().all(is_plain_char) {
        return word.to_string();
    }
    let mut out = String::with_capacity(word.len() + 2);
    out.push('\'');
    for c in word.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

fn is_plain_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '+' | ',' | '@' | '%')
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn renders_plain_pipeline() {
        let p = Pipeline::new(vec![
            Command::new(["echo", "hi"]),
            Command::new(["cat"]),
        ]);
        assert_eq!(p.render(), "echo hi | cat");
    }

    #[test]
    fn quotes_args_with_specials() {
        let p = Pipeline::new(vec![Command::new(["echo", "a b", "it's"])]);
        assert_eq!(p.render(), r"echo 'a b' 'it'\''s'");
    }

    #[test]
    fn renders_env_and_redirects() {
        let mut cmd = Command::new(["tool"]);
        cmd.env.insert("B".into(), "2".into());
        cmd.env.insert("A".into(), "a value".into());
        cmd.redirects.push(Redirect {
            op: RedirectOp::Out,
            fd: Some(2),
            target: RedirectTarget::Path("errs".into()),
        });
        let p = Pipeline::new(vec![cmd]);
        assert_eq!(p.render(), "A='a value' B=2 tool 2> errs");
    }

    #[test]
    fn renders_dup_fd_without_space() {
        let mut cmd = Command::new(["tool"]);
        cmd.redirects.push(Redirect {
            op: RedirectOp::DupOut,
            fd: Some(2),
            target: RedirectTarget::Fd(1),
        });
        let p = Pipeline::new(vec![cmd]);
        assert_eq!(p.render(), "tool 2>&1");
    }

    #[test]
    fn equality_ignores_env_insertion_order() {
        let mut a = Command::new(["x"]);
        a.env.insert("A".into(), "1".into());
        a.env.insert("B".into(), "2".into());
        let mut b = Command::new(["x"]);
        b.env.insert("B".into(), "2".into());
        b.env.insert("A".into(), "1".into());
        assert_eq!(a, b);
    }

    #[test]
    fn effective_code_reduction() {
        let plain = Pipeline::new(vec![Command::new(["a"]), Command::new(["b"])]);
        assert_eq!(plain.effective_code(&[2, 0]), 0);
        let strict = plain.clone().with_pipefail(true);
        assert_eq!(strict.effective_code(&[2, 0]), 2);
        assert_eq!(strict.effective_code(&[0, 3]), 3);
        assert_eq!(strict.effective_code(&[0, 0]), 0);
    }
}
