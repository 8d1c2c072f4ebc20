//! Error types for runkit
//!
//! Parser and macro errors mark only the offending directive's unit as
//! unresolved; spawn and I/O errors affect only that unit's verdict. None
//! of them abort a run. Cancellation is the single exception: it is always
//! operator-initiated and tears down every in-flight unit.
//!
//! Timeouts are deliberately NOT represented here. A timed-out execution is
//! a normal [`ProcessResult`](crate::exec::ProcessResult) tagged with a
//! [`TimeoutKind`](crate::exec::TimeoutKind); callers branch on the tag.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using runkit's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Runkit error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed directive text. Detected before anything is spawned.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// A directive referenced a macro with no binding in the unit's context.
    #[error("unresolved macro: %{{{0}}}")]
    UnresolvedMacro(String),

    /// An executable named by a pipeline stage could not be started.
    #[error("cannot spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A redirection target or scratch path was unusable.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A redirection that parses but cannot be executed, e.g. `3>&7`.
    #[error("unsupported redirect: {0}")]
    UnsupportedRedirect(String),

    /// The run was cancelled by the operator.
    #[error("run cancelled")]
    Cancelled,
}

impl Error {
    /// Create an I/O error tagged with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
