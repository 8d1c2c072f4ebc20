//! Token types for the directive lexer

use serde::Serialize;

/// Redirection operators recognized by the dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RedirectOp {
    /// Redirect input (<)
    In,
    /// Redirect output (>)
    Out,
    /// Redirect output, appending (>>)
    Append,
    /// Duplicate an output file descriptor (>&, as in 2>&1)
    DupOut,
}

/// Token types produced by the lexer.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// A word after quote removal. `assign` is the byte offset of the `=`
    /// when the word looks like an unquoted NAME=value assignment: the name
    /// part was never quoted and is a valid identifier. Quoting any part of
    /// the name suppresses assignment treatment, so `'A=b'` stays a word.
    Word { text: String, assign: Option<usize> },

    /// Pipe (|)
    Pipe,

    /// Sequencing operator (&&)
    AndAnd,

    /// Sequencing operator (;)
    Semi,

    /// A redirection operator with the optional source fd that prefixed it
    /// (`2>` lexes as `Redirect(Out, Some(2))`).
    Redirect(RedirectOp, Option<i32>),
}

impl Token {
    /// Plain word with no assignment interpretation; test helper shorthand.
    #[cfg(test)]
    pub(crate) fn word(text: &str) -> Self {
        Token::Word {
            text: text.to_string(),
            assign: None,
        }
    }
}
