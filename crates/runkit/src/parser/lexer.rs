//! Lexer for directive text
//!
//! Tokenizes one directive line with shell-like quoting rules: single
//! quotes suppress everything, double quotes honor `\"`, `\\` and `\$`,
//! an unquoted backslash escapes the next character, and unquoted
//! whitespace separates tokens. Only the operator subset the dialect
//! documents is accepted; `||`, `&`, `&>` and here-documents are
//! rejected up front rather than silently misparsed.

use super::tokens::{RedirectOp, Token};
use crate::error::{Error, Result};

/// Lexer for a single directive's text.
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer for the given input.
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
        }
    }

    /// Tokenize the whole input.
    pub fn lex(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            while matches!(self.peek(), Some(c) if c.is_whitespace()) {
                self.advance();
            }
            let Some(c) = self.peek() else { break };
            let token = match c {
                '|' | '&' | ';' | '<' | '>' => self.lex_operator(None)?,
                _ => self.lex_word()?,
            };
            tokens.push(token);
        }
        Ok(tokens)
    }

    /// Split input into bare words, rejecting control operators. Used for
    /// flag strings carried in the environment, which share the directive
    /// quoting rules but may not contain pipes or redirections.
    pub fn split_words(input: &'a str) -> Result<Vec<String>> {
        let tokens = Lexer::new(input).lex()?;
        tokens
            .into_iter()
            .map(|token| match token {
                Token::Word { text, .. } => Ok(text),
                other => Err(Error::Syntax(format!(
                    "control token {other:?} not allowed here"
                ))),
            })
            .collect()
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn advance(&mut self) -> Option<char> {
        self.chars.next()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.advance();
            return true;
        }
        false
    }

    /// Lex a control or redirection operator. `fd` carries the numeric
    /// prefix when the operator was reached from a digits-only word, so
    /// `2>` arrives here as fd = Some(2).
    fn lex_operator(&mut self, fd: Option<i32>) -> Result<Token> {
        let c = self.advance().expect("caller peeked an operator");
        match c {
            '|' => {
                if self.eat('|') {
                    Err(Error::Syntax("'||' is not supported".into()))
                } else {
                    Ok(Token::Pipe)
                }
            }
            '&' => {
                if self.eat('&') {
                    Ok(Token::AndAnd)
                } else if self.peek() == Some('>') {
                    Err(Error::Syntax("'&>' is not supported".into()))
                } else {
                    Err(Error::Syntax("stray '&'".into()))
                }
            }
            ';' => Ok(Token::Semi),
            '>' => {
                if self.eat('>') {
                    Ok(Token::Redirect(RedirectOp::Append, fd))
                } else if self.eat('&') {
                    Ok(Token::Redirect(RedirectOp::DupOut, fd))
                } else {
                    Ok(Token::Redirect(RedirectOp::Out, fd))
                }
            }
            '<' => {
                if self.eat('<') {
                    Err(Error::Syntax("here-documents are not supported".into()))
                } else if self.peek() == Some('&') {
                    Err(Error::Syntax("'<&' is not supported".into()))
                } else {
                    Ok(Token::Redirect(RedirectOp::In, fd))
                }
            }
            other => Err(Error::Syntax(format!("unexpected operator '{other}'"))),
        }
    }

    /// Lex one word, tracking whether it can be an inline env assignment
    /// and whether a digits-only prefix turns a following `>`/`<` into an
    /// fd-qualified redirection (`2>errs` is one redirect, not a word).
    fn lex_word(&mut self) -> Result<Token> {
        let mut text = String::new();
        let mut quoted = false;
        let mut assign: Option<usize> = None;

        loop {
            let Some(c) = self.peek() else { break };
            match c {
                c if c.is_whitespace() => break,
                '|' | '&' | ';' => break,
                '>' | '<' => {
                    if !quoted && assign.is_none() && is_fd_prefix(&text) {
                        // `text` was just an fd number; fold it into the
                        // redirect token instead of emitting a word.
                        let fd = text.parse::<i32>().map_err(|_| {
                            Error::Syntax(format!("file descriptor out of range: {text}"))
                        })?;
                        return self.lex_operator(Some(fd));
                    }
                    break;
                }
                '\'' => {
                    self.advance();
                    quoted = true;
                    self.lex_single_quoted(&mut text)?;
                }
                '"' => {
                    self.advance();
                    quoted = true;
                    self.lex_double_quoted(&mut text)?;
                }
                '\\' => {
                    self.advance();
                    match self.advance() {
                        Some(escaped) => text.push(escaped),
                        None => return Err(Error::Syntax("escape at end of input".into())),
                    }
                }
                '=' => {
                    self.advance();
                    if assign.is_none() && !quoted && is_identifier(&text) {
                        assign = Some(text.len());
                    }
                    text.push('=');
                }
                _ => {
                    self.advance();
                    text.push(c);
                }
            }
        }
        Ok(Token::Word { text, assign })
    }

    /// Single quotes suppress all interpretation up to the closing quote.
    fn lex_single_quoted(&mut self, text: &mut String) -> Result<()> {
        loop {
            match self.advance() {
                Some('\'') => return Ok(()),
                Some(c) => text.push(c),
                None => return Err(Error::Syntax("unterminated single quote".into())),
            }
        }
    }

    /// Inside double quotes only `\"`, `\\` and `\$` are escapes; any other
    /// backslash is preserved literally.
    fn lex_double_quoted(&mut self, text: &mut String) -> Result<()> {
        loop {
            match self.advance() {
                Some('"') => return Ok(()),
                Some('\\') => match self.advance() {
                    Some(c @ ('"' | '\\' | '$')) => text.push(c),
                    Some(c) => {
                        text.push('\\');
                        text.push(c);
                    }
                    None => return Err(Error::Syntax("unterminated double quote".into())),
                },
                Some(c) => text.push(c),
                None => return Err(Error::Syntax("unterminated double quote".into())),
            }
        }
    }
}

/// Whether `text` is a plausible fd number prefix for a redirect (`2>`).
/// Bounded so absurd digit runs fall back to being ordinary words.
fn is_fd_prefix(text: &str) -> bool {
    !text.is_empty() && text.len() <= 4 && text.bytes().all(|b| b.is_ascii_digit())
}

/// Whether `text` is a valid environment variable name.
fn is_identifier(text: &str) -> bool {
    let mut bytes = text.bytes();
    match bytes.next() {
        Some(b) if b == b'_' || b.is_ascii_alphabetic() => {}
        _ => return false,
    }
    bytes.all(|b| b == b'_' || b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lex(input: &str) -> Vec<Token> {
        Lexer::new(input).lex().expect("lex failed")
    }

    #[test]
    fn words_split_on_whitespace() {
        assert_eq!(
            lex("echo hello  world"),
            vec![
                Token::word("echo"),
                Token::word("hello"),
                Token::word("world")
            ]
        );
    }

    #[test]
    fn single_quotes_suppress_everything() {
        assert_eq!(lex(r"'a | b $x'"), vec![Token::word("a | b $x")]);
    }

    #[test]
    fn double_quotes_allow_three_escapes() {
        assert_eq!(lex(r#""a \"b\" \$x \n""#), vec![Token::word(r#"a "b" $x \n"#)]);
    }

    #[test]
    fn backslash_escapes_outside_quotes() {
        assert_eq!(lex(r"a\ b c"), vec![Token::word("a b"), Token::word("c")]);
    }

    #[test]
    fn adjacent_quoted_parts_concatenate() {
        assert_eq!(lex(r#"a'b c'"d""#), vec![Token::word("ab cd")]);
    }

    #[test]
    fn pipe_and_sequencing() {
        assert_eq!(
            lex("a | b && c ; d"),
            vec![
                Token::word("a"),
                Token::Pipe,
                Token::word("b"),
                Token::AndAnd,
                Token::word("c"),
                Token::Semi,
                Token::word("d"),
            ]
        );
    }

    #[test]
    fn fd_prefixed_redirects() {
        assert_eq!(
            lex("cmd 2> errs"),
            vec![
                Token::word("cmd"),
                Token::Redirect(RedirectOp::Out, Some(2)),
                Token::word("errs"),
            ]
        );
        assert_eq!(
            lex("cmd 2>&1"),
            vec![
                Token::word("cmd"),
                Token::Redirect(RedirectOp::DupOut, Some(2)),
                Token::word("1"),
            ]
        );
    }

    #[test]
    fn plain_redirects() {
        assert_eq!(
            lex("cmd < in > out >> log"),
            vec![
                Token::word("cmd"),
                Token::Redirect(RedirectOp::In, None),
                Token::word("in"),
                Token::Redirect(RedirectOp::Out, None),
                Token::word("out"),
                Token::Redirect(RedirectOp::Append, None),
                Token::word("log"),
            ]
        );
    }

    #[test]
    fn assignment_detection() {
        assert_eq!(
            lex("FOO=bar cmd"),
            vec![
                Token::Word {
                    text: "FOO=bar".into(),
                    assign: Some(3)
                },
                Token::word("cmd"),
            ]
        );
        // Quoting the name part suppresses assignment treatment.
        assert_eq!(
            lex("'FOO'=bar"),
            vec![Token::Word {
                text: "FOO=bar".into(),
                assign: None
            }]
        );
        // Quoting the value does not.
        assert_eq!(
            lex("FOO='a b'"),
            vec![Token::Word {
                text: "FOO=a b".into(),
                assign: Some(3)
            }]
        );
        // Only the first `=` splits.
        assert_eq!(
            lex("A=b=c"),
            vec![Token::Word {
                text: "A=b=c".into(),
                assign: Some(1)
            }]
        );
    }

    #[test]
    fn digits_only_arg_stays_a_word() {
        assert_eq!(lex("echo 2 3"), vec![
            Token::word("echo"),
            Token::word("2"),
            Token::word("3")
        ]);
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert!(Lexer::new("echo 'oops").lex().is_err());
        assert!(Lexer::new("echo \"oops").lex().is_err());
    }

    #[test]
    fn unsupported_operators_are_errors() {
        assert!(Lexer::new("a || b").lex().is_err());
        assert!(Lexer::new("a & b").lex().is_err());
        assert!(Lexer::new("a &> b").lex().is_err());
        assert!(Lexer::new("a << b").lex().is_err());
    }

    #[test]
    fn split_words_handles_quoted_values() {
        assert_eq!(
            Lexer::split_words(r#"-j 4 -D name='a value'"#).unwrap(),
            vec!["-j", "4", "-D", "name=a value"]
        );
        assert!(Lexer::split_words("-j 4 | rm").is_err());
    }
}
