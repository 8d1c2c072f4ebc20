//! Macro substitution for directive text
//!
//! Directives reference their test's context through `%`-macros: `%s` is
//! the unit's own path, `%{name}` any bound name. Substitution happens
//! exactly once, before parsing, in a single left-to-right scan, so a
//! substituted value is inserted literally and never re-interpreted as
//! shell syntax: a value containing `|` is data, not a pipe.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Shorthand letters with well-known meanings: `%s` the unit's path, `%S`
/// its directory, `%t` a unit-scoped temp file, `%T` a unit-scoped temp
/// dir. A shorthand used without a binding is an unresolved macro, not a
/// literal.
const SHORTHANDS: [char; 4] = ['s', 'S', 't', 'T'];

/// A substitution context: macro name to replacement value.
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    map: HashMap<String, String>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `value`, replacing any previous binding.
    pub fn define(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.map.insert(name.into(), value.into());
    }

    /// Overlay every binding from `other` onto this context.
    pub fn extend(&mut self, other: &Substitutions) {
        for (name, value) in &other.map {
            self.map.insert(name.clone(), value.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    /// Apply the context to one directive's text.
    ///
    /// `%%` escapes a literal percent; `%{name}` and shorthand `%s`-style
    /// tokens are replaced from the context or fail as unresolved. A `%`
    /// followed by anything else passes through untouched.
    pub fn apply(&self, text: &str) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.peek() {
                Some('%') => {
                    chars.next();
                    out.push('%');
                }
                Some('{') => {
                    chars.next();
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => {
                                return Err(Error::Syntax(format!(
                                    "unterminated macro reference in: {text}"
                                )));
                            }
                        }
                    }
                    match self.map.get(&name) {
                        Some(value) => out.push_str(value),
                        None => return Err(Error::UnresolvedMacro(name)),
                    }
                }
                Some(&c) if SHORTHANDS.contains(&c) => {
                    chars.next();
                    match self.map.get(c.to_string().as_str()) {
                        Some(value) => out.push_str(value),
                        None => return Err(Error::UnresolvedMacro(c.to_string())),
                    }
                }
                _ => out.push('%'),
            }
        }
        Ok(out)
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Substitutions {
    fn from(pairs: [(&str, &str); N]) -> Self {
        let mut subs = Self::new();
        for (name, value) in pairs {
            subs.define(name, value);
        }
        subs
    }
}
