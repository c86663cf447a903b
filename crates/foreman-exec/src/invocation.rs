// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Parsing of internal-command invocation lines.
//!
//! The first whitespace-delimited token of a step's run string selects the
//! command; the remainder is tokenized shell-style (single/double quotes,
//! backslash escapes) into positional values and `key=value` pairs.  Values
//! coerce to bool, integer, float, or trimmed string, in that order.
//! Handlers that consume a free-form body (`apply_patch`) read the verbatim
//! remainder instead.

use std::collections::HashMap;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum InvocationError {
    #[error("empty internal command")]
    Empty,
    #[error("unmatched {0} quote")]
    UnmatchedQuote(char),
    #[error("dangling escape at end of input")]
    DanglingEscape,
}

/// One parsed argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ArgValue {
    /// Coerce a raw token: bool (case-insensitive), then i64, then f64,
    /// falling back to the trimmed string.
    pub fn coerce(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("true") {
            return ArgValue::Bool(true);
        }
        if trimmed.eq_ignore_ascii_case("false") {
            return ArgValue::Bool(false);
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return ArgValue::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return ArgValue::Float(f);
        }
        ArgValue::Text(trimmed.to_string())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ArgValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// A parsed internal-command invocation.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Command name as written (registry lookup is case-insensitive).
    pub name: String,
    pub positional: Vec<ArgValue>,
    pub named: HashMap<String, ArgValue>,
    /// Verbatim remainder after the command name, for body-consuming
    /// commands like `apply_patch`.
    pub rest: String,
}

/// Parse a full run string into an [`Invocation`].
pub fn parse_invocation(run: &str) -> Result<Invocation, InvocationError> {
    let trimmed = run.trim_start();
    if trimmed.is_empty() {
        return Err(InvocationError::Empty);
    }
    let name_end = trimmed
        .find(char::is_whitespace)
        .unwrap_or(trimmed.len());
    let name = trimmed[..name_end].to_string();
    let rest = trimmed[name_end..]
        .strip_prefix(['\n', ' ', '\t'])
        .unwrap_or(&trimmed[name_end..])
        .to_string();

    let tokens = tokenize(&rest)?;
    let mut positional = Vec::new();
    let mut named = HashMap::new();
    for token in tokens {
        match split_key_value(&token) {
            Some((key, value)) => {
                named.insert(key.to_string(), ArgValue::coerce(value));
            }
            None => positional.push(ArgValue::coerce(&token)),
        }
    }

    Ok(Invocation {
        name,
        positional,
        named,
        rest,
    })
}

/// Treat a token as `key=value` when the key part is a non-empty run of
/// word characters before the first `=`.
fn split_key_value(token: &str) -> Option<(&str, &str)> {
    let (key, value) = token.split_once('=')?;
    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return None;
    }
    Some((key, value))
}

/// Shell-style tokenizer: whitespace separates tokens; single and double
/// quotes group; backslash escapes the next character outside single quotes.
pub fn tokenize(input: &str) -> Result<Vec<String>, InvocationError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut have_token = false;
    let mut chars = input.chars();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some('"') => match c {
                '"' => quote = None,
                '\\' => match chars.next() {
                    Some(next) => current.push(next),
                    None => return Err(InvocationError::DanglingEscape),
                },
                _ => current.push(c),
            },
            _ => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    have_token = true;
                }
                '\\' => match chars.next() {
                    Some(next) => {
                        current.push(next);
                        have_token = true;
                    }
                    None => return Err(InvocationError::DanglingEscape),
                },
                c if c.is_whitespace() => {
                    if have_token {
                        tokens.push(std::mem::take(&mut current));
                        have_token = false;
                    }
                }
                _ => {
                    current.push(c);
                    have_token = true;
                }
            },
        }
    }

    if let Some(q) = quote {
        return Err(InvocationError::UnmatchedQuote(q));
    }
    if have_token {
        tokens.push(current);
    }
    Ok(tokens)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
