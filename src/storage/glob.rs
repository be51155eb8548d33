//! Shell-style glob patterns for key selection.
//!
//! Supported syntax:
//!
//! - `*` matches any sequence of bytes, including the empty one
//! - `?` matches exactly one byte
//! - `[abc]`, `[a-z]` match one byte from a set or range
//! - `[^a-z]` / `[!a-z]` match one byte outside the set
//! - `\x` matches `x` literally, also inside a class
//!
//! Patterns are compiled once into tokens, so matching a pattern against
//! every key of a large table does not re-parse it per key.

use thiserror::Error;

/// A pattern that cannot be compiled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("unterminated character class")]
    UnterminatedClass,

    #[error("empty character class")]
    EmptyClass,

    #[error("invalid range '{0}-{1}' in character class")]
    InvalidRange(char, char),

    #[error("pattern ends with a dangling escape")]
    DanglingEscape,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(u8),
    AnyByte,
    AnySequence,
    Class { negated: bool, ranges: Vec<(u8, u8)> },
}

impl Token {
    fn matches(&self, byte: u8) -> bool {
        match self {
            Token::Literal(c) => *c == byte,
            Token::AnyByte => true,
            Token::AnySequence => true,
            Token::Class { negated, ranges } => {
                let hit = ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&byte));
                hit != *negated
            }
        }
    }
}

/// A compiled glob pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobPattern {
    tokens: Vec<Token>,
}

impl GlobPattern {
    /// Compiles a pattern.
    pub fn new(pattern: impl AsRef<[u8]>) -> Result<Self, PatternError> {
        let pattern = pattern.as_ref();
        let mut tokens = Vec::with_capacity(pattern.len());
        let mut i = 0;

        while i < pattern.len() {
            match pattern[i] {
                b'*' => {
                    // `**` is the same as `*`
                    if tokens.last() != Some(&Token::AnySequence) {
                        tokens.push(Token::AnySequence);
                    }
                    i += 1;
                }
                b'?' => {
                    tokens.push(Token::AnyByte);
                    i += 1;
                }
                b'\\' => {
                    let c = *pattern.get(i + 1).ok_or(PatternError::DanglingEscape)?;
                    tokens.push(Token::Literal(c));
                    i += 2;
                }
                b'[' => {
                    let (token, consumed) = parse_class(&pattern[i + 1..])?;
                    tokens.push(token);
                    i += 1 + consumed;
                }
                c => {
                    tokens.push(Token::Literal(c));
                    i += 1;
                }
            }
        }

        Ok(Self { tokens })
    }

    /// Returns true if the whole of `text` matches the pattern.
    pub fn matches(&self, text: impl AsRef<[u8]>) -> bool {
        let text = text.as_ref();
        let tokens = &self.tokens;

        let (mut t, mut p) = (0usize, 0usize);
        // Position to resume from when the last `*` has to swallow one more byte.
        let mut backtrack: Option<(usize, usize)> = None;

        while t < text.len() {
            match tokens.get(p) {
                Some(Token::AnySequence) => {
                    backtrack = Some((p, t));
                    p += 1;
                }
                Some(token) if token.matches(text[t]) => {
                    p += 1;
                    t += 1;
                }
                _ => match backtrack {
                    Some((star, from)) => {
                        p = star + 1;
                        t = from + 1;
                        backtrack = Some((star, from + 1));
                    }
                    None => return false,
                },
            }
        }

        tokens[p..].iter().all(|token| *token == Token::AnySequence)
    }

    /// Returns true if the pattern is a bare `*`.
    pub fn matches_everything(&self) -> bool {
        self.tokens == [Token::AnySequence]
    }
}

/// Parses a class body (the bytes after `[`).
///
/// Returns the token and the number of bytes consumed, including the
/// closing `]`.
fn parse_class(body: &[u8]) -> Result<(Token, usize), PatternError> {
    let mut i = 0;
    let negated = matches!(body.first(), Some(b'^') | Some(b'!'));
    if negated {
        i += 1;
    }

    let mut ranges = Vec::new();
    loop {
        let lo = match body.get(i) {
            None => return Err(PatternError::UnterminatedClass),
            Some(b']') => break,
            Some(b'\\') => {
                i += 1;
                *body.get(i).ok_or(PatternError::UnterminatedClass)?
            }
            Some(c) => *c,
        };
        i += 1;

        let mut hi = lo;
        if body.get(i) == Some(&b'-') && body.get(i + 1).is_some_and(|c| *c != b']') {
            i += 1;
            hi = match body.get(i) {
                Some(b'\\') => {
                    i += 1;
                    *body.get(i).ok_or(PatternError::UnterminatedClass)?
                }
                Some(c) => *c,
                None => return Err(PatternError::UnterminatedClass),
            };
            i += 1;

            if lo > hi {
                return Err(PatternError::InvalidRange(lo as char, hi as char));
            }
        }

        ranges.push((lo, hi));
    }

    if ranges.is_empty() {
        return Err(PatternError::EmptyClass);
    }

    Ok((Token::Class { negated, ranges }, i + 1))
}

/// Returns true if `key` contains a glob metacharacter.
pub fn is_glob(key: &[u8]) -> bool {
    key.iter().any(|c| matches!(c, b'*' | b'?' | b'['))
}
