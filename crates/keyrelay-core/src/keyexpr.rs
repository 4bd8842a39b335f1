//! Key expressions: validated `/`-separated patterns with chunk wildcards.
//!
//! Grammar (a canonical subset of what pub/sub brokers accept):
//!
//! - Chunks are separated by `/`; there are no empty chunks, so no leading,
//!   trailing or doubled `/`.
//! - `*` as a whole chunk matches exactly one chunk.
//! - `**` as a whole chunk matches zero or more chunks.
//! - `$`, `?` and `#` are reserved and rejected, as is `*` inside a chunk.
//! - `**/**` is rejected as non-canonical.
//!
//! A key expression without wildcards is a *concrete key*. Samples always
//! carry concrete keys; subscriptions and queries use patterns.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Characters reserved by the broker grammar.
const FORBIDDEN_CHARS: [char; 3] = ['$', '?', '#'];

/// Single-chunk wildcard.
const SINGLE_WILD: &str = "*";

/// Multi-chunk wildcard.
const DOUBLE_WILD: &str = "**";

/// Why a string is not an acceptable key expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyExprError {
    /// The input was empty.
    #[error("key expression is empty")]
    Empty,
    /// `a//b`, `/a` or `a/`.
    #[error("key expression '{0}' contains an empty chunk")]
    EmptyChunk(String),
    /// A reserved character was used.
    #[error("key expression '{expr}' contains reserved character '{ch}'")]
    ForbiddenChar {
        /// The rejected input.
        expr: String,
        /// The offending character.
        ch: char,
    },
    /// `*` appeared inside a chunk, e.g. `temp/room*`.
    #[error("key expression '{0}' uses '*' inside a chunk")]
    PartialWildcard(String),
    /// `**/**` appeared.
    #[error("key expression '{0}' is not canonical ('**/**')")]
    NonCanonical(String),
    /// A pattern was given where a concrete key is required.
    #[error("'{0}' contains wildcards; a concrete key is required")]
    NotConcrete(String),
}

/// A validated key expression.
///
/// Cheap to clone (shared `Arc<str>`). Ordering, equality and hashing are
/// those of the underlying string, and the type borrows as `str` so maps
/// keyed by `KeyExpr` can be looked up with plain string slices.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyExpr(Arc<str>);

impl KeyExpr {
    /// Parse and validate a key expression (wildcards allowed).
    pub fn new(expr: &str) -> Result<Self, KeyExprError> {
        validate(expr)?;
        Ok(Self(Arc::from(expr)))
    }

    /// Parse a concrete key: a valid key expression without wildcards.
    pub fn concrete(key: &str) -> Result<Self, KeyExprError> {
        let parsed = Self::new(key)?;
        if parsed.is_wild() {
            return Err(KeyExprError::NotConcrete(key.to_owned()));
        }
        Ok(parsed)
    }

    /// The expression as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether any chunk is `*` or `**`.
    pub fn is_wild(&self) -> bool {
        self.chunks().any(|c| c == SINGLE_WILD || c == DOUBLE_WILD)
    }

    /// Iterate over the `/`-separated chunks.
    pub fn chunks(&self) -> std::str::Split<'_, char> {
        self.0.split('/')
    }

    /// Whether this pattern accepts the concrete `key`.
    ///
    /// Wildcard chunks in `key` are compared literally; use
    /// [`KeyExpr::intersects`] to compare two patterns.
    pub fn matches(&self, key: &KeyExpr) -> bool {
        let pattern: Vec<&str> = self.chunks().collect();
        let key: Vec<&str> = key.chunks().collect();
        match_chunks(&pattern, &key)
    }

    /// Whether at least one concrete key is accepted by both patterns.
    pub fn intersects(&self, other: &KeyExpr) -> bool {
        let a: Vec<&str> = self.chunks().collect();
        let b: Vec<&str> = other.chunks().collect();
        intersect_chunks(&a, &b)
    }
}

fn validate(expr: &str) -> Result<(), KeyExprError> {
    if expr.is_empty() {
        return Err(KeyExprError::Empty);
    }
    if let Some(ch) = expr.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(KeyExprError::ForbiddenChar {
            expr: expr.to_owned(),
            ch,
        });
    }
    let mut previous_double = false;
    for chunk in expr.split('/') {
        if chunk.is_empty() {
            return Err(KeyExprError::EmptyChunk(expr.to_owned()));
        }
        if chunk.contains('*') && chunk != SINGLE_WILD && chunk != DOUBLE_WILD {
            return Err(KeyExprError::PartialWildcard(expr.to_owned()));
        }
        let double = chunk == DOUBLE_WILD;
        if double && previous_double {
            return Err(KeyExprError::NonCanonical(expr.to_owned()));
        }
        previous_double = double;
    }
    Ok(())
}

/// `pattern` against `key`, bottom-up over suffix pairs.
///
/// `row[j]` holds whether the pattern suffix starting at `chunk` accepts
/// `key[j..]`. Each row only needs the one below it, so cost is
/// O(pattern × key) however many `**` chunks there are.
fn match_chunks(pattern: &[&str], key: &[&str]) -> bool {
    let m = key.len();
    let mut below = vec![false; m + 1];
    below[m] = true;
    let mut row = vec![false; m + 1];
    for chunk in pattern.iter().rev() {
        for j in (0..=m).rev() {
            row[j] = match *chunk {
                DOUBLE_WILD => below[j] || (j < m && row[j + 1]),
                SINGLE_WILD => j < m && below[j + 1],
                literal => j < m && key[j] == literal && below[j + 1],
            };
        }
        std::mem::swap(&mut below, &mut row);
    }
    below[0]
}

/// Whether `a` and `b` share a concrete key, over the same suffix table.
fn intersect_chunks(a: &[&str], b: &[&str]) -> bool {
    let width = b.len() + 1;
    // table[i * width + j]: a[i..] intersects b[j..]
    let mut table = vec![false; (a.len() + 1) * width];
    for i in (0..=a.len()).rev() {
        for j in (0..=b.len()).rev() {
            let (a_head, b_head) = (a.get(i).copied(), b.get(j).copied());
            table[i * width + j] = match (a_head, b_head) {
                (None, None) => true,
                (Some(DOUBLE_WILD), _) => {
                    table[(i + 1) * width + j] || (b_head.is_some() && table[i * width + j + 1])
                }
                (_, Some(DOUBLE_WILD)) => {
                    table[i * width + j + 1] || (a_head.is_some() && table[(i + 1) * width + j])
                }
                (Some(x), Some(y)) => {
                    (x == SINGLE_WILD || y == SINGLE_WILD || x == y) && table[(i + 1) * width + j + 1]
                }
                _ => false,
            };
        }
    }
    table[0]
}

impl fmt::Display for KeyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for KeyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyExpr({:?})", &*self.0)
    }
}

impl FromStr for KeyExpr {
    type Err = KeyExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for KeyExpr {
    type Error = KeyExprError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate(&value)?;
        Ok(Self(Arc::from(value)))
    }
}

impl TryFrom<&str> for KeyExpr {
    type Error = KeyExprError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<KeyExpr> for String {
    fn from(value: KeyExpr) -> Self {
        value.0.to_string()
    }
}

impl AsRef<str> for KeyExpr {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for KeyExpr {
    fn borrow(&self) -> &str {
        &self.0
    }
}
