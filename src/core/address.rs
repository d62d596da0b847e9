//! Hierarchical addresses and wildcard matching.
//!
//! An address is a `.`-delimited list of words. Binding addresses may
//! contain `*` (exactly one word) and `#` (any number of words,
//! including none).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub const DELIMITER: char = '.';
pub const SINGLE_WORD: &str = "*";
pub const ANY_WORDS: &str = "#";

#[derive(Clone)]
pub struct Address {
    address: Arc<str>,
    parts: Arc<[String]>,
    contains_wildcard: bool,
}

impl Address {
    pub fn new(address: impl AsRef<str>) -> Self {
        let address = address.as_ref();
        let parts: Vec<String> = address.split(DELIMITER).map(str::to_string).collect();
        let contains_wildcard = parts.iter().any(|p| is_wildcard(p));
        Self {
            address: Arc::from(address),
            parts: parts.into(),
            contains_wildcard,
        }
    }

    fn from_parts(parts: Vec<String>) -> Self {
        let address = parts.join(&DELIMITER.to_string());
        let contains_wildcard = parts.iter().any(|p| is_wildcard(p));
        Self {
            address: Arc::from(address.as_str()),
            parts: parts.into(),
            contains_wildcard,
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.address
    }

    #[inline]
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    #[inline]
    pub fn contains_wildcard(&self) -> bool {
        self.contains_wildcard
    }

    /// Returns a copy of this address with the word at `pos` removed.
    /// Out of range positions return an unchanged copy.
    pub fn without_part(&self, pos: usize) -> Address {
        if pos >= self.parts.len() {
            return self.clone();
        }
        let mut parts = self.parts.to_vec();
        parts.remove(pos);
        Address::from_parts(parts)
    }

    /// Matches two addresses. When exactly one side carries wildcards it
    /// is used as the pattern; otherwise the full strings are compared.
    pub fn matches(&self, other: &Address) -> bool {
        if self.contains_wildcard == other.contains_wildcard {
            return self.address == other.address;
        }
        if self.contains_wildcard {
            match_parts(&self.parts, &other.parts)
        } else {
            match_parts(&other.parts, &self.parts)
        }
    }
}

#[inline]
fn is_wildcard(part: &str) -> bool {
    part == SINGLE_WORD || part == ANY_WORDS
}

/// Convenience wrapper over [`Address::matches`] for plain strings.
pub fn matches(pattern: &str, candidate: &str) -> bool {
    Address::new(pattern).matches(&Address::new(candidate))
}

/// Walks `pattern` against `words`. A `#` that is not the last pattern
/// word scans forward for the next pattern word and takes the first hit.
fn match_parts(pattern: &[String], words: &[String]) -> bool {
    let mut pos = 0;
    let mut mp = 0;

    while mp < pattern.len() {
        if pos >= words.len() {
            // Only a single trailing `#` may match zero remaining words.
            return mp == pattern.len() - 1 && pattern[mp] == ANY_WORDS;
        }

        let token = pattern[mp].as_str();
        if token == SINGLE_WORD {
            pos += 1;
            mp += 1;
        } else if token == ANY_WORDS {
            if mp == pattern.len() - 1 {
                return true;
            }
            let next = pattern[mp + 1].as_str();
            if next == SINGLE_WORD || next == ANY_WORDS {
                // `#.*` and `#.#`: the wildcard that follows decides.
                mp += 1;
                continue;
            }
            match words[pos..].iter().position(|w| w == next) {
                Some(offset) => {
                    pos += offset;
                    mp += 1;
                }
                None => return false,
            }
        } else {
            if token != words[pos] {
                return false;
            }
            pos += 1;
            mp += 1;
        }
    }

    pos == words.len()
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Address").field(&&*self.address).finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Address::new(value)
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Address::new(value)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
