//! Topic matching
//!
//! Routing keys and binding patterns are sequences of dot-separated words.
//! In a pattern `*` stands for exactly one word and `#` for zero or more
//! words; every other word must match literally (case-sensitive). Matching is
//! anchored at both ends.
//!
//! Patterns are compiled once into a [`TopicPattern`] when a binding is
//! created, so publish-time routing never re-parses or re-validates them.

use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Word {
    Literal(String),
    Star,
    Hash,
}

/// A validated binding pattern for topic exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    words: Vec<Word>,
}

impl TopicPattern {
    /// Parse and validate a pattern.
    ///
    /// The empty pattern is valid and matches only the empty routing key.
    /// Empty words (`a..b`, a leading or a trailing dot) are rejected.
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Ok(Self {
                raw: String::new(),
                words: Vec::new(),
            });
        }

        let mut words = Vec::new();
        for word in pattern.split('.') {
            let parsed = match word {
                "" => {
                    return Err(BrokerError::InvalidPattern {
                        pattern: pattern.to_string(),
                        reason: "empty word between dots",
                    });
                }
                "*" => Word::Star,
                "#" => Word::Hash,
                literal => Word::Literal(literal.to_string()),
            };
            // `#.#` accepts exactly what `#` accepts
            if parsed == Word::Hash && words.last() == Some(&Word::Hash) {
                continue;
            }
            words.push(parsed);
        }

        Ok(Self {
            raw: pattern.to_string(),
            words,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `routing_key` is accepted by this pattern.
    pub fn matches(&self, routing_key: &str) -> bool {
        if routing_key.is_empty() {
            return self.words.is_empty();
        }
        let key: Vec<&str> = routing_key.split('.').collect();
        match_words(&self.words, &key)
    }
}

/// Table-driven match, linear in `pattern.len() * key.len()` whatever the
/// number of `#` words.
fn match_words(pattern: &[Word], key: &[&str]) -> bool {
    // suffix[j]: the pattern words seen so far accept key[j..]
    let mut suffix = vec![false; key.len() + 1];
    suffix[key.len()] = true;

    for word in pattern.iter().rev() {
        let mut row = vec![false; key.len() + 1];
        for j in (0..=key.len()).rev() {
            let has_word = j < key.len();
            row[j] = match word {
                // zero words, or swallow one and keep `#` active
                Word::Hash => suffix[j] || (has_word && row[j + 1]),
                Word::Star => has_word && suffix[j + 1],
                Word::Literal(literal) => {
                    has_word && key[j] == literal.as_str() && suffix[j + 1]
                }
            };
        }
        suffix = row;
    }
    suffix[0]
}

/// One-shot match of `routing_key` against an uncompiled `pattern`.
///
/// Fails with [`BrokerError::InvalidPattern`] when the pattern is malformed.
pub fn matches(pattern: &str, routing_key: &str) -> Result<bool> {
    Ok(TopicPattern::parse(pattern)?.matches(routing_key))
}
