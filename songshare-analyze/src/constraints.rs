//! Compact tag store limits

use serde::{Deserialize, Serialize};

/// Limits of the compact tag container (`[constraints]`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagConstraints {
    pub max_key_len: usize,
    pub max_value_len: usize,
    /// Maximum number of tags in the merged set
    pub max_tags: usize,
}

impl Default for TagConstraints {
    fn default() -> Self {
        Self {
            max_key_len: 64,
            max_value_len: 256,
            max_tags: 256,
        }
    }
}

impl TagConstraints {
    /// Key is non-empty, within length and uses `[A-Za-z0-9_:.-]` only
    pub fn key_ok(&self, key: &str) -> bool {
        !key.is_empty()
            && key.len() <= self.max_key_len
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '.' | '-'))
    }

    /// Value is non-empty and within length (in characters)
    pub fn value_ok(&self, value: &str) -> bool {
        !value.is_empty() && value.chars().count() <= self.max_value_len
    }
}

/// Turn a free-form label into a tag key fragment
///
/// Lowercases and replaces every character outside the key charset with `_`
/// (`"vocal music"` => `"vocal_music"`).
pub fn key_fragment(label: &str) -> String {
    label
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
