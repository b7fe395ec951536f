// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Tag normalization
//!
//! Free-form tag strings arrive from capture agents in many shapes
//! (`"fraud-review"`, `"priority:high"`, `"env = prod"`). Every tag list is
//! normalized into a display string and a lowercase comparison token so that
//! filters can match tags regardless of spacing or case.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Structural classification of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    /// Plain label
    Simple,
    /// `key:value` or `key=value` pair
    Kv,
}

/// A normalized tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Original string as received.
    pub raw: String,
    pub kind: TagKind,
    /// Key (kv tags only).
    pub key: Option<String>,
    /// Value (kv tags only).
    pub value: Option<String>,
    /// Canonical human-facing form.
    pub display: String,
    /// Lowercase comparison key.
    pub token: String,
    /// Lowercase key, used for prefix-style lookups (kv tags only).
    pub key_token: Option<String>,
}

impl Tag {
    /// True for `key:value` tags.
    pub fn is_kv(&self) -> bool {
        self.kind == TagKind::Kv
    }
}

/// Normalize a single tag string.
///
/// Returns `None` for empty or whitespace-only input.
///
/// # Examples
/// ```
/// use opscope_core::{normalize_tag, TagKind};
///
/// let tag = normalize_tag("Priority = High").unwrap();
/// assert_eq!(tag.kind, TagKind::Kv);
/// assert_eq!(tag.display, "Priority:High");
/// assert_eq!(tag.token, "priority:high");
///
/// assert_eq!(normalize_tag(":broken").unwrap().kind, TagKind::Simple);
/// assert!(normalize_tag("   ").is_none());
/// ```
pub fn normalize_tag(input: &str) -> Option<Tag> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some((key, value)) = split_key_value(trimmed) {
        let display = format!("{}:{}", key, value);
        return Some(Tag {
            raw: input.to_string(),
            kind: TagKind::Kv,
            key_token: Some(key.to_lowercase()),
            key: Some(key.to_string()),
            value: Some(value.to_string()),
            token: display.to_lowercase(),
            display,
        });
    }

    Some(Tag {
        raw: input.to_string(),
        kind: TagKind::Simple,
        key: None,
        value: None,
        display: trimmed.to_string(),
        token: trimmed.to_lowercase(),
        key_token: None,
    })
}

/// Find the first interior `:` or `=` and split around it.
///
/// A separator in the first or last position does not count, and both halves
/// must be non-empty after trimming.
fn split_key_value(s: &str) -> Option<(&str, &str)> {
    let last = s.len() - 1;
    let (idx, _) = s
        .char_indices()
        .find(|&(i, c)| (c == ':' || c == '=') && i > 0 && i < last)?;

    let key = s[..idx].trim();
    let value = s[idx + 1..].trim();
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key, value))
}

/// Parallel display/token arrays produced from a raw tag list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedTags {
    /// Parsed tags in input order, deduplicated by token.
    pub parsed: Vec<Tag>,
}

impl NormalizedTags {
    /// Display strings, index-aligned with [`NormalizedTags::tokens`].
    pub fn displays(&self) -> Vec<String> {
        self.parsed.iter().map(|t| t.display.clone()).collect()
    }

    /// Comparison tokens, index-aligned with [`NormalizedTags::displays`].
    pub fn tokens(&self) -> Vec<String> {
        self.parsed.iter().map(|t| t.token.clone()).collect()
    }

    /// First kv tag whose key token is one of `keys`.
    pub fn value_for_keys(&self, keys: &[&str]) -> Option<&str> {
        self.parsed
            .iter()
            .filter(|t| t.is_kv())
            .find(|t| {
                t.key_token
                    .as_deref()
                    .map(|k| keys.contains(&k))
                    .unwrap_or(false)
            })
            .and_then(|t| t.value.as_deref())
    }
}

/// Normalize a tag list, dropping empties and duplicate tokens.
///
/// The first occurrence of a token wins, so display and token arrays stay
/// index-aligned.
pub fn normalize_tags<I, S>(tags: I) -> NormalizedTags
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let parsed = tags
        .into_iter()
        .filter_map(|t| normalize_tag(t.as_ref()))
        .filter(|t| seen.insert(t.token.clone()))
        .collect();
    NormalizedTags { parsed }
}
