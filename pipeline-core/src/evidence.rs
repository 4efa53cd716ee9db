//! Evidence carried into a pipeline.
//!
//! Evidence is an insertion-ordered bag of named values. Key lookup is
//! case-insensitive; the key as first supplied is kept for display and for
//! fingerprints.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Common evidence key prefixes.
pub mod keys {
    pub const HEADER_PREFIX: &str = "header";
    pub const QUERY_PREFIX: &str = "query";
    pub const COOKIE_PREFIX: &str = "cookie";
    pub const SESSION_ID: &str = "session.id";
    pub const SESSION_SEQUENCE: &str = "session.sequence";
    pub const SEPARATOR: char = '.';
}

/// A single evidence entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceEntry {
    pub key: String,
    pub value: Value,
}

/// Insertion-ordered, case-insensitive evidence store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Evidence {
    entries: Vec<EvidenceEntry>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Evidence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a value. Replacing keeps the original position.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if self.index.len() != self.entries.len() {
            self.reindex();
        }
        let lookup = key.to_lowercase();
        match self.index.get(&lookup) {
            Some(&position) => self.entries[position].value = value,
            None => {
                self.index.insert(lookup, self.entries.len());
                self.entries.push(EvidenceEntry { key, value });
            }
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.add(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.position(key).map(|position| &self.entries[position].value)
    }

    /// String view of a value, `None` when the key is absent or not a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, e)| (e.key.to_lowercase(), position))
            .collect();
    }

    fn position(&self, key: &str) -> Option<usize> {
        if self.index.len() != self.entries.len() {
            // Deserialized instances arrive without an index.
            return self
                .entries
                .iter()
                .position(|e| e.key.eq_ignore_ascii_case(key));
        }
        self.index.get(&key.to_lowercase()).copied()
    }
}

impl<K, V> FromIterator<(K, V)> for Evidence
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut evidence = Evidence::new();
        for (key, value) in iter {
            evidence.add(key, value);
        }
        evidence
    }
}
