//! Request fingerprints.
//!
//! A [`DataKey`] is an immutable, weighted sequence of evidence values used
//! as the cache key for engine results and trackers. It is derived only from
//! the evidence an element's filter includes, so unrelated evidence never
//! changes the fingerprint.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::evidence::Evidence;
use crate::filter::EvidenceKeyFilter;

/// One `(weight, name, value)` component of a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPart {
    pub weight: i32,
    pub name: String,
    pub value: String,
}

/// Immutable request fingerprint.
///
/// Cloning is cheap; the parts are shared.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DataKey {
    parts: Arc<[KeyPart]>,
}

impl DataKey {
    pub fn builder() -> DataKeyBuilder {
        DataKeyBuilder::default()
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.parts.iter().map(|p| (p.weight, &p.name, &p.value)))
            .finish()
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in self.parts.iter() {
            if !first {
                f.write_str("|")?;
            }
            first = false;
            write!(f, "{}={}", part.name, part.value)?;
        }
        Ok(())
    }
}

/// Accumulates weighted values and produces a [`DataKey`].
#[derive(Debug, Default)]
pub struct DataKeyBuilder {
    parts: Vec<KeyPart>,
}

impl DataKeyBuilder {
    /// Add a value. Names are case-insensitive, matching evidence lookup.
    pub fn add(mut self, weight: i32, name: &str, value: &Value) -> Self {
        self.push(weight, name, value);
        self
    }

    fn push(&mut self, weight: i32, name: &str, value: &Value) {
        self.parts.push(KeyPart {
            weight,
            name: name.to_lowercase(),
            value: canonical_value(value),
        });
    }

    /// Sort by descending weight; equal weights keep insertion order.
    pub fn build(mut self) -> DataKey {
        self.parts.sort_by(|a, b| b.weight.cmp(&a.weight));
        DataKey {
            parts: self.parts.into(),
        }
    }
}

/// String form used for value equality. Strings compare by content, every
/// other JSON value by its JSON text.
fn canonical_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Derives fingerprints from evidence.
pub trait EvidenceFingerprinter {
    fn fingerprint(&self, evidence: &Evidence) -> DataKey;
}

impl<F: EvidenceKeyFilter + ?Sized> EvidenceFingerprinter for F {
    fn fingerprint(&self, evidence: &Evidence) -> DataKey {
        let mut builder = DataKeyBuilder::default();
        for entry in evidence.iter() {
            if let Some(weight) = self.order(&entry.key) {
                builder.push(weight, &entry.key, &entry.value);
            }
        }
        builder.build()
    }
}

// =============================================================================
// TESTS
// =============================================================================
