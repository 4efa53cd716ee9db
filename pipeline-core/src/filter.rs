//! Evidence-key filters.
//!
//! Every flow element declares which evidence it consumes through an
//! [`EvidenceKeyFilter`]. The filter doubles as the weighting scheme for
//! fingerprints: [`EvidenceKeyFilter::order`] supplies the weight of each
//! included key.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Predicate over evidence key names.
pub trait EvidenceKeyFilter: Send + Sync + fmt::Debug {
    /// Whether the element consumes the evidence named `key`.
    fn include(&self, key: &str) -> bool;

    /// Weight of `key` when building fingerprints, `None` if not included.
    fn order(&self, key: &str) -> Option<i32> {
        self.include(key).then_some(0)
    }
}

impl<F: EvidenceKeyFilter + ?Sized> EvidenceKeyFilter for Arc<F> {
    fn include(&self, key: &str) -> bool {
        (**self).include(key)
    }

    fn order(&self, key: &str) -> Option<i32> {
        (**self).order(key)
    }
}

/// Whitelist of evidence keys with per-key weights.
#[derive(Debug, Clone, Default)]
pub struct WhitelistFilter {
    whitelist: HashMap<String, i32>,
    case_sensitive: bool,
}

impl WhitelistFilter {
    /// Case-insensitive whitelist where every key has weight 0.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::weighted(keys.into_iter().map(|k| (k, 0)))
    }

    /// Case-insensitive whitelist with explicit weights. The first weight
    /// supplied for a key wins.
    pub fn weighted<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = (S, i32)>,
        S: Into<String>,
    {
        Self::build(keys, false)
    }

    /// Whitelist with exact key matching.
    pub fn case_sensitive<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = (S, i32)>,
        S: Into<String>,
    {
        Self::build(keys, true)
    }

    fn build<I, S>(keys: I, case_sensitive: bool) -> Self
    where
        I: IntoIterator<Item = (S, i32)>,
        S: Into<String>,
    {
        let mut filter = Self {
            whitelist: HashMap::new(),
            case_sensitive,
        };
        for (key, weight) in keys {
            filter.insert(key.into(), weight);
        }
        filter
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn whitelist(&self) -> &HashMap<String, i32> {
        &self.whitelist
    }

    fn normalize(&self, key: &str) -> String {
        if self.case_sensitive {
            key.to_string()
        } else {
            key.to_lowercase()
        }
    }

    fn insert(&mut self, key: String, weight: i32) {
        let key = self.normalize(&key);
        self.whitelist.entry(key).or_insert(weight);
    }
}

impl EvidenceKeyFilter for WhitelistFilter {
    fn include(&self, key: &str) -> bool {
        self.whitelist.contains_key(&self.normalize(key))
    }

    fn order(&self, key: &str) -> Option<i32> {
        self.whitelist.get(&self.normalize(key)).copied()
    }
}

/// Union of several filters.
///
/// Case-insensitive whitelists are merged into a single table; anything
/// else is kept as a sub-filter and consulted in insertion order.
#[derive(Debug, Default)]
pub struct FilterAggregator {
    merged: WhitelistFilter,
    filters: Vec<Arc<dyn EvidenceKeyFilter>>,
}

impl FilterAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_whitelist(&mut self, filter: &WhitelistFilter) {
        if filter.is_case_sensitive() {
            self.filters.push(Arc::new(filter.clone()));
            return;
        }
        for (key, weight) in filter.whitelist() {
            self.merged.insert(key.clone(), *weight);
        }
    }

    pub fn add_filter(&mut self, filter: Arc<dyn EvidenceKeyFilter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.merged.whitelist.len() + self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EvidenceKeyFilter for FilterAggregator {
    fn include(&self, key: &str) -> bool {
        self.merged.include(key) || self.filters.iter().any(|f| f.include(key))
    }

    fn order(&self, key: &str) -> Option<i32> {
        self.merged
            .order(key)
            .or_else(|| self.filters.iter().find_map(|f| f.order(key)))
    }
}

/// Filter that includes every key. Useful for elements that consume all
/// evidence.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncludeAll;

impl EvidenceKeyFilter for IncludeAll {
    fn include(&self, _key: &str) -> bool {
        true
    }
}
