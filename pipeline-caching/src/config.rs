//! LRU cache configuration

use serde::{Deserialize, Serialize};

use pipeline_core::{ConfigError, PipelineResult};

/// Construction parameters for the segmented LRU caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LruConfig {
    /// Total number of entries across all segments.
    pub capacity: usize,
    /// Requested number of independently locked segments.
    pub concurrency: usize,
    /// Replace the value of an existing key on `put`. When false the first
    /// write wins and the entry keeps its recency position.
    pub update_existing: bool,
}

impl Default for LruConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            concurrency: default_concurrency(),
            update_existing: true,
        }
    }
}

impl LruConfig {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_update_existing(mut self, update_existing: bool) -> Self {
        self.update_existing = update_existing;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid(
                "capacity",
                self.capacity,
                "capacity must be greater than 0",
            )
            .into());
        }
        if self.concurrency == 0 {
            return Err(ConfigError::invalid(
                "concurrency",
                self.concurrency,
                "concurrency must be greater than 0",
            )
            .into());
        }
        Ok(())
    }

    /// Segments actually created. Never more than the capacity, so every
    /// segment can hold at least one entry.
    pub fn segment_count(&self) -> usize {
        self.concurrency.min(self.capacity).max(1)
    }

    /// Capacity share of each segment. The remainder of the division goes
    /// to the first segments, so the shares always sum to `capacity`.
    pub fn segment_capacities(&self) -> Vec<usize> {
        let segments = self.segment_count();
        let base = self.capacity / segments;
        let remainder = self.capacity % segments;
        (0..segments)
            .map(|i| if i < remainder { base + 1 } else { base })
            .collect()
    }
}

/// Default segment count: the number of logical CPUs.
pub fn default_concurrency() -> usize {
    num_cpus::get().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::PipelineError;

    #[test]
    fn test_zero_capacity_rejected() {
        let result = LruConfig::new(0).validate();
        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::InvalidValue { ref field, .. }))
                if field == "capacity"
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(LruConfig::new(10).with_concurrency(0).validate().is_err());
    }

    #[test]
    fn test_remainder_goes_to_first_segments() {
        let config = LruConfig::new(10).with_concurrency(4);
        assert_eq!(config.segment_capacities(), vec![3, 3, 2, 2]);
    }

    #[test]
    fn test_segments_clamped_to_capacity() {
        let config = LruConfig::new(2).with_concurrency(8);
        assert_eq!(config.segment_count(), 2);
        assert_eq!(config.segment_capacities(), vec![1, 1]);
    }
}
