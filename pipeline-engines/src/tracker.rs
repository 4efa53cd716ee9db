//! Trackers: decide whether a repeated event should be processed again.
//!
//! A tracker keeps one value per evidence fingerprint. The first sighting
//! stores a fresh value and is always tracked; later sightings are passed to
//! [`TrackerHooks::matches`] together with the stored value.
//!
//! The lookup and the update are separate cache operations. Two threads
//! seeing a brand new key at the same moment may both treat it as a first
//! sighting; this is tolerated rather than serialized.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use pipeline_caching::CacheStats;
use pipeline_core::evidence::keys;
use pipeline_core::{
    ConfigError, ElementProperty, EvidenceKeyFilter, FlowData, FlowElement, PipelineResult,
    TypedKey,
};

use crate::aspect::AspectData;
use crate::cache::DataKeyedCache;
use crate::config::{CacheConfiguration, TrackerConfiguration};

/// Decides whether an event should be processed.
pub trait Tracker: Send + Sync {
    fn track(&self, data: &FlowData) -> bool;
}

/// Per-tracker policy plugged into [`DataKeyedTracker`].
pub trait TrackerHooks<V>: Send + Sync {
    /// Value stored on the first sighting of a key.
    fn new_value(&self, data: &FlowData) -> V;

    /// Whether a repeat sighting should be tracked, given the stored value.
    fn matches(&self, data: &FlowData, stored: &V) -> bool;

    /// Value stored after a tracked repeat.
    fn updated_value(&self, data: &FlowData, _stored: &V) -> V {
        self.new_value(data)
    }
}

/// Tracker over a fingerprint-keyed cache.
pub struct DataKeyedTracker<V, H> {
    cache: DataKeyedCache<V>,
    hooks: H,
}

impl<V, H> DataKeyedTracker<V, H>
where
    V: Clone + Send + Sync + 'static,
    H: TrackerHooks<V>,
{
    /// Build over an LRU cache. Trackers always overwrite stored values,
    /// whatever `update_existing` says.
    pub fn new(
        cache: &CacheConfiguration,
        filter: Arc<dyn EvidenceKeyFilter>,
        hooks: H,
    ) -> PipelineResult<Self> {
        let config = cache.clone().with_update_existing(true);
        Ok(Self {
            cache: DataKeyedCache::lru(&config, filter)?,
            hooks,
        })
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn reset(&self) {
        self.cache.reset()
    }
}

impl<V, H> Tracker for DataKeyedTracker<V, H>
where
    V: Clone + Send + Sync + 'static,
    H: TrackerHooks<V>,
{
    fn track(&self, data: &FlowData) -> bool {
        let key = self.cache.key_for(data);
        match self.cache.get_by_key(&key) {
            None => {
                self.cache.put_by_key(key, self.hooks.new_value(data));
                debug!(flow_data = %data.id(), "Tracker: first sighting");
                true
            }
            Some(stored) => {
                let track = self.hooks.matches(data, &stored);
                if track {
                    self.cache
                        .put_by_key(key, self.hooks.updated_value(data, &stored));
                }
                debug!(flow_data = %data.id(), track, "Tracker: repeat sighting");
                track
            }
        }
    }
}

impl<V, H> fmt::Debug for DataKeyedTracker<V, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKeyedTracker")
            .field("cache", &self.cache)
            .finish()
    }
}

// ============================================================================
// INTERVAL TRACKER
// ============================================================================

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Tracks a key again once `interval` has passed since it was last tracked.
pub struct IntervalHooks {
    interval: chrono::Duration,
    clock: Clock,
}

impl IntervalHooks {
    pub fn new(interval: Duration) -> PipelineResult<Self> {
        let interval = chrono::Duration::from_std(interval).map_err(|e| {
            ConfigError::invalid("interval", interval.as_millis(), &e.to_string())
        })?;
        Ok(Self {
            interval,
            clock: Arc::new(Utc::now),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn interval(&self) -> chrono::Duration {
        self.interval
    }
}

impl TrackerHooks<DateTime<Utc>> for IntervalHooks {
    fn new_value(&self, _data: &FlowData) -> DateTime<Utc> {
        (self.clock)()
    }

    fn matches(&self, _data: &FlowData, last_seen: &DateTime<Utc>) -> bool {
        (self.clock)() - *last_seen >= self.interval
    }
}

/// Time-windowed tracker.
pub type IntervalTracker = DataKeyedTracker<DateTime<Utc>, IntervalHooks>;

impl IntervalTracker {
    /// Build from tracker settings. With `per_session` set the session id
    /// becomes part of every key.
    pub fn from_config(
        config: &TrackerConfiguration,
        filter: Arc<dyn EvidenceKeyFilter>,
    ) -> PipelineResult<Self> {
        Self::from_config_with_clock(config, filter, Arc::new(Utc::now))
    }

    pub fn from_config_with_clock(
        config: &TrackerConfiguration,
        filter: Arc<dyn EvidenceKeyFilter>,
        clock: Clock,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let filter: Arc<dyn EvidenceKeyFilter> = if config.per_session {
            Arc::new(SessionKeyFilter::new(filter))
        } else {
            filter
        };
        let hooks = IntervalHooks::new(config.interval)?.with_clock(clock);
        Self::new(&config.cache, filter, hooks)
    }
}

/// Adds the session id to another filter, ahead of every other key.
#[derive(Debug)]
pub struct SessionKeyFilter {
    inner: Arc<dyn EvidenceKeyFilter>,
}

impl SessionKeyFilter {
    pub fn new(inner: Arc<dyn EvidenceKeyFilter>) -> Self {
        Self { inner }
    }

    fn is_session(key: &str) -> bool {
        key.eq_ignore_ascii_case(keys::SESSION_ID)
    }
}

impl EvidenceKeyFilter for SessionKeyFilter {
    fn include(&self, key: &str) -> bool {
        Self::is_session(key) || self.inner.include(key)
    }

    fn order(&self, key: &str) -> Option<i32> {
        if Self::is_session(key) {
            Some(i32::MAX)
        } else {
            self.inner.order(key)
        }
    }
}

// ============================================================================
// TRACKER ELEMENT
// ============================================================================

/// Name of the property holding the tracker's decision.
pub const TRACK_PROPERTY: &str = "track";

/// Flow element that records a tracker decision for every flow data.
pub struct TrackerElement {
    element_data_key: String,
    tracker: Arc<dyn Tracker>,
    filter: Arc<dyn EvidenceKeyFilter>,
    stop_on_repeat: bool,
}

impl TrackerElement {
    pub fn new(
        element_data_key: impl Into<String>,
        tracker: Arc<dyn Tracker>,
        filter: Arc<dyn EvidenceKeyFilter>,
    ) -> Self {
        Self {
            element_data_key: element_data_key.into(),
            tracker,
            filter,
            stop_on_repeat: false,
        }
    }

    /// Interval tracker element named `"tracker"` built from settings.
    pub fn interval(
        config: &TrackerConfiguration,
        filter: Arc<dyn EvidenceKeyFilter>,
    ) -> PipelineResult<Self> {
        let tracker = IntervalTracker::from_config(config, filter.clone())?;
        Ok(Self::new("tracker", Arc::new(tracker), filter)
            .with_stop_on_repeat(config.stop_on_repeat))
    }

    /// Stop the flow when the tracker declines the event.
    pub fn with_stop_on_repeat(mut self, stop: bool) -> Self {
        self.stop_on_repeat = stop;
        self
    }

    pub fn data_key(&self) -> TypedKey<AspectData> {
        TypedKey::new(self.element_data_key.clone())
    }

    /// Decision recorded for a processed flow data.
    pub fn decision(&self, data: &FlowData) -> PipelineResult<bool> {
        data.get(&self.data_key())?.get_as(TRACK_PROPERTY)
    }
}

impl FlowElement for TrackerElement {
    fn element_data_key(&self) -> &str {
        &self.element_data_key
    }

    fn evidence_key_filter(&self) -> Arc<dyn EvidenceKeyFilter> {
        self.filter.clone()
    }

    fn properties(&self) -> Vec<ElementProperty> {
        vec![ElementProperty::new(TRACK_PROPERTY, &self.element_data_key)]
    }

    fn process(&self, data: &FlowData) -> PipelineResult<()> {
        let track = self.tracker.track(data);
        let result = data.get_or_add(&self.data_key(), || {
            Arc::new(AspectData::new(self.element_data_key.clone()))
        })?;
        result.add_properties(self.properties());
        result.set(TRACK_PROPERTY, Value::Bool(track));
        if !track && self.stop_on_repeat {
            debug!(
                flow_data = %data.id(),
                element = %self.element_data_key,
                "Repeat event, stopping flow"
            );
            data.stop();
        }
        Ok(())
    }
}

impl fmt::Debug for TrackerElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerElement")
            .field("element_data_key", &self.element_data_key)
            .field("stop_on_repeat", &self.stop_on_repeat)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use pipeline_core::{Pipeline, WhitelistFilter};

    /// Clock advanced by hand.
    fn manual_clock() -> (Clock, Arc<Mutex<DateTime<Utc>>>) {
        let now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let source = now.clone();
        (Arc::new(move || *source.lock()), now)
    }

    fn flow_data(pairs: &[(&str, &str)]) -> FlowData {
        let data = Pipeline::builder().build().unwrap().create_flow_data().unwrap();
        for (k, v) in pairs {
            data.add_evidence(*k, *v).unwrap();
        }
        data
    }

    fn ip_filter() -> Arc<dyn EvidenceKeyFilter> {
        Arc::new(WhitelistFilter::new(["server.client-ip"]))
    }

    fn tracker(per_session: bool) -> (IntervalTracker, Arc<Mutex<DateTime<Utc>>>) {
        let (clock, now) = manual_clock();
        let config = TrackerConfiguration::new(Duration::from_millis(1000))
            .with_cache(CacheConfiguration::new(100))
            .with_per_session(per_session);
        (
            IntervalTracker::from_config_with_clock(&config, ip_filter(), clock).unwrap(),
            now,
        )
    }

    #[test]
    fn test_repeat_within_interval_is_not_tracked() {
        let (tracker, now) = tracker(false);
        let data = flow_data(&[("server.client-ip", "10.0.0.1")]);
        assert!(tracker.track(&data));
        *now.lock() += chrono::Duration::milliseconds(500);
        assert!(!tracker.track(&data));
    }

    #[test]
    fn test_repeat_after_interval_is_tracked() {
        let (tracker, now) = tracker(false);
        let data = flow_data(&[("server.client-ip", "10.0.0.1")]);
        assert!(tracker.track(&data));
        *now.lock() += chrono::Duration::milliseconds(1000);
        assert!(tracker.track(&data));
        // The window restarts from the tracked sighting.
        *now.lock() += chrono::Duration::milliseconds(999);
        assert!(!tracker.track(&data));
    }

    #[test]
    fn test_declined_repeat_does_not_extend_window() {
        let (tracker, now) = tracker(false);
        let data = flow_data(&[("server.client-ip", "10.0.0.1")]);
        assert!(tracker.track(&data));
        *now.lock() += chrono::Duration::milliseconds(600);
        assert!(!tracker.track(&data));
        *now.lock() += chrono::Duration::milliseconds(400);
        assert!(tracker.track(&data));
    }

    #[test]
    fn test_distinct_keys_are_independent() {
        let (tracker, _) = tracker(false);
        assert!(tracker.track(&flow_data(&[("server.client-ip", "10.0.0.1")])));
        assert!(tracker.track(&flow_data(&[("server.client-ip", "10.0.0.2")])));
        assert!(!tracker.track(&flow_data(&[("server.client-ip", "10.0.0.1")])));
    }

    #[test]
    fn test_sessions_do_not_interfere() {
        let (tracker, _) = tracker(true);
        let a = flow_data(&[("server.client-ip", "10.0.0.1"), (keys::SESSION_ID, "a")]);
        let b = flow_data(&[("server.client-ip", "10.0.0.1"), (keys::SESSION_ID, "b")]);
        assert!(tracker.track(&a));
        assert!(tracker.track(&b));
        assert!(!tracker.track(&a));
        assert!(!tracker.track(&b));
    }

    #[test]
    fn test_session_ignored_without_per_session() {
        let (tracker, _) = tracker(false);
        let a = flow_data(&[("server.client-ip", "10.0.0.1"), (keys::SESSION_ID, "a")]);
        let b = flow_data(&[("server.client-ip", "10.0.0.1"), (keys::SESSION_ID, "b")]);
        assert!(tracker.track(&a));
        assert!(!tracker.track(&b));
    }

    #[test]
    fn test_session_filter_orders_session_first() {
        let filter = SessionKeyFilter::new(ip_filter());
        assert_eq!(filter.order("Session.Id"), Some(i32::MAX));
        assert_eq!(filter.order("server.client-ip"), Some(0));
        assert_eq!(filter.order("query.x"), None);
    }
}
