//! Segmented least-recently-used cache.
//!
//! The key space is split across independently locked segments chosen by
//! `hash(key) % segments`. Each segment keeps an exact recency list, so
//! eviction is strict LRU within a segment and approximate across the whole
//! cache. No operation ever holds more than one segment lock.
//!
//! A segment stores its nodes in a slab (`Vec<Option<Node>>`) and links them
//! by index, which gives O(1) unlink and relink without unsafe pointers.

use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use pipeline_core::PipelineResult;

use crate::config::LruConfig;
use crate::traits::{CacheStats, PutCache};

// ============================================================================
// SEGMENT
// ============================================================================

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Result of inserting into a segment.
pub(crate) enum Insert<V> {
    /// New entry linked at the head.
    Added { evicted: bool },
    /// Existing entry's value replaced and promoted.
    Replaced,
    /// Existing entry left untouched; carries the retained value.
    Kept(V),
}

/// One independently locked LRU list. Head is most recently used.
struct Segment<K, V> {
    capacity: usize,
    index: HashMap<K, usize>,
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: Hash + Eq + Clone, V: Clone> Segment<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            index: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn node(&self, slot: usize) -> Option<&Node<K, V>> {
        self.nodes.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node<K, V>> {
        self.nodes.get_mut(slot).and_then(Option::as_mut)
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.node(slot) {
            Some(node) => (node.prev, node.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = None;
        }
    }

    fn link_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(node) = self.node_mut(h) {
                node.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn promote(&mut self, slot: usize) {
        if self.head != Some(slot) {
            self.unlink(slot);
            self.link_front(slot);
        }
    }

    /// Unlink and free a slot, returning its node.
    fn take(&mut self, slot: usize) -> Option<Node<K, V>> {
        self.unlink(slot);
        let node = self.nodes.get_mut(slot).and_then(Option::take)?;
        self.index.remove(&node.key);
        self.free.push(slot);
        Some(node)
    }

    fn evict_tail(&mut self) -> bool {
        match self.tail {
            Some(slot) => self.take(slot).is_some(),
            None => false,
        }
    }

    fn get(&mut self, key: &K) -> Option<V> {
        let slot = *self.index.get(key)?;
        self.promote(slot);
        self.node(slot).map(|node| node.value.clone())
    }

    fn peek(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    fn insert(&mut self, key: K, value: V, update_existing: bool) -> Insert<V> {
        if let Some(&slot) = self.index.get(&key) {
            if !update_existing {
                return match self.node(slot) {
                    Some(node) => Insert::Kept(node.value.clone()),
                    None => Insert::Kept(value),
                };
            }
            if let Some(node) = self.node_mut(slot) {
                node.value = value;
            }
            self.promote(slot);
            return Insert::Replaced;
        }

        let evicted = self.len() >= self.capacity && self.evict_tail();

        let node = Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.link_front(slot);
        Insert::Added { evicted }
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let slot = *self.index.get(key)?;
        self.take(slot).map(|node| node.value)
    }

    fn clear(&mut self) {
        self.index.clear();
        self.nodes.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    /// Keys from most to least recently used.
    fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            match self.node(slot) {
                Some(node) => {
                    keys.push(node.key.clone());
                    cursor = node.next;
                }
                None => break,
            }
        }
        keys
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Thread-safe segmented LRU cache in put mode.
pub struct LruPutCache<K, V> {
    segments: Vec<Mutex<Segment<K, V>>>,
    hasher: RandomState,
    capacity: usize,
    update_existing: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> LruPutCache<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    /// Build a cache from a validated configuration.
    pub fn new(config: &LruConfig) -> PipelineResult<Self> {
        config.validate()?;
        let segments: Vec<_> = config
            .segment_capacities()
            .into_iter()
            .map(|share| Mutex::new(Segment::new(share)))
            .collect();
        debug!(
            capacity = config.capacity,
            segments = segments.len(),
            update_existing = config.update_existing,
            "LRU cache created"
        );
        Ok(Self {
            segments,
            hasher: RandomState::new(),
            capacity: config.capacity,
            update_existing: config.update_existing,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Shorthand for a cache with default concurrency and update-existing on.
    pub fn with_capacity(capacity: usize) -> PipelineResult<Self> {
        Self::new(&LruConfig::new(capacity))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn update_existing(&self) -> bool {
        self.update_existing
    }

    pub(crate) fn segment_index(&self, key: &K) -> usize {
        (self.hasher.hash_one(key) % self.segments.len() as u64) as usize
    }

    fn segment(&self, key: &K) -> &Mutex<Segment<K, V>> {
        &self.segments[self.segment_index(key)]
    }

    /// True if the key is resident. Does not affect recency or statistics.
    pub fn contains(&self, key: &K) -> bool {
        self.segment(key).lock().peek(key)
    }

    /// Value for the key without touching recency or statistics.
    pub(crate) fn peek(&self, key: &K) -> Option<V> {
        let segment = self.segment(key).lock();
        let slot = *segment.index.get(key)?;
        segment.node(slot).map(|node| node.value.clone())
    }

    /// Insert only if the key is absent and return the value now held for
    /// the key: either `value` or the one that was already there.
    pub fn put_if_absent(&self, key: K, value: V) -> V {
        let segment = self.segment(&key);
        let mut guard = segment.lock();
        match guard.insert(key, value.clone(), false) {
            Insert::Kept(existing) => existing,
            Insert::Added { evicted } => {
                drop(guard);
                if evicted {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                value
            }
            Insert::Replaced => value,
        }
    }

    /// Keys of one segment ordered from most to least recently used.
    pub fn segment_keys(&self, segment: usize) -> Vec<K> {
        self.segments
            .get(segment)
            .map(|s| s.lock().keys())
            .unwrap_or_default()
    }
}

impl<K, V> PutCache<K, V> for LruPutCache<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        let found = self.segment(key).lock().get(key);
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    fn put(&self, key: K, value: V) {
        let outcome = self
            .segment(&key)
            .lock()
            .insert(key, value, self.update_existing);
        if let Insert::Added { evicted: true } = outcome {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.segment(key).lock().remove(key)
    }

    fn reset(&self) {
        for segment in &self.segments {
            segment.lock().clear();
        }
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        debug!(capacity = self.capacity, "LRU cache reset");
    }

    fn len(&self) -> usize {
        self.segments.iter().map(|s| s.lock().len()).sum()
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
            ..CacheStats::default()
        }
    }
}

impl<K, V> fmt::Debug for LruPutCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruPutCache")
            .field("capacity", &self.capacity)
            .field("segments", &self.segments.len())
            .field("update_existing", &self.update_existing)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
