//! Reclaimable cache slots for message handles.
//!
//! Every header, publish descriptor and body chunk a handle holds in memory
//! lives here, keyed by `(MessageId, Slot)`. The cache is bounded by an entry
//! count and a byte budget; when either is exceeded the least recently used
//! slots are evicted. Eviction is invisible to correctness: a handle that
//! misses simply refetches from its store.
//!
//! # Design Principles
//!
//! - A miss is never an error
//! - Values are immutable `Arc`s, so racing writers of one slot are harmless
//! - Explicit reclamation (`reclaim`, `reclaim_message`, `clear`) behaves
//!   exactly like eviction under memory pressure

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use broker_config::CacheConfig;
use lru::LruCache;
use parking_lot::Mutex;

use crate::types::{ContentChunk, ContentHeader, MessageId, PublishDescriptor};

/// Fixed weight charged to every slot on top of its payload.
pub const SLOT_OVERHEAD: usize = 64;

/// Which reclaimable value of a message a cache entry holds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Slot {
    Header,
    Publish,
    Chunk(usize),
}

#[derive(Clone, Debug)]
enum CachedValue {
    Header(Arc<ContentHeader>),
    Publish(Arc<PublishDescriptor>),
    Chunk(Arc<ContentChunk>),
}

impl CachedValue {
    fn weight(&self) -> usize {
        match self {
            CachedValue::Header(_) | CachedValue::Publish(_) => SLOT_OVERHEAD,
            CachedValue::Chunk(chunk) => SLOT_OVERHEAD + chunk.len(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: CachedValue,
    weight: usize,
}

/// Point-in-time counters of a [`ReclaimableCache`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: usize,
}

#[derive(Debug)]
struct CacheInner {
    /// Entry bound is enforced by `evict_until_within`, alongside the byte
    /// budget, so the map itself is unbounded.
    entries: LruCache<(MessageId, Slot), Entry>,
    by_message: HashMap<MessageId, BTreeSet<Slot>>,
    bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheInner {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            by_message: HashMap::new(),
            bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn lookup(&mut self, key: (MessageId, Slot)) -> Option<CachedValue> {
        match self.entries.get(&key) {
            Some(entry) => {
                self.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn forget_slot(&mut self, key: &(MessageId, Slot), entry: &Entry) {
        self.bytes = self.bytes.saturating_sub(entry.weight);
        if let Some(slots) = self.by_message.get_mut(&key.0) {
            slots.remove(&key.1);
            if slots.is_empty() {
                self.by_message.remove(&key.0);
            }
        }
    }

    fn remove(&mut self, key: &(MessageId, Slot)) -> bool {
        let Some(entry) = self.entries.pop(key) else {
            return false;
        };
        self.forget_slot(key, &entry);
        true
    }

    fn insert(&mut self, key: (MessageId, Slot), value: CachedValue) {
        self.remove(&key);
        let weight = value.weight();
        self.entries.put(key, Entry { value, weight });
        self.by_message.entry(key.0).or_default().insert(key.1);
        self.bytes = self.bytes.saturating_add(weight);
    }

    fn evict_until_within(&mut self, max_entries: usize, max_bytes: usize) {
        while self.entries.len() > max_entries || self.bytes > max_bytes {
            let Some((key, evicted)) = self.entries.pop_lru() else {
                break;
            };
            self.forget_slot(&key, &evicted);
            self.evictions += 1;
            tracing::trace!(message_id = %key.0, slot = ?key.1, "cache: evicted slot");
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.by_message.clear();
        self.bytes = 0;
    }
}

/// A bounded cache of message slots shared by many handles.
#[derive(Debug)]
pub struct ReclaimableCache {
    max_entries: usize,
    max_bytes: usize,
    inner: Mutex<CacheInner>,
}

impl ReclaimableCache {
    /// Creates a cache holding at most `max_entries` slots weighing at most
    /// `max_bytes` in total.
    pub fn with_capacity(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            max_entries,
            max_bytes,
            inner: Mutex::new(CacheInner::new()),
        }
    }

    /// Creates a cache from configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::with_capacity(config.max_entries, config.max_bytes)
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn header(&self, id: MessageId) -> Option<Arc<ContentHeader>> {
        match self.inner.lock().lookup((id, Slot::Header)) {
            Some(CachedValue::Header(header)) => Some(header),
            _ => None,
        }
    }

    pub fn publish(&self, id: MessageId) -> Option<Arc<PublishDescriptor>> {
        match self.inner.lock().lookup((id, Slot::Publish)) {
            Some(CachedValue::Publish(publish)) => Some(publish),
            _ => None,
        }
    }

    pub fn chunk(&self, id: MessageId, index: usize) -> Option<Arc<ContentChunk>> {
        match self.inner.lock().lookup((id, Slot::Chunk(index))) {
            Some(CachedValue::Chunk(chunk)) => Some(chunk),
            _ => None,
        }
    }

    pub fn put_header(&self, id: MessageId, header: Arc<ContentHeader>) {
        self.put((id, Slot::Header), CachedValue::Header(header));
    }

    pub fn put_publish(&self, id: MessageId, publish: Arc<PublishDescriptor>) {
        self.put((id, Slot::Publish), CachedValue::Publish(publish));
    }

    pub fn put_chunk(&self, id: MessageId, index: usize, chunk: Arc<ContentChunk>) {
        self.put((id, Slot::Chunk(index)), CachedValue::Chunk(chunk));
    }

    fn put(&self, key: (MessageId, Slot), value: CachedValue) {
        let mut inner = self.inner.lock();
        if value.weight() > self.max_bytes {
            // Too large to ever fit; a stale smaller value must not linger.
            inner.remove(&key);
            tracing::trace!(message_id = %key.0, slot = ?key.1, "cache: slot exceeds byte budget");
            return;
        }
        inner.insert(key, value);
        inner.evict_until_within(self.max_entries, self.max_bytes);
    }

    /// Returns true if the slot currently holds a value. Does not touch
    /// recency or hit counters.
    pub fn contains(&self, id: MessageId, slot: Slot) -> bool {
        self.inner.lock().entries.contains(&(id, slot))
    }

    /// Drops one slot. Returns true if it held a value.
    pub fn reclaim(&self, id: MessageId, slot: Slot) -> bool {
        self.inner.lock().remove(&(id, slot))
    }

    /// Drops every slot of a message. Returns how many were dropped.
    pub fn reclaim_message(&self, id: MessageId) -> usize {
        let mut inner = self.inner.lock();
        let slots: Vec<Slot> = inner
            .by_message
            .get(&id)
            .map(|slots| slots.iter().copied().collect())
            .unwrap_or_default();
        slots
            .into_iter()
            .filter(|slot| inner.remove(&(id, *slot)))
            .count()
    }

    /// Drops every slot of every message.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            entries: inner.entries.len(),
            bytes: inner.bytes,
        }
    }
}
