/// Bounded set of recently seen message ids.
///
/// Backed by an `LruCache` that is only ever `put` and `contains`-probed
/// (never `get`), so recency never changes and eviction is FIFO in
/// insertion order. An evicted id can be reprocessed after extreme churn;
/// re-storing an identical message is idempotent.
use std::num::NonZeroUsize;

use lru::LruCache;

/// Default number of ids remembered.
pub const DEFAULT_CAPACITY: usize = 2000;

pub struct SeenSet {
    ids: LruCache<String, ()>,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ids: LruCache::new(cap),
        }
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.put(id.to_string(), ());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ids.cap().get()
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
