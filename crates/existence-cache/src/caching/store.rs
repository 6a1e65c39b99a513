use std::time::Duration;

use tokio::time::Instant;

use crate::config::CacheConfig;

/// A definitive answer for one identifier.
#[derive(Clone, Copy, Debug)]
struct CacheEntry {
    exists: bool,
    recorded_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.recorded_at.elapsed() < ttl
    }
}

/// Holds the last definitive answer per identifier.
///
/// Entries are never evicted because of their age. A stale entry is simply ignored by
/// [`get`](Self::get) and overwritten by the next [`put`](Self::put). The in-memory capacity
/// only bounds the number of distinct identifiers kept around.
///
/// Cloning is cheap and yields a handle to the same store.
#[derive(Clone)]
pub struct EntryStore {
    ttl: Duration,
    entries: moka::sync::Cache<String, CacheEntry>,
}

impl std::fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl EntryStore {
    pub fn new(config: &CacheConfig) -> Self {
        let entries = moka::sync::Cache::builder()
            .max_capacity(config.in_memory_capacity)
            .name("existence")
            .build();

        Self {
            ttl: config.ttl,
            entries,
        }
    }

    /// Returns the cached answer, unless there is none or it is older than the TTL.
    pub fn get(&self, identifier: &str) -> Option<bool> {
        let entry = self.entries.get(identifier)?;
        entry.is_fresh(self.ttl).then_some(entry.exists)
    }

    /// Records a definitive answer as of now.
    pub fn put(&self, identifier: &str, exists: bool) {
        let entry = CacheEntry {
            exists,
            recorded_at: Instant::now(),
        };
        self.entries.insert(identifier.to_owned(), entry);
    }

    /// Forgets every answer.
    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    /// The approximate number of stored answers, including stale ones.
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
