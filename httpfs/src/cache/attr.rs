use moka::future::Cache;

use crate::wire::Stat;

/// A successful `getattr` result as last seen from the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct AttrEntry {
    pub status: i32,
    pub stat: Stat,
}

/// Path keyed attribute cache.
///
/// Entries live until invalidated or evicted for capacity; there is no TTL.
/// Mutating verbs call [`AttrCache::invalidate`] before their request is
/// submitted.
#[derive(Clone)]
pub struct AttrCache {
    entries: Cache<String, AttrEntry>,
}

impl AttrCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::builder().max_capacity(capacity).build(),
        }
    }

    pub async fn lookup(&self, path: &str) -> Option<AttrEntry> {
        self.entries.get(path).await
    }

    pub async fn store(&self, path: &str, status: i32, stat: Stat) {
        self.entries
            .insert(path.to_string(), AttrEntry { status, stat })
            .await;
    }

    pub async fn invalidate(&self, path: &str) {
        self.entries.invalidate(path).await;
    }
}
