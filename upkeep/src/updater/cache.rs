use dashmap::DashMap;
use std::fmt::Debug;
use std::time::{Duration, Instant};

/// Key-value cache with per-entry expiry.
pub trait Cache: Debug + Send + Sync + 'static {
    /// Returns the value only if it has not yet expired.
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&self, key: &str, value: Vec<u8>, ttl: Duration);
    fn forget(&self, key: &str);
}

#[derive(Debug)]
struct Entry {
    expires: Instant,
    value: Vec<u8>,
}

/// Process-local cache. Expired entries are evicted lazily when read.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let expired = match self.entries.get(key) {
            Some(entry) if Instant::now() < entry.expires => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(key);
        }

        None
    }

    fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                expires: Instant::now() + ttl,
                value,
            },
        );
    }

    fn forget(&self, key: &str) {
        self.entries.remove(key);
    }
}
