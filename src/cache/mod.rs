//! Bounded, time-expiring store of origin responses

use crate::config::CacheConfig;
use crate::models::CachedResponse;
use crate::utils::time::{age, now};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Process-wide response cache keyed by `host:port:path`.
///
/// Every operation takes the single internal lock. Eviction is by oldest
/// capture time, not by recency of use.
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CachedResponse>>,
    ttl: Duration,
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        debug!("Creating response cache (ttl: {:?}, max_entries: {})", ttl, max_entries);
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs), config.max_entries)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CachedResponse>> {
        // Entries are replaced wholesale, so a poisoned map is still consistent
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a fresh entry. Expired entries are left for the next `put` to sweep.
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        self.get_at(key, now())
    }

    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<CachedResponse> {
        let cache = self.lock();
        match cache.get(key) {
            Some(entry) if age(entry.timestamp, now) <= self.ttl => {
                debug!("Cache HIT for {}", key);
                Some(entry.clone())
            }
            Some(_) => {
                debug!("Cache entry expired for {}", key);
                None
            }
            None => {
                debug!("Cache MISS for {}", key);
                None
            }
        }
    }

    /// Sweep expired entries, evict the oldest if still full, then insert or overwrite `key`.
    pub fn put(&self, key: &str, data: Bytes, etag: Option<String>, last_modified: Option<String>) {
        self.put_at(key, data, etag, last_modified, now());
    }

    pub fn put_at(
        &self,
        key: &str,
        data: Bytes,
        etag: Option<String>,
        last_modified: Option<String>,
        now: DateTime<Utc>,
    ) {
        let mut cache = self.lock();

        let initial_count = cache.len();
        cache.retain(|_, entry| age(entry.timestamp, now) <= self.ttl);
        let expired = initial_count - cache.len();
        if expired > 0 {
            debug!("Cleaned up {} expired cache entries", expired);
        }

        // Evicts even when `key` is already present
        if cache.len() >= self.max_entries {
            let oldest = cache
                .iter()
                .min_by_key(|(_, entry)| entry.timestamp)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                cache.remove(&oldest);
                debug!("Evicted oldest cache entry: {}", oldest);
            }
        }

        debug!("Cached {} ({} bytes)", key, data.len());
        cache.insert(
            key.to_string(),
            CachedResponse {
                data,
                timestamp: now,
                etag,
                last_modified,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cache_info(&self) -> String {
        format!("Response cache: {}/{} entries", self.len(), self.max_entries)
    }
}
