//! Per-key cache of outbound bearer tokens
//!
//! Entries are created empty on first use and refreshed in place by the
//! issuer. Each entry sits behind its own mutex; the lock is only held to
//! read or update fields, never across a remote call.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::provider::Provider;
use crate::cache::{CacheStats, CacheStatsSnapshot};

/// A cached bearer token and its renewal bookkeeping
#[derive(Debug, Clone)]
pub struct CachedToken {
    /// Cache key
    pub key: String,
    /// Raw access token (`None` until the first successful request)
    pub token: Option<String>,
    /// Absolute expiry, ms since the epoch (0 when empty)
    pub expires_at_ms: u64,
    /// A remote renewal is outstanding
    pub renewing: bool,
    /// The outstanding renewal is a synchronous one for an expired token
    pub renewing_sync: bool,
    /// Bumped each time a renewal starts; only the latest may clear `renewing`
    pub renewal_generation: u64,
    /// Earliest time another background renewal may start
    pub early_retry_at_ms: u64,
    /// Earliest time another synchronous renewal may start while one is outstanding
    pub expired_retry_at_ms: u64,
    /// Scopes requested (replaced by the granted scopes on success)
    pub scopes: Vec<String>,
    /// Provider that issues this token
    pub provider: Arc<Provider>,
}

impl CachedToken {
    fn empty(key: &str, scopes: &[String], provider: &Arc<Provider>) -> Self {
        Self {
            key: key.to_string(),
            token: None,
            expires_at_ms: 0,
            renewing: false,
            renewing_sync: false,
            renewal_generation: 0,
            early_retry_at_ms: 0,
            expired_retry_at_ms: 0,
            scopes: scopes.to_vec(),
            provider: Arc::clone(provider),
        }
    }

    /// Mark a renewal as started and return its generation.
    pub fn begin_renewal(&mut self, sync: bool) -> u64 {
        self.renewing = true;
        self.renewing_sync = sync;
        self.renewal_generation = self.renewal_generation.wrapping_add(1);
        self.renewal_generation
    }

    /// Clear the renewing flags if `generation` is still the latest renewal.
    pub fn end_renewal(&mut self, generation: u64) {
        if self.renewal_generation == generation {
            self.renewing = false;
            self.renewing_sync = false;
        }
    }

    /// Expired (or never populated) at `now_ms`
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.token.is_none() || self.expires_at_ms <= now_ms
    }
}

/// Shared handle to one cache entry
pub type TokenSlot = Arc<Mutex<CachedToken>>;

/// Bounded token cache
///
/// When full, the entry closest to expiry is evicted so the tokens with the
/// most remaining life stay cached.
#[derive(Debug)]
pub struct TokenCache {
    entries: DashMap<String, TokenSlot>,
    capacity: usize,
    stats: CacheStats,
}

impl TokenCache {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            stats: CacheStats::default(),
        }
    }

    /// Existing entry for `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<TokenSlot> {
        self.entries.get(key).map(|slot| Arc::clone(slot.value()))
    }

    /// Entry for `key`, creating an empty one if absent.
    ///
    /// Creation goes through the map's entry API so concurrent callers for
    /// the same key always share one slot. The returned flag is `true` for
    /// the caller that created it.
    pub fn get_or_create(
        &self,
        key: &str,
        scopes: &[String],
        provider: &Arc<Provider>,
    ) -> (TokenSlot, bool) {
        if let Some(slot) = self.get(key) {
            self.stats.hit();
            return (slot, false);
        }

        if self.entries.len() >= self.capacity {
            self.evict_nearest_expiry();
        }

        let mut created = false;
        let slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(CachedToken::empty(key, scopes, provider)))
            })
            .value()
            .clone();

        if created {
            self.stats.miss();
        } else {
            self.stats.hit();
        }
        (slot, created)
    }

    /// Remove the entry closest to expiry, preferring entries with no
    /// renewal outstanding.
    fn evict_nearest_expiry(&self) {
        let victim = self
            .entries
            .iter()
            .map(|entry| {
                let token = entry.value().lock();
                (entry.key().clone(), token.renewing, token.expires_at_ms)
            })
            .min_by_key(|(_, renewing, expires_at)| (*renewing, *expires_at))
            .map(|(key, _, _)| key);

        if let Some(key) = victim {
            debug!(key = %key, "Evicting token nearest to expiry");
            self.entries.remove(&key);
            self.stats.evicted(1);
        }
    }

    /// Number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;

    fn provider() -> Arc<Provider> {
        Arc::new(Provider {
            id: "main".to_string(),
            config: ProviderConfig::default(),
        })
    }

    fn populate(cache: &TokenCache, key: &str, expires_at_ms: u64) {
        let (slot, _) = cache.get_or_create(key, &[], &provider());
        let mut token = slot.lock();
        token.token = Some(format!("tok-{key}"));
        token.expires_at_ms = expires_at_ms;
    }

    #[test]
    fn get_or_create_is_atomic_across_threads() {
        let cache = Arc::new(TokenCache::new(10));
        let provider = provider();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let provider = Arc::clone(&provider);
                std::thread::spawn(move || cache.get_or_create("svc:pet.r", &[], &provider).1)
            })
            .collect();

        let created: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();

        assert_eq!(created, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn full_cache_evicts_entry_nearest_to_expiry() {
        // GIVEN: a cache of two tokens with different remaining life
        let cache = TokenCache::new(2);
        populate(&cache, "short", 1_000);
        populate(&cache, "long", 9_000);

        // WHEN: a third key is added
        populate(&cache, "new", 5_000);

        // THEN: the token closest to expiry is gone
        assert!(cache.get("short").is_none());
        assert!(cache.get("long").is_some());
        assert!(cache.get("new").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn renewing_entries_are_evicted_last() {
        let cache = TokenCache::new(2);
        populate(&cache, "a", 1_000);
        populate(&cache, "b", 9_000);
        cache.get("a").unwrap().lock().renewing = true;

        populate(&cache, "c", 5_000);

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn new_entries_start_expired() {
        let cache = TokenCache::new(1);
        let (slot, created) = cache.get_or_create("k", &["a".to_string()], &provider());
        assert!(created);
        let token = slot.lock();
        assert!(token.is_expired(0));
        assert_eq!(token.scopes, vec!["a".to_string()]);
    }

    #[test]
    fn superseded_renewal_does_not_clear_newer_one() {
        // GIVEN: a background renewal that was overtaken by a retry
        let cache = TokenCache::new(1);
        let (slot, _) = cache.get_or_create("k", &[], &provider());
        let first = slot.lock().begin_renewal(false);
        let second = slot.lock().begin_renewal(true);

        // WHEN: the first attempt finishes late
        slot.lock().end_renewal(first);

        // THEN: the newer attempt is still recorded as outstanding
        assert!(slot.lock().renewing);
        assert!(slot.lock().renewing_sync);

        slot.lock().end_renewal(second);
        assert!(!slot.lock().renewing);
        assert!(!slot.lock().renewing_sync);
    }
}
