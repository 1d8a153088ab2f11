//! Verification result cache
//!
//! Maps a SHA-256 of the raw token (optionally scoped by path prefix) to the
//! claims it verified to. Entries live for a fixed TTL regardless of the
//! token's own expiry, so callers re-check `exp` on every hit.

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::warn;

use super::claims::VerifiedClaims;
use crate::cache::{CacheStats, CacheStatsSnapshot};
use crate::clock::Clock;

struct CachedResult {
    claims: Arc<VerifiedClaims>,
    cached_at_ms: u64,
}

/// TTL cache of verified claims
pub struct ResultCache {
    entries: DashMap<String, CachedResult>,
    ttl_ms: u64,
    full_size: usize,
    clock: Arc<dyn Clock>,
    stats: CacheStats,
}

impl ResultCache {
    /// Create a cache with a fixed entry TTL; `full_size` only triggers a warning.
    #[must_use]
    pub fn new(ttl: Duration, full_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            full_size,
            clock,
            stats: CacheStats::default(),
        }
    }

    /// Cache key for `token`, scoped by `prefix` when given.
    #[must_use]
    pub fn key(prefix: Option<&str>, token: &str) -> String {
        let mut hasher = Sha256::new();
        if let Some(prefix) = prefix {
            hasher.update(prefix.as_bytes());
            hasher.update(b":");
        }
        hasher.update(token.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    /// Claims cached under `key` if the entry has not outlived its TTL.
    pub fn get(&self, key: &str) -> Option<Arc<VerifiedClaims>> {
        let now = self.clock.now_millis();
        if let Some(entry) = self.entries.get(key) {
            if now.saturating_sub(entry.cached_at_ms) < self.ttl_ms {
                self.stats.hit();
                return Some(Arc::clone(&entry.claims));
            }
            drop(entry);
            self.entries.remove(key);
            self.stats.evicted(1);
        }
        self.stats.miss();
        None
    }

    /// Cache claims under `key`.
    pub fn put(&self, key: String, claims: Arc<VerifiedClaims>) {
        self.entries.insert(
            key,
            CachedResult {
                claims,
                cached_at_ms: self.clock.now_millis(),
            },
        );
        let size = self.entries.len();
        if size > self.full_size {
            warn!(size, full_size = self.full_size, "Verification result cache above full size");
        }
    }

    /// Remove one entry (token found expired on a hit)
    pub fn remove(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.stats.evicted(1);
        }
    }

    /// Drop entries older than the TTL; returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.cached_at_ms) < self.ttl_ms);
        let removed = before.saturating_sub(self.entries.len());
        self.stats.evicted(removed as u64);
        removed
    }

    /// Number of entries
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
