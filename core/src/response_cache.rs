//! Response Cache: fingerprint → (Decision, explanation).
//!
//! Bounded LRU with a per-entry TTL:
//!
//! - `get` treats expired entries as absent and drops them (lazy expiry);
//!   a hit counts as use;
//! - `put` of a new key counts as use; when the cache is over capacity,
//!   expired entries are purged first and then the least-recently-used
//!   entry is evicted; expired entries are found through an index ordered
//!   by expiry, so a full cache costs `O(log n)` per insert;
//! - `invalidate_all` clears everything under one lock acquisition.
//!
//! The fingerprint includes the snapshot version, so entries computed
//! under an older policy can never be produced by a new request.
//!
//! A poisoned lock is treated as a miss on `get` and a no-op on `put`:
//! the cache never blocks or fails the request path.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::{CacheConfig, MAX_DURATION};
use crate::extractor::Locale;
use crate::policy_core::Decision;

/// Stable cache key: SHA-256 hex of
/// `(normalized question, role, locale, snapshot version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of one request.
    #[must_use]
    pub fn compute(normalized_question: &str, role: &str, locale: Locale, snapshot_version: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalized_question.as_bytes());
        hasher.update([0x1f]);
        hasher.update(role.trim().to_ascii_lowercase().as_bytes());
        hasher.update([0x1f]);
        hasher.update(locale.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(snapshot_version.to_be_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One cached answer.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Key this entry was stored under.
    pub fingerprint: Fingerprint,
    /// Decision computed for the request.
    pub decision: Decision,
    /// Explanation produced for the decision.
    pub explanation: String,
    /// Insertion time.
    pub created_at: Instant,
    /// `created_at + ttl`.
    pub expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Counters exposed by `status()` and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Whether the cache is enabled.
    pub enabled: bool,
    /// Current entry count.
    pub size: usize,
    /// Max entries.
    pub capacity: usize,
    /// Lookups that returned an entry.
    pub hits: u64,
    /// Lookups that returned nothing.
    pub misses: u64,
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    tick: u64,
    // key into `Inner::expiry`, fixed at insert.
    expiry_key: (Instant, u64),
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<Fingerprint, Slot>,
    // tick -> key, oldest first.
    recency: BTreeMap<u64, Fingerprint>,
    // (expires_at, insert tick) -> key, soonest first.
    expiry: BTreeMap<(Instant, u64), Fingerprint>,
    next_tick: u64,
}

impl Inner {
    fn touch(&mut self, fingerprint: &Fingerprint) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(slot) = self.entries.get_mut(fingerprint) {
            self.recency.remove(&slot.tick);
            slot.tick = tick;
            self.recency.insert(tick, fingerprint.clone());
        }
    }

    fn remove(&mut self, fingerprint: &Fingerprint) {
        if let Some(slot) = self.entries.remove(fingerprint) {
            self.recency.remove(&slot.tick);
            self.expiry.remove(&slot.expiry_key);
        }
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut purged = 0;
        while let Some((&(expires_at, _), fp)) = self.expiry.first_key_value() {
            if now < expires_at {
                break;
            }
            let fp = fp.clone();
            self.remove(&fp);
            purged += 1;
        }
        purged
    }

    fn evict_lru(&mut self) -> Option<Fingerprint> {
        let (_, fp) = self.recency.pop_first()?;
        if let Some(slot) = self.entries.remove(&fp) {
            self.expiry.remove(&slot.expiry_key);
        }
        Some(fp)
    }
}

/// Thread-safe bounded LRU cache with TTL.
#[derive(Debug)]
pub struct ResponseCache {
    inner: Mutex<Inner>,
    capacity: usize,
    default_ttl: Duration,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    /// Creates an enabled cache.
    #[must_use]
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            default_ttl,
            enabled: true,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Creates a cache from configuration.
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            ..Self::new(config.capacity, config.ttl())
        }
    }

    /// TTL applied by the node when storing answers.
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Whether lookups and writes are active.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lock(&self) -> Option<MutexGuard<'_, Inner>> {
        match self.inner.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!("response cache lock poisoned; treating as miss");
                None
            }
        }
    }

    /// Looks up an unexpired entry.
    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.get_at(fingerprint, Instant::now())
    }

    /// [`ResponseCache::get`] with an explicit clock.
    #[must_use]
    pub fn get_at(&self, fingerprint: &Fingerprint, now: Instant) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }
        let found = self.lock().and_then(|mut inner| {
            let expired = inner.entries.get(fingerprint)?.entry.is_expired(now);
            if expired {
                inner.remove(fingerprint);
                return None;
            }
            inner.touch(fingerprint);
            inner.entries.get(fingerprint).map(|slot| slot.entry.clone())
        });
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Stores an entry; last write for a key wins.
    pub fn put(&self, fingerprint: Fingerprint, decision: Decision, explanation: String, ttl: Duration) {
        self.put_at(fingerprint, decision, explanation, ttl, Instant::now());
    }

    /// [`ResponseCache::put`] with an explicit clock.
    pub fn put_at(
        &self,
        fingerprint: Fingerprint,
        decision: Decision,
        explanation: String,
        ttl: Duration,
        now: Instant,
    ) {
        if !self.enabled || self.capacity == 0 {
            return;
        }
        let Some(mut inner) = self.lock() else {
            return;
        };
        inner.remove(&fingerprint);
        let tick = inner.next_tick;
        inner.next_tick += 1;
        let expires_at = now + ttl.min(MAX_DURATION);
        inner.recency.insert(tick, fingerprint.clone());
        inner.expiry.insert((expires_at, tick), fingerprint.clone());
        inner.entries.insert(
            fingerprint.clone(),
            Slot {
                entry: CacheEntry {
                    fingerprint,
                    decision,
                    explanation,
                    created_at: now,
                    expires_at,
                },
                tick,
                expiry_key: (expires_at, tick),
            },
        );

        if inner.entries.len() > self.capacity {
            let purged = inner.purge_expired(now);
            while inner.entries.len() > self.capacity {
                match inner.evict_lru() {
                    Some(evicted) => debug!(fingerprint = %evicted, "response cache evicted LRU entry"),
                    None => break,
                }
            }
            if purged > 0 {
                debug!(purged, "response cache purged expired entries");
            }
        }
    }

    /// Drops every entry.
    pub fn invalidate_all(&self) {
        if let Some(mut inner) = self.lock() {
            let dropped = inner.entries.len();
            inner.entries.clear();
            inner.recency.clear();
            inner.expiry.clear();
            debug!(dropped, "response cache invalidated");
        }
    }

    /// Entry count (expired entries not yet purged included).
    #[must_use]
    pub fn size(&self) -> usize {
        self.lock().map_or(0, |inner| inner.entries.len())
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            enabled: self.enabled,
            size: self.size(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint::compute(&format!("question {n}"), "seller", Locale::En, 1)
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn fingerprint_covers_every_component() {
        let base = Fingerprint::compute("can i sell nike", "seller", Locale::En, 1);
        assert_eq!(base, Fingerprint::compute("can i sell nike", " Seller ", Locale::En, 1));
        assert_ne!(base, Fingerprint::compute("can i sell nike", "admin", Locale::En, 1));
        assert_ne!(base, Fingerprint::compute("can i sell nike", "seller", Locale::Fr, 1));
        assert_ne!(base, Fingerprint::compute("can i sell nike", "seller", Locale::En, 2));
        assert_eq!(base.as_str().len(), 64);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = ResponseCache::new(4, TTL);
        let t0 = Instant::now();
        cache.put_at(fp(1), Decision::allowed(1), "ok".into(), TTL, t0);

        let hit = cache.get_at(&fp(1), t0 + Duration::from_secs(59)).expect("fresh entry");
        assert_eq!(hit.explanation, "ok");
        assert!(cache.get_at(&fp(1), t0 + TTL).is_none());
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn get_refreshes_recency() {
        let cache = ResponseCache::new(2, TTL);
        let t0 = Instant::now();
        cache.put_at(fp(1), Decision::allowed(1), "a".into(), TTL, t0);
        cache.put_at(fp(2), Decision::allowed(1), "b".into(), TTL, t0);
        assert!(cache.get_at(&fp(1), t0).is_some());
        cache.put_at(fp(3), Decision::allowed(1), "c".into(), TTL, t0);

        assert!(cache.get_at(&fp(1), t0).is_some());
        assert!(cache.get_at(&fp(2), t0).is_none());
        assert!(cache.get_at(&fp(3), t0).is_some());
    }

    #[test]
    fn expired_entries_are_evicted_first() {
        let cache = ResponseCache::new(2, TTL);
        let t0 = Instant::now();
        cache.put_at(fp(1), Decision::allowed(1), "long".into(), TTL, t0);
        cache.put_at(fp(2), Decision::allowed(1), "short".into(), Duration::from_secs(1), t0);
        let later = t0 + Duration::from_secs(5);
        cache.put_at(fp(3), Decision::allowed(1), "new".into(), TTL, later);

        assert!(cache.get_at(&fp(1), later).is_some());
        assert!(cache.get_at(&fp(3), later).is_some());
        assert_eq!(cache.size(), 2);
    }

    #[test]
    fn full_cache_purges_only_what_has_expired() {
        let cache = ResponseCache::new(3, TTL);
        let t0 = Instant::now();
        cache.put_at(fp(1), Decision::allowed(1), "a".into(), TTL, t0);
        cache.put_at(fp(2), Decision::allowed(1), "b".into(), Duration::from_secs(1), t0);
        cache.put_at(fp(3), Decision::allowed(1), "c".into(), Duration::from_secs(2), t0);
        assert!(cache.get_at(&fp(2), t0).is_some());
        assert!(cache.get_at(&fp(3), t0).is_some());

        // both short-lived entries have expired even though fp(1) is least recently used
        let later = t0 + Duration::from_secs(3);
        cache.put_at(fp(4), Decision::allowed(1), "d".into(), TTL, later);
        assert_eq!(cache.size(), 2);

        // nothing expired now, so the LRU entry goes
        cache.put_at(fp(5), Decision::allowed(1), "e".into(), TTL, later);
        cache.put_at(fp(6), Decision::allowed(1), "f".into(), TTL, later);
        assert_eq!(cache.size(), 3);
        assert!(cache.get_at(&fp(1), later).is_none());
        assert!(cache.get_at(&fp(4), later).is_some());
        assert!(cache.get_at(&fp(6), later).is_some());
    }

    #[test]
    fn oversized_ttl_is_clamped() {
        let cache = ResponseCache::new(2, TTL);
        let t0 = Instant::now();
        cache.put_at(fp(1), Decision::allowed(1), "x".into(), Duration::MAX, t0);
        let entry = cache.get_at(&fp(1), t0).expect("entry");
        assert_eq!(entry.expires_at, t0 + MAX_DURATION);
    }

    #[test]
    fn last_write_wins() {
        let cache = ResponseCache::new(2, TTL);
        cache.put(fp(1), Decision::allowed(1), "first".into(), TTL);
        cache.put(fp(1), Decision::allowed(1), "second".into(), TTL);
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.get(&fp(1)).map(|e| e.explanation), Some("second".into()));
    }

    #[test]
    fn invalidate_all_clears() {
        let cache = ResponseCache::new(8, TTL);
        for n in 0..5 {
            cache.put(fp(n), Decision::allowed(1), "x".into(), TTL);
        }
        cache.invalidate_all();
        assert_eq!(cache.size(), 0);
        assert!(cache.get(&fp(0)).is_none());
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = ResponseCache::from_config(&CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        cache.put(fp(1), Decision::allowed(1), "x".into(), TTL);
        assert!(cache.get(&fp(1)).is_none());
        assert_eq!(cache.size(), 0);
    }

    proptest! {
        #[test]
        fn size_never_exceeds_capacity(capacity in 1usize..16, puts in 0u64..64) {
            let cache = ResponseCache::new(capacity, TTL);
            for n in 0..puts {
                cache.put(fp(n), Decision::allowed(1), String::new(), TTL);
            }
            let expected = usize::try_from(puts).unwrap_or(usize::MAX).min(capacity);
            prop_assert_eq!(cache.size(), expected);
            if usize::try_from(puts).unwrap_or(usize::MAX) > capacity {
                prop_assert!(cache.get(&fp(0)).is_none());
            }
        }
    }
}
