//! # Evaluation Cache
//!
//! Memoizes recent evaluations keyed by `sha256(image ‖ input ‖ config)`.
//! Only digest-pinned image references participate: a mutable tag can move
//! between evaluations, so its results are never cached. Bounded by entry
//! count with least-recently-used eviction; reads take the shared lock and
//! bump atomic counters, writes take the exclusive lock briefly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use sha2::{Digest, Sha256};

use crate::proto::EvaluateResponse;

//================================================================================================
// Types
//================================================================================================

/// A digest-keyed LRU cache of evaluation responses.
pub struct EvalCache {
    entries: RwLock<HashMap<[u8; 32], Entry>>,
    capacity: usize,
    clock: AtomicU64,
    hits: AtomicU64,
}

struct Entry {
    response: EvaluateResponse,
    last_used: AtomicU64,
}

//================================================================================================
// Impls
//================================================================================================

impl EvalCache {
    /// A cache retaining at most `capacity` evaluations.
    pub fn new(capacity: usize) -> Self {
        EvalCache {
            entries: RwLock::new(HashMap::new()),
            capacity,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// The cache key for one evaluation.
    pub fn key(image: &str, resource_list: &[u8], config: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(image.as_bytes());
        hasher.update(resource_list);
        hasher.update(config);
        hasher.finalize().into()
    }

    /// Looks up a prior evaluation, refreshing its recency on a hit.
    pub fn get(&self, key: &[u8; 32]) -> Option<EvaluateResponse> {
        let entries = self.entries.read().expect("eval cache poisoned");
        let entry = entries.get(key)?;
        entry
            .last_used
            .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.response.clone())
    }

    /// Stores an evaluation, evicting the least recently used entries once
    /// the capacity is reached.
    pub fn put(&self, key: [u8; 32], response: EvaluateResponse) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.write().expect("eval cache poisoned");
        while entries.len() >= self.capacity && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used.load(Ordering::Relaxed))
                .map(|(k, _)| *k);
            match oldest {
                Some(k) => entries.remove(&k),
                None => break,
            };
        }
        entries.insert(
            key,
            Entry {
                response,
                last_used: AtomicU64::new(self.clock.fetch_add(1, Ordering::Relaxed)),
            },
        );
    }

    /// How many lookups were served from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// How many evaluations are currently retained.
    pub fn len(&self) -> usize {
        self.entries.read().expect("eval cache poisoned").len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//================================================================================================
// Functions
//================================================================================================

/// The pinned digest of an image reference, if it has one.
///
/// Only references of the form `repo/name@sha256:…` are cacheable; a tag
/// can be re-pointed between evaluations.
pub fn pinned_digest(image: &str) -> Option<&str> {
    let (_, digest) = image.split_once('@')?;
    digest.starts_with("sha256:").then_some(digest)
}

//================================================================================================
// Tests
//================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn response(marker: &str) -> EvaluateResponse {
        EvaluateResponse {
            resource_list: marker.as_bytes().to_vec(),
            log: Vec::new(),
            results: Vec::new(),
        }
    }

    #[test]
    fn hit_returns_identical_bytes() {
        let cache = EvalCache::new(8);
        let key = EvalCache::key("img@sha256:aa", b"input", b"");
        cache.put(key, response("out"));

        let hit = cache.get(&key).unwrap();
        assert_eq!(hit.resource_list, b"out");
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn distinct_inputs_get_distinct_keys() {
        let a = EvalCache::key("img@sha256:aa", b"one", b"");
        let b = EvalCache::key("img@sha256:aa", b"two", b"");
        let c = EvalCache::key("img@sha256:bb", b"one", b"");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let cache = EvalCache::new(2);
        let k1 = EvalCache::key("img@sha256:aa", b"1", b"");
        let k2 = EvalCache::key("img@sha256:aa", b"2", b"");
        let k3 = EvalCache::key("img@sha256:aa", b"3", b"");

        cache.put(k1, response("1"));
        cache.put(k2, response("2"));
        cache.get(&k1); // k2 is now the oldest
        cache.put(k3, response("3"));

        assert!(cache.get(&k1).is_some());
        assert!(cache.get(&k2).is_none());
        assert!(cache.get(&k3).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn mutable_tags_are_not_pinned() {
        assert!(pinned_digest("example.com/fn/set-labels:v1").is_none());
        assert_eq!(
            pinned_digest("example.com/fn/set-labels@sha256:abcd"),
            Some("sha256:abcd")
        );
        assert!(pinned_digest("example.com/fn/set-labels@md5:xx").is_none());
    }
}
