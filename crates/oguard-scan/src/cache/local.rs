use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::fingerprint::Fingerprint;
use crate::pipeline::ScanResult;

struct Entry {
    verdict: ScanResult,
    expires_at: Instant,
}

/// Bounded in-process tier: least-recently-used eviction plus per-entry TTL.
pub struct LocalCache {
    entries: Mutex<LruCache<Fingerprint, Entry>>,
}

impl LocalCache {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<ScanResult> {
        let mut entries = self.entries.lock().ok()?;
        let expired = match entries.peek(fingerprint) {
            Some(entry) => entry.expires_at <= Instant::now(),
            None => return None,
        };
        if expired {
            entries.pop(fingerprint);
            return None;
        }
        // `get` (unlike `peek`) refreshes the LRU position.
        entries.get(fingerprint).map(|entry| entry.verdict.clone())
    }

    pub fn insert(&self, fingerprint: Fingerprint, verdict: ScanResult, ttl: Duration) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(
                fingerprint,
                Entry {
                    verdict,
                    expires_at: Instant::now() + ttl,
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> usize {
        match self.entries.lock() {
            Ok(mut entries) => {
                let count = entries.len();
                entries.clear();
                count
            }
            Err(_) => 0,
        }
    }

    /// Drop expired entries; returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let now = Instant::now();
        let expired: Vec<Fingerprint> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(fingerprint, _)| *fingerprint)
            .collect();
        for fingerprint in &expired {
            entries.pop(fingerprint);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Side;

    fn fp(text: &str) -> Fingerprint {
        Fingerprint::compute(Side::Input, text)
    }

    fn verdict(text: &str) -> ScanResult {
        ScanResult::trivially_allowed(text)
    }

    #[test]
    fn hit_then_expire() {
        let cache = LocalCache::new(10);
        cache.insert(fp("a"), verdict("a"), Duration::from_millis(30));
        assert!(cache.get(&fp("a")).is_some());
        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.get(&fp("a")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache = LocalCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.insert(fp("a"), verdict("a"), ttl);
        cache.insert(fp("b"), verdict("b"), ttl);
        // Touch "a" so "b" is the eviction candidate.
        assert!(cache.get(&fp("a")).is_some());
        cache.insert(fp("c"), verdict("c"), ttl);
        assert!(cache.get(&fp("a")).is_some());
        assert!(cache.get(&fp("b")).is_none());
        assert!(cache.get(&fp("c")).is_some());
    }

    #[test]
    fn cleanup_removes_only_expired() {
        let cache = LocalCache::new(10);
        cache.insert(fp("old"), verdict("old"), Duration::from_millis(1));
        cache.insert(fp("new"), verdict("new"), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.len(), 1);
    }
}
