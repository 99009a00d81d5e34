mod local;
#[cfg(feature = "remote-cache")]
mod remote;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::warn;

use oguard_common::{CacheBackendMode, CacheConfig};

use crate::fingerprint::Fingerprint;
use crate::pipeline::ScanResult;

use local::LocalCache;
#[cfg(feature = "remote-cache")]
use remote::RemoteCache;

#[derive(Debug, Default)]
struct CacheStats {
    hits_local: AtomicU64,
    hits_remote: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    stores: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    pub backend: &'static str,
    pub local_entries: usize,
    pub remote_healthy: bool,
    pub hits_local: u64,
    pub hits_remote: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub stores: u64,
}

/// Fingerprint -> verdict store with a bounded local tier, an optional remote
/// tier, and single-flight semantics for the scans that fill it.
pub struct ScanCache {
    mode: CacheBackendMode,
    ttl: Duration,
    local: LocalCache,
    #[cfg(feature = "remote-cache")]
    remote: Option<Arc<RemoteCache>>,
    inflight: Mutex<HashMap<Fingerprint, watch::Receiver<Option<ScanResult>>>>,
    stats: CacheStats,
}

impl ScanCache {
    pub async fn new(config: &CacheConfig) -> Arc<Self> {
        #[cfg(feature = "remote-cache")]
        let remote = match config.backend {
            CacheBackendMode::LocalOnly => None,
            CacheBackendMode::Auto | CacheBackendMode::RemoteOnly => {
                Some(RemoteCache::connect(config.remote.clone()).await)
            }
        };
        #[cfg(not(feature = "remote-cache"))]
        if config.backend != CacheBackendMode::LocalOnly {
            warn!("built without the remote-cache feature; scan cache runs local-only");
        }

        Arc::new(Self {
            mode: config.backend,
            ttl: Duration::from_secs(config.ttl_seconds.max(1)),
            local: LocalCache::new(config.local_max_entries),
            #[cfg(feature = "remote-cache")]
            remote,
            inflight: Mutex::new(HashMap::new()),
            stats: CacheStats::default(),
        })
    }

    /// Local-only construction for tests and embedded use.
    pub fn local_only(max_entries: usize, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            mode: CacheBackendMode::LocalOnly,
            ttl,
            local: LocalCache::new(max_entries),
            #[cfg(feature = "remote-cache")]
            remote: None,
            inflight: Mutex::new(HashMap::new()),
            stats: CacheStats::default(),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn remote_healthy(&self) -> bool {
        #[cfg(feature = "remote-cache")]
        {
            self.remote
                .as_ref()
                .map(|remote| remote.is_healthy())
                .unwrap_or(false)
        }
        #[cfg(not(feature = "remote-cache"))]
        {
            false
        }
    }

    async fn remote_get(&self, fingerprint: &Fingerprint) -> Option<ScanResult> {
        #[cfg(feature = "remote-cache")]
        {
            self.remote.as_ref()?.get(fingerprint).await
        }
        #[cfg(not(feature = "remote-cache"))]
        {
            let _ = fingerprint;
            None
        }
    }

    async fn remote_set(&self, fingerprint: &Fingerprint, verdict: &ScanResult) {
        #[cfg(feature = "remote-cache")]
        if let Some(remote) = &self.remote {
            remote.set(fingerprint, verdict, self.ttl).await;
        }
        #[cfg(not(feature = "remote-cache"))]
        {
            let _ = (fingerprint, verdict);
        }
    }

    /// Check local first, then the remote tier; remote hits are promoted
    /// into the local tier.
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<ScanResult> {
        if self.mode != CacheBackendMode::RemoteOnly
            && let Some(verdict) = self.local.get(fingerprint)
        {
            self.stats.hits_local.fetch_add(1, Ordering::Relaxed);
            return Some(verdict);
        }

        if self.mode != CacheBackendMode::LocalOnly
            && let Some(verdict) = self.remote_get(fingerprint).await
        {
            self.stats.hits_remote.fetch_add(1, Ordering::Relaxed);
            if self.mode != CacheBackendMode::RemoteOnly {
                self.local.insert(*fingerprint, verdict.clone(), self.ttl);
            }
            return Some(verdict);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write both tiers. The remote write is best-effort and never blocks a
    /// request on remote failure (the tier degrades internally).
    pub async fn store(&self, fingerprint: &Fingerprint, verdict: &ScanResult) {
        self.stats.stores.fetch_add(1, Ordering::Relaxed);
        if self.mode != CacheBackendMode::RemoteOnly {
            self.local.insert(*fingerprint, verdict.clone(), self.ttl);
        }
        if self.mode != CacheBackendMode::LocalOnly {
            self.remote_set(fingerprint, verdict).await;
        }
    }

    /// Cached scan with single-flight: concurrent callers for one
    /// fingerprint coalesce onto a single computation, whose verdict is
    /// broadcast to every waiter. The computation runs as a detached task,
    /// so a waiter (or the initiating request) going away never aborts it.
    ///
    /// `store_verdict` is false for scans over partial streaming output,
    /// which must never populate the cache.
    pub async fn scan_or_join<F>(
        self: &Arc<Self>,
        fingerprint: Fingerprint,
        compute: F,
        store_verdict: bool,
    ) -> ScanResult
    where
        F: Future<Output = ScanResult> + Send + 'static,
    {
        if let Some(hit) = self.lookup(&fingerprint).await {
            return hit;
        }

        enum Slot {
            Lead(watch::Sender<Option<ScanResult>>, watch::Receiver<Option<ScanResult>>),
            Join(watch::Receiver<Option<ScanResult>>),
        }

        let slot = {
            let mut inflight = match self.inflight.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(rx) = inflight.get(&fingerprint) {
                Slot::Join(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                inflight.insert(fingerprint, rx.clone());
                Slot::Lead(tx, rx)
            }
        };

        let mut rx = match slot {
            Slot::Join(rx) => {
                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                rx
            }
            Slot::Lead(tx, rx) => {
                let cache = Arc::clone(self);
                tokio::spawn(async move {
                    let verdict = compute.await;
                    let _ = tx.send(Some(verdict.clone()));
                    if store_verdict {
                        cache.store(&fingerprint, &verdict).await;
                    }
                    let mut inflight = match cache.inflight.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    inflight.remove(&fingerprint);
                });
                rx
            }
        };

        loop {
            if let Some(verdict) = rx.borrow_and_update().clone() {
                return verdict;
            }
            if rx.changed().await.is_err() {
                warn!("scan computation dropped without a verdict");
                return ScanResult::aborted();
            }
        }
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            backend: match self.mode {
                CacheBackendMode::Auto => "auto",
                CacheBackendMode::LocalOnly => "local-only",
                CacheBackendMode::RemoteOnly => "remote-only",
            },
            local_entries: self.local.len(),
            remote_healthy: self.remote_healthy(),
            hits_local: self.stats.hits_local.load(Ordering::Relaxed),
            hits_remote: self.stats.hits_remote.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            coalesced: self.stats.coalesced.load(Ordering::Relaxed),
            stores: self.stats.stores.load(Ordering::Relaxed),
        }
    }

    /// Drop every entry in both tiers; returns the local count removed.
    pub async fn clear(&self) -> usize {
        let removed = self.local.clear();
        #[cfg(feature = "remote-cache")]
        if let Some(remote) = &self.remote {
            remote.clear().await;
        }
        removed
    }

    /// Drop expired local entries; returns how many were removed.
    pub fn cleanup(&self) -> usize {
        self.local.cleanup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Side;
    use std::sync::atomic::AtomicUsize;

    fn fp(text: &str) -> Fingerprint {
        Fingerprint::compute(Side::Input, text)
    }

    #[tokio::test]
    async fn store_then_lookup_roundtrip() {
        let cache = ScanCache::local_only(16, Duration::from_secs(60));
        let verdict = ScanResult::trivially_allowed("hello");
        cache.store(&fp("hello"), &verdict).await;
        assert_eq!(cache.lookup(&fp("hello")).await, Some(verdict));
        assert!(cache.lookup(&fp("other")).await.is_none());
    }

    #[tokio::test]
    async fn ttl_expiry_misses() {
        let cache = ScanCache::local_only(16, Duration::from_millis(20));
        cache
            .store(&fp("short"), &ScanResult::trivially_allowed("short"))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.lookup(&fp("short")).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_flight_coalesces_concurrent_scans() {
        let cache = ScanCache::local_only(16, Duration::from_secs(60));
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            let executions = Arc::clone(&executions);
            handles.push(tokio::spawn(async move {
                cache
                    .scan_or_join(
                        fp("same"),
                        async move {
                            executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            ScanResult::trivially_allowed("same")
                        },
                        true,
                    )
                    .await
            }));
        }

        for handle in handles {
            let verdict = handle.await.expect("join");
            assert!(verdict.allowed);
            assert_eq!(verdict.sanitized, "same");
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        // The store happens on the detached task; give it a beat, then a
        // fresh lookup hits.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.lookup(&fp("same")).await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiter_cancellation_leaves_computation_running() {
        let cache = ScanCache::local_only(16, Duration::from_secs(60));

        let leader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .scan_or_join(
                        fp("slow"),
                        async {
                            tokio::time::sleep(Duration::from_millis(80)).await;
                            ScanResult::trivially_allowed("slow")
                        },
                        true,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A joiner that gives up early must not abort the shared scan.
        let joiner = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .scan_or_join(fp("slow"), async { ScanResult::aborted() }, true)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        joiner.abort();

        let verdict = leader.await.expect("leader join");
        assert!(verdict.allowed);
        assert_eq!(verdict.sanitized, "slow");
    }

    #[tokio::test]
    async fn transient_scans_do_not_store() {
        let cache = ScanCache::local_only(16, Duration::from_secs(60));
        let verdict = cache
            .scan_or_join(
                fp("partial"),
                async { ScanResult::trivially_allowed("partial") },
                false,
            )
            .await;
        assert!(verdict.allowed);
        // Give the detached task a beat to finish bookkeeping.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.lookup(&fp("partial")).await.is_none());
    }
}
