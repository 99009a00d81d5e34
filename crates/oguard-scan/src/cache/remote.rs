use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use oguard_common::RemoteCacheConfig;

use crate::fingerprint::Fingerprint;
use crate::pipeline::ScanResult;

const KEY_PREFIX: &str = "oguard:scan:";

/// Network key-value tier. All operations are best-effort: any failure marks
/// the tier degraded and the facade continues on the local tier alone. A
/// background probe re-connects on a schedule and silently promotes back.
pub struct RemoteCache {
    config: RemoteCacheConfig,
    manager: RwLock<Option<ConnectionManager>>,
    healthy: AtomicBool,
}

impl RemoteCache {
    /// Construct and start the health-probe loop. Initial connection failure
    /// is not fatal; the probe keeps trying.
    pub async fn connect(config: RemoteCacheConfig) -> Arc<Self> {
        let cache = Arc::new(Self {
            config,
            manager: RwLock::new(None),
            healthy: AtomicBool::new(false),
        });

        if let Err(err) = cache.try_connect().await {
            warn!(error = %err, "remote scan cache unavailable at startup, running local-only");
        }

        let probe = Arc::clone(&cache);
        tokio::spawn(async move {
            let interval = Duration::from_secs(probe.config.reconnect_interval_secs.max(1));
            loop {
                tokio::time::sleep(interval).await;
                if probe.healthy.load(Ordering::Relaxed) {
                    continue;
                }
                match probe.try_connect().await {
                    Ok(()) => info!("remote scan cache recovered"),
                    Err(err) => debug!(error = %err, "remote scan cache still unavailable"),
                }
            }
        });

        cache
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn try_connect(&self) -> Result<(), redis::RedisError> {
        let client = redis::Client::open(self.config.url())?;
        let connect = ConnectionManager::new(client);
        let timeout = Duration::from_millis(self.config.connect_timeout_ms.max(1));
        let manager = match tokio::time::timeout(timeout, connect).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "connect timeout",
                )));
            }
        };
        *self.manager.write().await = Some(manager);
        self.healthy.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn degrade(&self, err: &redis::RedisError) {
        if self.healthy.swap(false, Ordering::Relaxed) {
            warn!(error = %err, "remote scan cache degraded, falling back to local tier");
        }
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.config.operation_timeout_ms.max(1))
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<ScanResult> {
        let mut manager = {
            let guard = self.manager.read().await;
            guard.clone()?
        };
        if !self.is_healthy() {
            return None;
        }

        let key = format!("{KEY_PREFIX}{}", fingerprint.to_hex());
        let fetched: Result<Option<String>, _> =
            match tokio::time::timeout(self.op_timeout(), manager.get(&key)).await {
                Ok(result) => result,
                Err(_) => {
                    self.healthy.store(false, Ordering::Relaxed);
                    warn!("remote scan cache read timed out, degrading");
                    return None;
                }
            };

        match fetched {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(verdict) => Some(verdict),
                Err(err) => {
                    debug!(error = %err, "discarding undecodable remote cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                self.degrade(&err);
                None
            }
        }
    }

    /// Best-effort write; never blocks the request path on failure.
    pub async fn set(&self, fingerprint: &Fingerprint, verdict: &ScanResult, ttl: Duration) {
        let mut manager = {
            let guard = self.manager.read().await;
            match guard.clone() {
                Some(manager) => manager,
                None => return,
            }
        };
        if !self.is_healthy() {
            return;
        }

        let raw = match serde_json::to_string(verdict) {
            Ok(raw) => raw,
            Err(err) => {
                debug!(error = %err, "verdict not serializable for remote cache");
                return;
            }
        };
        let key = format!("{KEY_PREFIX}{}", fingerprint.to_hex());
        let ttl_secs = ttl.as_secs().max(1);

        let written: Result<(), _> =
            match tokio::time::timeout(self.op_timeout(), manager.set_ex(&key, raw, ttl_secs)).await
            {
                Ok(result) => result,
                Err(_) => {
                    self.healthy.store(false, Ordering::Relaxed);
                    warn!("remote scan cache write timed out, degrading");
                    return;
                }
            };

        if let Err(err) = written {
            self.degrade(&err);
        }
    }

    /// Flush guard keys. Used by the admin cache-clear endpoint; failures
    /// only log.
    pub async fn clear(&self) {
        let mut manager = {
            let guard = self.manager.read().await;
            match guard.clone() {
                Some(manager) => manager,
                None => return,
            }
        };

        let keys: Result<Vec<String>, _> = match tokio::time::timeout(
            self.op_timeout(),
            manager.keys(format!("{KEY_PREFIX}*")),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => return,
        };
        let Ok(keys) = keys else { return };
        if keys.is_empty() {
            return;
        }
        let deleted: Result<(), _> =
            match tokio::time::timeout(self.op_timeout(), manager.del(keys)).await {
                Ok(result) => result,
                Err(_) => return,
            };
        if let Err(err) = deleted {
            self.degrade(&err);
        }
    }
}
