use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value as JsonValue, json};

use oguard_common::GuardConfig;
use oguard_scan::{Pipeline, ScanCache};

use crate::admission::AdmissionController;
use crate::upstream_client::UpstreamClient;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a request handler needs, constructed once in `main` and shared
/// immutably. The only runtime-mutable pieces live behind their own atomics
/// (scanner enable flags, per-model limits).
pub struct AppState {
    pub config: GuardConfig,
    pub cache: Arc<ScanCache>,
    pub input_pipeline: Arc<Pipeline>,
    pub output_pipeline: Arc<Pipeline>,
    pub admission: AdmissionController,
    pub upstream: Arc<dyn UpstreamClient>,
    pub started_at: Instant,
}

impl AppState {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Base URL with any trailing slash removed, ready for path concatenation.
    pub fn upstream_base(&self) -> &str {
        self.config.upstream.base_url.trim_end_matches('/')
    }

    /// Non-sensitive configuration view for `GET /config`. Remote cache
    /// credentials never leave the process.
    pub fn public_config(&self) -> JsonValue {
        let scan = &self.config.scan;
        json!({
            "upstream": { "base_url": self.config.upstream.base_url },
            "bind": { "host": self.config.bind.host, "port": self.config.bind.port },
            "admission": {
                "default_parallel": self.config.admission.default_parallel,
                "default_queue_limit": self.config.admission.default_queue_limit,
                "overrides": self.config.admission.overrides,
            },
            "scan": {
                "input_enabled": scan.input_enabled,
                "output_enabled": scan.output_enabled,
                "block_on_scanner_error": scan.block_on_scanner_error,
                "window_bytes": scan.window_bytes,
                "input_scanners": self.input_pipeline.scanners(),
                "output_scanners": self.output_pipeline.scanners(),
            },
            "cache": {
                "backend": self.config.cache.backend,
                "local_max_entries": self.config.cache.local_max_entries,
                "ttl_seconds": self.config.cache.ttl_seconds,
                "remote": {
                    "host": self.config.cache.remote.host,
                    "port": self.config.cache.remote.port,
                    "pool_size": self.config.cache.remote.pool_size,
                },
            },
            "ip_allowlist": self.config.ip_allowlist,
            "timeout": {
                "upstream_connect_secs": self.config.timeout.upstream_connect_secs,
                "upstream_idle_secs": self.config.timeout.upstream_idle_secs,
            },
        })
    }
}
