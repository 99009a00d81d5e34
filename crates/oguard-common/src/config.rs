use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Final, merged configuration used by the running process.
///
/// Merge order: defaults < config file < environment < CLI flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub upstream: UpstreamConfig,
    pub bind: BindConfig,
    pub admission: AdmissionConfig,
    pub scan: ScanConfig,
    pub cache: CacheConfig,
    /// CIDRs permitted to connect. Empty means allow all.
    pub ip_allowlist: Vec<String>,
    pub timeout: TimeoutConfig,
}

impl GuardConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind.port == 0 {
            return Err(ConfigError::Invalid("bind.port must be non-zero".into()));
        }
        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(ConfigError::Invalid(format!(
                "upstream.base_url must be an http(s) URL, got {:?}",
                self.upstream.base_url
            )));
        }
        if self.scan.window_bytes == 0 {
            return Err(ConfigError::Invalid("scan.window_bytes must be > 0".into()));
        }
        if self.cache.local_max_entries == 0 {
            return Err(ConfigError::Invalid(
                "cache.local_max_entries must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindConfig {
    pub host: String,
    pub port: u16,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 11435,
        }
    }
}

/// Per-model parallelism, either a fixed count or sized from available memory
/// at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParallelLimit {
    Fixed(u32),
    Auto(AutoMarker),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoMarker {
    Auto,
}

impl Default for ParallelLimit {
    fn default() -> Self {
        ParallelLimit::Auto(AutoMarker::Auto)
    }
}

impl ParallelLimit {
    pub fn fixed(&self) -> Option<u32> {
        match self {
            ParallelLimit::Fixed(n) => Some(*n),
            ParallelLimit::Auto(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub default_parallel: ParallelLimit,
    pub default_queue_limit: u32,
    pub overrides: BTreeMap<String, ModelOverride>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_parallel: ParallelLimit::default(),
            default_queue_limit: 512,
            overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub input_enabled: bool,
    pub output_enabled: bool,
    /// When true a scanner error fails the whole pipeline instead of only
    /// marking that scanner failed.
    pub block_on_scanner_error: bool,
    /// Streaming output scan cadence, in bytes of accumulated UTF-8 text.
    pub window_bytes: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            input_enabled: true,
            output_enabled: true,
            block_on_scanner_error: false,
            window_bytes: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheBackendMode {
    #[default]
    Auto,
    LocalOnly,
    RemoteOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteCacheConfig {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub pool_size: u32,
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    /// Seconds between health probes while the remote tier is degraded.
    pub reconnect_interval_secs: u64,
}

impl Default for RemoteCacheConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: None,
            password: None,
            pool_size: 50,
            connect_timeout_ms: 2_000,
            operation_timeout_ms: 1_000,
            reconnect_interval_secs: 30,
        }
    }
}

impl RemoteCacheConfig {
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                format!("redis://{user}:{pass}@{}:{}/", self.host, self.port)
            }
            (None, Some(pass)) => format!("redis://:{pass}@{}:{}/", self.host, self.port),
            _ => format!("redis://{}:{}/", self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackendMode,
    pub local_max_entries: usize,
    pub ttl_seconds: u64,
    pub remote: RemoteCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendMode::Auto,
            local_max_entries: 1_000,
            ttl_seconds: 3_600,
            remote: RemoteCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub upstream_connect_secs: u64,
    pub upstream_idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            upstream_connect_secs: 5,
            upstream_idle_secs: 60,
        }
    }
}

/// Optional layer used when merging configuration sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuardConfigPatch {
    pub upstream_base_url: Option<String>,
    pub bind_host: Option<String>,
    pub bind_port: Option<u16>,
    pub default_parallel: Option<ParallelLimit>,
    pub default_queue_limit: Option<u32>,
    pub scan_input_enabled: Option<bool>,
    pub scan_output_enabled: Option<bool>,
    pub scan_block_on_scanner_error: Option<bool>,
    pub scan_window_bytes: Option<usize>,
    pub cache_backend: Option<CacheBackendMode>,
    pub cache_local_max_entries: Option<usize>,
    pub cache_ttl_seconds: Option<u64>,
    pub cache_remote_host: Option<String>,
    pub cache_remote_port: Option<u16>,
    pub cache_remote_password: Option<String>,
    pub ip_allowlist: Option<Vec<String>>,
    pub timeout_upstream_connect_secs: Option<u64>,
    pub timeout_upstream_idle_secs: Option<u64>,
}

impl GuardConfigPatch {
    pub fn overlay(&mut self, other: GuardConfigPatch) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(upstream_base_url);
        take!(bind_host);
        take!(bind_port);
        take!(default_parallel);
        take!(default_queue_limit);
        take!(scan_input_enabled);
        take!(scan_output_enabled);
        take!(scan_block_on_scanner_error);
        take!(scan_window_bytes);
        take!(cache_backend);
        take!(cache_local_max_entries);
        take!(cache_ttl_seconds);
        take!(cache_remote_host);
        take!(cache_remote_port);
        take!(cache_remote_password);
        take!(ip_allowlist);
        take!(timeout_upstream_connect_secs);
        take!(timeout_upstream_idle_secs);
    }

    pub fn apply_to(self, config: &mut GuardConfig) {
        if let Some(v) = self.upstream_base_url {
            config.upstream.base_url = v;
        }
        if let Some(v) = self.bind_host {
            config.bind.host = v;
        }
        if let Some(v) = self.bind_port {
            config.bind.port = v;
        }
        if let Some(v) = self.default_parallel {
            config.admission.default_parallel = v;
        }
        if let Some(v) = self.default_queue_limit {
            config.admission.default_queue_limit = v;
        }
        if let Some(v) = self.scan_input_enabled {
            config.scan.input_enabled = v;
        }
        if let Some(v) = self.scan_output_enabled {
            config.scan.output_enabled = v;
        }
        if let Some(v) = self.scan_block_on_scanner_error {
            config.scan.block_on_scanner_error = v;
        }
        if let Some(v) = self.scan_window_bytes {
            config.scan.window_bytes = v;
        }
        if let Some(v) = self.cache_backend {
            config.cache.backend = v;
        }
        if let Some(v) = self.cache_local_max_entries {
            config.cache.local_max_entries = v;
        }
        if let Some(v) = self.cache_ttl_seconds {
            config.cache.ttl_seconds = v;
        }
        if let Some(v) = self.cache_remote_host {
            config.cache.remote.host = v;
        }
        if let Some(v) = self.cache_remote_port {
            config.cache.remote.port = v;
        }
        if let Some(v) = self.cache_remote_password {
            config.cache.remote.password = Some(v);
        }
        if let Some(v) = self.ip_allowlist {
            config.ip_allowlist = v;
        }
        if let Some(v) = self.timeout_upstream_connect_secs {
            config.timeout.upstream_connect_secs = v;
        }
        if let Some(v) = self.timeout_upstream_idle_secs {
            config.timeout.upstream_idle_secs = v;
        }
    }

    /// Read the `OGUARD_*` environment overlay. Unset variables leave their
    /// fields untouched; malformed values are hard errors so a typo cannot
    /// silently fall back to a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(
            key: &'static str,
        ) -> Result<Option<T>, ConfigError> {
            match std::env::var(key) {
                Ok(raw) => raw
                    .parse::<T>()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidEnv { key, value: raw }),
                Err(_) => Ok(None),
            }
        }

        let default_parallel = match std::env::var("OGUARD_DEFAULT_PARALLEL") {
            Ok(raw) if raw.eq_ignore_ascii_case("auto") => Some(ParallelLimit::default()),
            Ok(raw) => Some(ParallelLimit::Fixed(raw.parse().map_err(|_| {
                ConfigError::InvalidEnv {
                    key: "OGUARD_DEFAULT_PARALLEL",
                    value: raw,
                }
            })?)),
            Err(_) => None,
        };

        let cache_backend = match std::env::var("OGUARD_CACHE_BACKEND") {
            Ok(raw) => Some(match raw.as_str() {
                "auto" => CacheBackendMode::Auto,
                "local-only" => CacheBackendMode::LocalOnly,
                "remote-only" => CacheBackendMode::RemoteOnly,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: "OGUARD_CACHE_BACKEND",
                        value: raw,
                    });
                }
            }),
            Err(_) => None,
        };

        let ip_allowlist = std::env::var("OGUARD_IP_ALLOWLIST").ok().map(|raw| {
            raw.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect::<Vec<_>>()
        });

        Ok(Self {
            upstream_base_url: std::env::var("OGUARD_UPSTREAM_URL").ok(),
            bind_host: std::env::var("OGUARD_HOST").ok(),
            bind_port: parse("OGUARD_PORT")?,
            default_parallel,
            default_queue_limit: parse("OGUARD_DEFAULT_QUEUE_LIMIT")?,
            scan_input_enabled: parse("OGUARD_SCAN_INPUT_ENABLED")?,
            scan_output_enabled: parse("OGUARD_SCAN_OUTPUT_ENABLED")?,
            scan_block_on_scanner_error: parse("OGUARD_SCAN_BLOCK_ON_SCANNER_ERROR")?,
            scan_window_bytes: parse("OGUARD_SCAN_WINDOW_BYTES")?,
            cache_backend,
            cache_local_max_entries: parse("OGUARD_CACHE_LOCAL_MAX_ENTRIES")?,
            cache_ttl_seconds: parse("OGUARD_CACHE_TTL_SECONDS")?,
            cache_remote_host: std::env::var("OGUARD_CACHE_REMOTE_HOST").ok(),
            cache_remote_port: parse("OGUARD_CACHE_REMOTE_PORT")?,
            cache_remote_password: std::env::var("OGUARD_CACHE_REMOTE_PASSWORD").ok(),
            ip_allowlist,
            timeout_upstream_connect_secs: parse("OGUARD_TIMEOUT_CONNECT")?,
            timeout_upstream_idle_secs: parse("OGUARD_TIMEOUT_IDLE")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = GuardConfig::default();
        assert_eq!(config.admission.default_queue_limit, 512);
        assert_eq!(config.scan.window_bytes, 500);
        assert_eq!(config.cache.local_max_entries, 1_000);
        assert_eq!(config.cache.ttl_seconds, 3_600);
        assert_eq!(config.cache.remote.pool_size, 50);
        assert_eq!(config.timeout.upstream_connect_secs, 5);
        assert_eq!(config.timeout.upstream_idle_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overlay_prefers_later_layers() {
        let mut base = GuardConfigPatch {
            bind_port: Some(8080),
            scan_window_bytes: Some(100),
            ..GuardConfigPatch::default()
        };
        base.overlay(GuardConfigPatch {
            bind_port: Some(9090),
            ..GuardConfigPatch::default()
        });
        assert_eq!(base.bind_port, Some(9090));
        assert_eq!(base.scan_window_bytes, Some(100));
    }

    #[test]
    fn apply_patch_over_defaults() {
        let mut config = GuardConfig::default();
        GuardConfigPatch {
            upstream_base_url: Some("http://ollama:11434".into()),
            default_parallel: Some(ParallelLimit::Fixed(2)),
            ..GuardConfigPatch::default()
        }
        .apply_to(&mut config);
        assert_eq!(config.upstream.base_url, "http://ollama:11434");
        assert_eq!(config.admission.default_parallel.fixed(), Some(2));
    }

    #[test]
    fn parallel_limit_parses_auto_and_fixed() {
        let auto: ParallelLimit = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(auto.fixed(), None);
        let fixed: ParallelLimit = serde_json::from_str("3").unwrap();
        assert_eq!(fixed.fixed(), Some(3));
    }

    #[test]
    fn validate_rejects_bad_upstream() {
        let mut config = GuardConfig::default();
        config.upstream.base_url = "ollama:11434".into();
        assert!(config.validate().is_err());
    }
}
