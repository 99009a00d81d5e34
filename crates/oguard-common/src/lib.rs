mod config;

pub use config::{
    AdmissionConfig, AutoMarker, BindConfig, CacheBackendMode, CacheConfig, ConfigError,
    GuardConfig, GuardConfigPatch, ModelOverride, ParallelLimit, RemoteCacheConfig, ScanConfig,
    TimeoutConfig, UpstreamConfig,
};
