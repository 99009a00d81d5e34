use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use oguard_common::{GuardConfig, GuardConfigPatch};

#[derive(Debug, Parser)]
#[command(name = "oguard", about = "Content-safety guard proxy for Ollama")]
pub struct Args {
    /// YAML configuration file.
    #[arg(long, env = "OGUARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen host (overrides config/env).
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port (overrides config/env).
    #[arg(long)]
    pub port: Option<u16>,

    /// Upstream base URL (overrides config/env).
    #[arg(long)]
    pub upstream: Option<String>,

    /// Log filter, e.g. `info` or `oguard_core=debug,info`.
    #[arg(long, env = "OGUARD_LOG", default_value = "info")]
    pub log_level: String,
}

impl Args {
    fn as_patch(&self) -> GuardConfigPatch {
        GuardConfigPatch {
            upstream_base_url: self.upstream.clone(),
            bind_host: self.host.clone(),
            bind_port: self.port,
            ..GuardConfigPatch::default()
        }
    }
}

/// Merge order: defaults < config file < environment < CLI flags.
pub fn load_config(args: &Args) -> anyhow::Result<GuardConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => GuardConfig::default(),
    };

    let mut patch = GuardConfigPatch::from_env()?;
    patch.overlay(args.as_patch());
    patch.apply_to(&mut config);

    config.validate()?;
    Ok(config)
}
