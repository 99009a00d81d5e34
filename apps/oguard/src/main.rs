use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use oguard_common::GuardConfig;
use oguard_core::admission::AdmissionController;
use oguard_core::upstream_client::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};
use oguard_core::{AppState, GuardEngine};
use oguard_scan::scanners::{BlocklistScanner, PiiRedactScanner};
use oguard_scan::{Pipeline, ScanCache, Scanner};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let config = cli::load_config(&args)?;
    let (input_pipeline, output_pipeline) = build_pipelines(&config)?;

    let cache = ScanCache::new(&config.cache).await;
    let upstream: Arc<dyn UpstreamClient> = Arc::new(WreqUpstreamClient::new(
        UpstreamClientConfig::from_config(&config),
    )?);
    let admission = AdmissionController::new(&config.admission);

    let bind = format!("{}:{}", config.bind.host, config.bind.port);
    let state = Arc::new(AppState {
        config,
        cache,
        input_pipeline,
        output_pipeline,
        admission,
        upstream,
        started_at: Instant::now(),
    });
    let engine = GuardEngine::new(state);
    let app = oguard_router::guard_router(engine)?;

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("listening on {bind}");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

/// Scanners are constructed eagerly so the first request pays no model-load
/// latency. Both sides get the PII redactor first (classifiers must see
/// redacted text), then the optional term blocklist from
/// `OGUARD_BLOCKLIST_TERMS`.
fn build_pipelines(config: &GuardConfig) -> Result<(Arc<Pipeline>, Arc<Pipeline>)> {
    let blocklist_terms: Vec<String> = std::env::var("OGUARD_BLOCKLIST_TERMS")
        .map(|raw| {
            raw.split(',')
                .map(|term| term.trim().to_string())
                .filter(|term| !term.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut input: Vec<Arc<dyn Scanner>> = vec![Arc::new(PiiRedactScanner::new("pii-redact")?)];
    let mut output: Vec<Arc<dyn Scanner>> = vec![Arc::new(PiiRedactScanner::new("pii-redact")?)];
    if !blocklist_terms.is_empty() {
        input.push(Arc::new(BlocklistScanner::new(
            "blocklist",
            blocklist_terms.clone(),
        )));
        output.push(Arc::new(BlocklistScanner::new("blocklist", blocklist_terms)));
    }

    let block_on_error = config.scan.block_on_scanner_error;
    Ok((
        Arc::new(Pipeline::new(input, block_on_error)),
        Arc::new(Pipeline::new(output, block_on_error)),
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
