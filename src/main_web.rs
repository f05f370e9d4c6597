// Caption web server entry point.
//
// Startup order: configuration, logging, weight acquisition (fatal on failure),
// inference engine, then the HTTP server. `--prefetch-only` stops after acquisition.

use std::sync::Arc;

use anyhow::Context;
use log::{error, info};

use caption_server::web::admission::AdmissionGate;
use caption_server::web::artifacts::{self, ArtifactSpec};
use caption_server::web::config::{FetchMode, ServiceConfig};
use caption_server::web::engine::SharedEngine;
use caption_server::web::hub::HubFetcher;
use caption_server::web::logger;
use caption_server::web::server::{self, AppState};

fn main() {
    if let Err(e) = run() {
        error!("[MAIN] Fatal: {e:#}");
        eprintln!("caption_web: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let prefetch_only = std::env::args().skip(1).any(|a| a == "--prefetch-only");

    let config = ServiceConfig::from_env().context("invalid configuration")?;

    match logger::init(&config.log_dir, &config.log_level) {
        Ok(path) => info!("[MAIN] Logging to {}", path.display()),
        Err(e) => eprintln!("Failed to set up logging: {e}"),
    }

    let spec = ArtifactSpec::from_config(&config.artifacts);
    let fetcher = HubFetcher::from_config(&config.artifacts);
    let resolved = artifacts::acquire(
        &spec,
        &config.artifacts.weights_dir,
        config.artifacts.fetch_mode,
        &fetcher,
    )?;
    info!(
        "[MAIN] Using {} from {} ({} shard(s), {:?})",
        resolved.model_id,
        resolved.path.display(),
        resolved.weight_shard_count,
        resolved.source
    );

    if prefetch_only {
        info!("[MAIN] --prefetch-only: weights ready, exiting");
        return Ok(());
    }

    let engine = start_engine(&config, &resolved)?;
    let info = engine.info();
    info!("[MAIN] Engine {} on {} ({})", info.backend, info.device, info.dtype);

    let state = AppState {
        gate: AdmissionGate::from_config(&config.concurrency),
        engine,
        artifacts: Arc::new(resolved),
        default_prompt: Arc::from(config.default_prompt.as_str()),
        max_upload_bytes: config.max_upload_bytes,
        offline: config.artifacts.fetch_mode == FetchMode::Offline,
    };
    info!(
        "[MAIN] Admission: max_concurrent={} acquire_timeout={:?} retry_after={}s",
        config.concurrency.max_concurrent,
        config.concurrency.acquire_timeout,
        config.concurrency.retry_after_s
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(server::serve(config.bind_addr, state, shutdown_signal()))?;
    Ok(())
}

#[cfg(not(feature = "mock"))]
fn start_engine(
    config: &ServiceConfig,
    resolved: &artifacts::ResolvedArtifacts,
) -> anyhow::Result<SharedEngine> {
    use caption_server::web::worker::RuntimeEngine;

    let engine = RuntimeEngine::start(&config.runtime, resolved).context("inference runtime failed to start")?;
    Ok(Arc::new(engine))
}

#[cfg(feature = "mock")]
fn start_engine(
    _config: &ServiceConfig,
    _resolved: &artifacts::ResolvedArtifacts,
) -> anyhow::Result<SharedEngine> {
    use caption_server::web::engine_mock::MockEngine;

    let delay_ms = std::env::var("MOCK_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    info!("[MAIN] Mock engine enabled (delay {delay_ms} ms)");
    Ok(Arc::new(MockEngine::new(std::time::Duration::from_millis(delay_ms))))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("[MAIN] Ctrl-C received, shutting down"),
        Err(e) => {
            error!("[MAIN] Cannot listen for Ctrl-C ({e}); running until killed");
            std::future::pending::<()>().await;
        }
    }
}
