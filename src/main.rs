use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::net::TcpListener;

use firmware_compiler::config::loader;
use firmware_compiler::server::{self, AppState};
use firmware_compiler::source::{GitHubSnapshotFetcher, LocalMirrorFetcher, SnapshotFetcher};
use firmware_compiler::{DeploymentEnvironment, LogCollector, Orchestrator, ServiceConfig};

fn build_fetcher(config: &ServiceConfig) -> anyhow::Result<Arc<dyn SnapshotFetcher>> {
    if config.deployment == DeploymentEnvironment::Local {
        return Ok(Arc::new(LocalMirrorFetcher::new(&config.local_mirror_dir)));
    }
    let credentials = config
        .github
        .clone()
        .ok_or_else(|| anyhow!("GitHub App credentials are not configured"))?;
    let fetcher = GitHubSnapshotFetcher::from_credentials(&config.github_api_url, credentials)
        .context("Failed to create GitHub snapshot fetcher")?;
    Ok(Arc::new(fetcher))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    log::info!("[Main] Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // =========================================================================
    // CONFIGURATION
    // =========================================================================
    let config = loader::load_from_env().context("Failed to load service configuration")?;

    // =========================================================================
    // LOGGING INITIALIZATION
    // =========================================================================
    let log_collector = LogCollector::new(config.log_dir.clone())
        .map_err(|e| anyhow!("LogCollector initialization failed: {}", e))?;
    let max_level = match std::env::var("RUST_LOG").ok().as_deref() {
        Some("debug") | Some("trace") => log::LevelFilter::Debug,
        _ => log::LevelFilter::Info,
    };
    if let Err(e) = log_collector.clone().init_global_logger(max_level) {
        eprintln!("[Main] WARNING: {}", e);
    }
    log::info!(
        "[Main] Firmware compiler {} starting (environment: {}, workspace: {})",
        firmware_compiler::VERSION,
        config.deployment,
        config.workspace_dir.display()
    );

    // =========================================================================
    // PIPELINE
    // =========================================================================
    let fetcher = build_fetcher(&config)?;
    let orchestrator = Orchestrator::from_config(&config, fetcher);

    // Startup sync runs in the background; /health answers meanwhile and
    // compiles report WorkspaceNotReady until it finishes.
    let startup = orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = startup.initialize().await {
            log::error!("[Main] Startup synchronization failed: {}", e);
        }
    });

    // =========================================================================
    // HTTP
    // =========================================================================
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let state = AppState {
        orchestrator,
        port: config.port,
        deployment: config.deployment,
    };
    server::serve(listener, state, shutdown_signal())
        .await
        .context("HTTP server failed")?;

    // =========================================================================
    // SHUTDOWN
    // =========================================================================
    if let Err(e) = log_collector.wait_for_empty().await {
        eprintln!("[Main] WARNING: Failed to flush logs: {}", e);
    }
    Ok(())
}
