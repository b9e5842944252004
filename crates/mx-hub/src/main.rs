//! matrix-fabric hub — the central WebSocket process connecting matrices.

use std::sync::Arc;

use anyhow::{Context, Result};
use mx_core::config::FabricConfig;
use mx_core::shutdown::ShutdownSignal;
use mx_hub::server::{router, spawn_heartbeat, HubState};
use mx_store::Store;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    mx_telemetry::logging::init_logging("mx-hub", "info");

    let config = FabricConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FabricConfig::from_env()
    });

    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    let store_path = config.store.path.replacen("~", &home, 1);
    if let Some(parent) = std::path::Path::new(&store_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let store = Store::open(&store_path)
        .await
        .with_context(|| format!("failed to open store at {store_path}"))?;

    let state = Arc::new(HubState::new(store, &config.hub));
    let shutdown = ShutdownSignal::new();
    spawn_heartbeat(state.clone(), shutdown.clone());

    let app = router(state);
    let bind_host = if config.hub.host == "localhost" {
        "127.0.0.1".to_string()
    } else {
        config.hub.host.clone()
    };
    let addr: std::net::SocketAddr = format!("{bind_host}:{}", config.hub.port)
        .parse()
        .with_context(|| format!("invalid hub address {bind_host}:{}", config.hub.port))?;

    let ctrl_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down hub");
            ctrl_shutdown.trigger();
        }
    });

    match (&config.hub.tls_cert, &config.hub.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                .await
                .context("failed to load TLS certificate/key")?;
            info!(%addr, "hub listening (wss)");
            axum_server::bind_rustls(addr, tls)
                .serve(app.into_make_service())
                .await
                .context("hub server failed")?;
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            info!(%addr, "hub listening (ws)");
            axum::serve(listener, app).await.context("hub server failed")?;
        }
    }

    Ok(())
}
