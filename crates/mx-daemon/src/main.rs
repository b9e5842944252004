//! matrix-fabric daemon — per-workspace client connecting the local store
//! to the hub.

use anyhow::{Context, Result};
use mx_core::config::FabricConfig;
use mx_core::lockfile::{AcquireResult, DaemonLockfile};
use mx_daemon::Daemon;
use mx_store::Store;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    mx_telemetry::logging::init_logging("mx-daemon", "info");

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

    let daemon = Daemon::from_config(store, &config);
    let shared = daemon.shared();
    let shutdown = daemon.shutdown_handle();

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.daemon.port))
        .await
        .with_context(|| format!("failed to bind daemon port {}", config.daemon.port))?;
    let port = listener.local_addr()?.port();

    let lockfile = DaemonLockfile {
        pid: std::process::id(),
        port,
        host: "127.0.0.1".into(),
        matrix_id: shared.matrix_id.clone(),
        started_at: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    match lockfile.acquire().context("lockfile I/O error")? {
        AcquireResult::Acquired => {}
        AcquireResult::AlreadyRunning(existing) => {
            eprintln!(
                "matrix daemon already running (pid={}, api={})",
                existing.pid,
                existing.local_url()
            );
            std::process::exit(1);
        }
        AcquireResult::StaleRemoved => {
            // Retry once after stale cleanup.
            if !matches!(
                lockfile.acquire().context("lockfile I/O error")?,
                AcquireResult::Acquired
            ) {
                eprintln!("failed to acquire daemon lockfile after stale cleanup");
                std::process::exit(1);
            }
        }
    }

    let ctrl_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down daemon");
            DaemonLockfile::remove();
            ctrl_shutdown.trigger();
        }
    });

    info!(matrix_id = %shared.matrix_id, port, "daemon starting");
    let result = daemon.run(listener).await;
    DaemonLockfile::remove();
    result
}
