//! Daemon assembly: wires the four concurrent tasks — hub socket reader,
//! outbound writer, housekeeping sweeper, and the local SSE/HTTP surface —
//! around one shared state bundle and one shutdown signal.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use mx_core::config::FabricConfig;
use mx_core::shutdown::ShutdownSignal;
use mx_store::Store;
use tokio::sync::{mpsc, Notify};
use tracing::info;

use crate::events::EventBus;
use crate::state::{AuthState, DaemonShared, Shared};
use crate::{hub_client, local_api, outbound};

pub struct Daemon {
    shared: Shared,
    shutdown: ShutdownSignal,
    out_rx: Option<mpsc::Receiver<crate::state::OutboundFrame>>,
}

impl Daemon {
    /// Build a daemon for one workspace identity.
    pub fn new(
        store: Store,
        matrix_id: impl Into<String>,
        hub_url: impl Into<String>,
        pin: Option<String>,
    ) -> Self {
        let matrix_id = matrix_id.into();
        let (out_tx, out_rx) = mpsc::channel(32);
        let shared = Arc::new(DaemonShared {
            store,
            display_name: matrix_id.clone(),
            matrix_id,
            hub_url: hub_url.into(),
            events: EventBus::new(),
            connected: AtomicBool::new(false),
            auth: AuthState::new(pin),
            reconnect: Notify::new(),
            kick: Notify::new(),
            out_tx,
        });
        Self {
            shared,
            shutdown: ShutdownSignal::new(),
            out_rx: Some(out_rx),
        }
    }

    pub fn from_config(store: Store, config: &FabricConfig) -> Self {
        let matrix_id = config
            .daemon
            .display_name
            .clone()
            .or_else(|| {
                std::env::current_dir().ok().and_then(|p| {
                    p.file_name().map(|n| n.to_string_lossy().into_owned())
                })
            })
            .unwrap_or_else(|| "matrix".to_string());
        let host = if config.hub.host == "localhost" {
            "127.0.0.1".to_string()
        } else {
            config.hub.host.clone()
        };
        let hub_url = format!("http://{host}:{}", config.hub.port);
        let pin = match &config.hub.pin {
            mx_core::config::PinSetting::Configured(pin) => Some(pin.clone()),
            _ => None,
        };
        Self::new(store, matrix_id, hub_url, pin)
    }

    pub fn shared(&self) -> Shared {
        self.shared.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Spawn the hub connection, outbound worker, and housekeeping tasks,
    /// and serve the local API on the given listener until shutdown.
    pub async fn run(mut self, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        let out_rx = self.out_rx.take().expect("run called once");

        tokio::spawn(hub_client::run(
            self.shared.clone(),
            out_rx,
            self.shutdown.clone(),
        ));
        tokio::spawn(outbound::run(self.shared.clone(), self.shutdown.clone()));
        tokio::spawn(outbound::run_housekeeping(
            self.shared.clone(),
            self.shutdown.clone(),
        ));

        let app = local_api::router(self.shared.clone());
        let port = listener.local_addr()?.port();
        info!(port, matrix_id = %self.shared.matrix_id, "daemon local API listening");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut rx = shutdown.subscribe();
                let _ = rx.recv().await;
            })
            .await?;
        Ok(())
    }
}
