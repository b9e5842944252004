//! Timer-driven sweeps: retry re-queueing and stuck-mission recovery.

use std::time::Duration;

use mx_core::shutdown::ShutdownSignal;
use tracing::{debug, error};

use crate::TaskEngine;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often the retry sweep runs.
    pub retry_interval: Duration,
    /// How often stuck-mission recovery runs.
    pub recovery_interval: Duration,
    /// Max rows re-queued per retry tick.
    pub retry_batch: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(5),
            recovery_interval: Duration::from_secs(30),
            retry_batch: 50,
        }
    }
}

/// Background sweeps for a [`TaskEngine`]. The two loops run as independent
/// tasks and stop on the shared shutdown signal.
pub struct Sweeper {
    engine: TaskEngine,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(engine: TaskEngine, config: SweeperConfig) -> Self {
        Self { engine, config }
    }

    /// Spawn both loops; they exit when `shutdown` triggers.
    pub fn spawn(self, shutdown: ShutdownSignal) {
        let retry_engine = self.engine.clone();
        let retry_interval = self.config.retry_interval;
        let retry_batch = self.config.retry_batch;
        let mut retry_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retry_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match retry_engine.sweep_retries(retry_batch).await {
                            Ok(0) => {}
                            Ok(n) => debug!(requeued = n, "retry sweep"),
                            Err(e) => error!(error = %e, "retry sweep failed"),
                        }
                    }
                    _ = retry_shutdown.recv() => break,
                }
            }
            debug!("retry sweeper stopped");
        });

        let recover_engine = self.engine;
        let recovery_interval = self.config.recovery_interval;
        let mut recover_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(recovery_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match recover_engine.recover_stuck().await {
                            Ok(0) => {}
                            Ok(n) => debug!(recovered = n, "stuck missions recovered"),
                            Err(e) => error!(error = %e, "stuck recovery failed"),
                        }
                    }
                    _ = recover_shutdown.recv() => break,
                }
            }
            debug!("recovery sweeper stopped");
        });
    }
}
