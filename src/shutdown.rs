use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::observability::FleetMetrics;
use crate::supervisor::Supervisor;

/// Graceful shutdown coordinator for the fleet daemon
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token handed to every background loop; cancelled once on shutdown
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Cancel the token on SIGINT or SIGTERM
    pub fn install_signal_handlers(&self) -> JoinHandle<()> {
        info!("Installing signal handlers for graceful shutdown");
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                signal = wait_for_signal() => {
                    info!(signal = %signal, "Shutdown signal received");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        })
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Stop supervised workers, then give background tasks `grace` to finish
    pub async fn shutdown_all_services(
        &self,
        supervisor: Option<&Supervisor>,
        metrics: &FleetMetrics,
        tasks: Vec<JoinHandle<()>>,
        grace: Duration,
    ) {
        info!("Initiating graceful shutdown of all services...");
        self.token.cancel();

        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
        }

        let pending = tasks.len();
        if timeout(grace, join_all(tasks)).await.is_err() {
            warn!(pending, "Background tasks did not finish within the grace period");
        }

        metrics.log_stats();
        info!("Graceful shutdown completed successfully");
    }
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        },
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
