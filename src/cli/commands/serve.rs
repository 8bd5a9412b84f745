use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::FleetConfig;
use crate::coordinator::{spawn_sweeper, AlertSink, Coordinator, HealthProbe};
use crate::http::{serve, AppState};
use crate::retention::{spawn_retention_schedule, RetentionEngine};
use crate::shutdown::ShutdownCoordinator;
use crate::supervisor::Supervisor;

/// Runs every long-lived component in one process until SIGINT/SIGTERM
pub struct ServeCommand {
    config: FleetConfig,
}

impl ServeCommand {
    pub fn new(config: FleetConfig) -> Self {
        Self { config }
    }

    pub async fn execute(&self) -> Result<()> {
        let config = &self.config;
        let shutdown = ShutdownCoordinator::new();
        let signals = shutdown.install_signal_handlers();

        let coordinator = Arc::new(Coordinator::new(&config.coordinator));
        let mut background = vec![
            signals,
            spawn_sweeper(coordinator.clone(), config.coordinator.heartbeat_timeout, shutdown.token()),
        ];

        let supervisor = Supervisor::builder(&config.supervisor)
            .with_health_probe(coordinator.clone() as Arc<dyn HealthProbe>)
            .with_alert_sink(coordinator.clone() as Arc<dyn AlertSink>)
            .build()
            .context("invalid supervisor configuration")?;
        background.extend(supervisor.boot().await);

        if config.retention.enabled && !config.retention.projects.is_empty() {
            let engine = Arc::new(RetentionEngine::new(config.retention.clone()));
            background.push(spawn_retention_schedule(
                engine,
                Some(coordinator.clone() as Arc<dyn AlertSink>),
                config.retention.schedule_interval,
                shutdown.token(),
            ));
        }

        let listener = TcpListener::bind(&config.coordinator.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.coordinator.bind_addr))?;
        info!(
            addr = %config.coordinator.bind_addr,
            workers = supervisor.list(None).len(),
            projects = config.retention.projects.len(),
            "fleetgate serving"
        );

        let state = AppState::new(coordinator.clone()).with_supervisor(supervisor.clone());
        let served = serve(listener, state, shutdown.token()).await;

        shutdown
            .shutdown_all_services(
                Some(&supervisor),
                coordinator.metrics(),
                background,
                config.supervisor.stop_grace,
            )
            .await;
        served.context("HTTP server failed")
    }
}
