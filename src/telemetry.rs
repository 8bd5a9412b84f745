use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::{LogFormat, ObservabilityConfig};

/// Initialize structured logging. `RUST_LOG` overrides the configured level.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    init_with_format(config, config.log_format)
}

/// Logging for one-shot CLI commands: human readable, on stderr, quiet by default
pub fn init_cli_telemetry() -> Result<()> {
    let config = ObservabilityConfig {
        log_level: "warn".to_string(),
        log_format: LogFormat::Pretty,
    };
    init_with_format(&config, LogFormat::Pretty)
}

fn init_with_format(config: &ObservabilityConfig, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::debug!(level = %config.log_level, "fleetgate telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Create a span with common coordination attributes
pub fn create_coordination_span(
    operation: &str,
    agent_id: Option<&str>,
    task_id: Option<&str>,
    correlation_id: Option<&str>,
) -> tracing::Span {
    tracing::info_span!(
        "coordination",
        operation = operation,
        agent.id = agent_id,
        task.id = task_id,
        correlation.id = correlation_id,
    )
}
