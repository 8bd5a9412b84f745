use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::Tier;

pub const DEFAULT_CONFIG_FILE: &str = "fleetgate.toml";
pub const ENV_PREFIX: &str = "FLEETGATE";

/// Main configuration structure for fleetgate
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Registry, queue and alert store settings
    pub coordinator: CoordinatorConfig,
    /// Worker process management
    pub supervisor: SupervisorConfig,
    /// Merge gate inputs and freshness rules
    pub gate: GateConfig,
    /// Backup cadence and snapshot retention
    pub retention: RetentionConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Address the HTTP API binds to
    pub bind_addr: String,
    /// Base URL clients use to reach the API
    pub api_url: String,
    /// Expected heartbeat cadence of agents
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Silence after which an agent is unresponsive; also the sweep period
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// Reclaims before a task is abandoned
    pub max_retries: u32,
    /// Window in which identical alerts are merged
    #[serde(with = "humantime_serde")]
    pub alert_dedup_window: Duration,
    /// Oldest alert returned by queries
    #[serde(with = "humantime_serde")]
    pub alert_query_horizon: Duration,
    /// Alerts older than this are pruned
    #[serde(with = "humantime_serde")]
    pub alert_archive_horizon: Duration,
    /// Finished tasks are dropped this long after completion
    #[serde(with = "humantime_serde")]
    pub task_retention: Duration,
    /// Heartbeat age reported as stale on the dashboard
    #[serde(with = "humantime_serde")]
    pub stale_agent_threshold: Duration,
    /// Timeout applied to every client request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8004".to_string(),
            api_url: "http://127.0.0.1:8004".to_string(),
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(180),
            max_retries: 3,
            alert_dedup_window: Duration::from_secs(60 * 60),
            alert_query_horizon: Duration::from_secs(24 * 60 * 60),
            alert_archive_horizon: Duration::from_secs(7 * 24 * 60 * 60),
            task_retention: Duration::from_secs(7 * 24 * 60 * 60),
            stale_agent_threshold: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Time a worker gets to exit after SIGTERM before it is killed
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    /// First restart delay
    #[serde(with = "humantime_serde")]
    pub backoff_initial: Duration,
    /// Restart delay cap
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    pub backoff_multiplier: u32,
    /// Uptime after which backoff and crash counters reset
    #[serde(with = "humantime_serde")]
    pub stable_run: Duration,
    /// Consecutive crashes that open the circuit breaker
    pub breaker_threshold: u32,
    /// How long an open breaker waits before a half-open probe
    #[serde(with = "humantime_serde")]
    pub breaker_open_duration: Duration,
    /// Coordinator health polling cadence
    #[serde(with = "humantime_serde")]
    pub health_poll_interval: Duration,
    /// Managed workers
    pub workers: Vec<WorkerSpec>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            backoff_multiplier: 2,
            stable_run: Duration::from_secs(5 * 60),
            breaker_threshold: 3,
            breaker_open_duration: Duration::from_secs(5 * 60),
            health_poll_interval: Duration::from_secs(30),
            workers: Vec::new(),
        }
    }
}

/// One managed worker process
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkerSpec {
    pub id: String,
    pub tier: Tier,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Coordinator agent id; defaults to the worker id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Maintenance tier run interval
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Duration>,
    /// On-demand tier idle timeout
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<Duration>,
}

impl WorkerSpec {
    pub fn new(id: impl Into<String>, tier: Tier, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier,
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            agent_id: None,
            schedule: None,
            idle_timeout: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_schedule(mut self, every: Duration) -> Self {
        self.schedule = Some(every);
        self
    }

    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = Some(idle);
        self
    }

    pub fn agent_id(&self) -> &str {
        self.agent_id.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GateConfig {
    /// Directory scanned for validation report JSON files
    pub validation_dir: PathBuf,
    /// Directory scanned for review verdict JSON files
    pub review_dir: PathBuf,
    /// Oldest usable validation report or review verdict
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Window in which error and critical alerts block merges
    #[serde(with = "humantime_serde")]
    pub alert_lookback: Duration,
    /// Tolerated clock difference for timestamps in the future
    #[serde(with = "humantime_serde")]
    pub max_clock_skew: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            validation_dir: PathBuf::from("reports/validation"),
            review_dir: PathBuf::from("reports/review"),
            max_age: Duration::from_secs(60 * 60),
            alert_lookback: Duration::from_secs(60 * 60),
            max_clock_skew: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Run backups and compaction on a schedule while serving
    pub enabled: bool,
    /// Root holding one directory per project
    pub backup_root: PathBuf,
    /// Minimum time between backups when content barely changed
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// Relative size change that overrides the cooldown (0.05 = 5%)
    pub size_change_threshold: f64,
    /// Snapshots older than this are compressed
    #[serde(with = "humantime_serde")]
    pub compaction_age: Duration,
    /// Hard cap on retained snapshots per project
    pub max_retained_snapshots: usize,
    /// Scheduled run cadence
    #[serde(with = "humantime_serde")]
    pub schedule_interval: Duration,
    pub projects: Vec<ProjectSpec>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backup_root: PathBuf::from(".fleetgate/backups"),
            cooldown: Duration::from_secs(60 * 60),
            size_change_threshold: 0.05,
            compaction_age: Duration::from_secs(24 * 60 * 60),
            max_retained_snapshots: 10,
            schedule_interval: Duration::from_secs(60 * 60),
            projects: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProjectSpec {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default log level; RUST_LOG takes precedence
    pub log_level: String,
    /// Output format for the long-running daemon
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl FleetConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (fleetgate.toml, or an explicit path)
    /// 3. Environment variables (FLEETGATE_SECTION__KEY)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        match path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("configuration file {} does not exist", path.display());
                }
                builder = builder.add_source(File::from(path));
            }
            None => {
                if Path::new(DEFAULT_CONFIG_FILE).exists() {
                    builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("failed to read configuration")?;
        let fleet_config: FleetConfig = config
            .try_deserialize()
            .context("failed to parse configuration")?;
        fleet_config.validate()?;
        Ok(fleet_config)
    }

    /// Reject settings that would break invariants at runtime
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.heartbeat_timeout < self.coordinator.heartbeat_interval {
            anyhow::bail!("coordinator.heartbeat_timeout must be at least heartbeat_interval");
        }
        if self.coordinator.max_retries == 0 {
            anyhow::bail!("coordinator.max_retries must be at least 1");
        }
        if self.supervisor.breaker_threshold == 0 {
            anyhow::bail!("supervisor.breaker_threshold must be at least 1");
        }
        if self.retention.max_retained_snapshots == 0 {
            anyhow::bail!("retention.max_retained_snapshots must be at least 1");
        }
        if !(self.retention.size_change_threshold >= 0.0) {
            anyhow::bail!("retention.size_change_threshold must be a non-negative number");
        }

        let mut seen = std::collections::HashSet::new();
        for worker in &self.supervisor.workers {
            if !seen.insert(worker.id.as_str()) {
                anyhow::bail!("duplicate worker id '{}'", worker.id);
            }
            if worker.tier == Tier::Maintenance && worker.schedule.is_none() {
                anyhow::bail!("maintenance worker '{}' needs a schedule", worker.id);
            }
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
