use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::types::Tier;

pub mod commands;

#[derive(Parser)]
#[command(name = "fleetgate")]
#[command(version)]
#[command(about = "Fleet coordinator, worker supervisor, merge gate and backup retention")]
#[command(long_about = "fleetgate runs the coordination core for a fleet of worker agents: a task and \
                       alert coordinator with an HTTP API, a supervisor that keeps worker processes alive, \
                       a merge gate that combines validation, alert and review signals, and a retention \
                       engine for project backups. Start the daemon with 'fleetgate serve'.")]
pub struct Cli {
    /// Configuration file (defaults to ./fleetgate.toml when present)
    #[arg(long, global = true, env = "FLEETGATE_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Coordinator API base URL, overriding coordinator.api_url
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TierArg {
    Core,
    Maintenance,
    OnDemand,
    Advanced,
}

impl From<TierArg> for Tier {
    fn from(tier: TierArg) -> Self {
        match tier {
            TierArg::Core => Tier::Core,
            TierArg::Maintenance => Tier::Maintenance,
            TierArg::OnDemand => Tier::OnDemand,
            TierArg::Advanced => Tier::Advanced,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the coordinator API, reclaim sweep, supervisor and retention schedule
    Serve,
    /// Show registered agents, task counts and recent alerts
    Status {
        /// Print the raw dashboard summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// List supervised workers, optionally for one tier
    List {
        #[arg(long, value_enum, help = "Only show workers of this tier")]
        tier: Option<TierArg>,
    },
    /// Start a worker
    Start { worker: String },
    /// Stop a worker (SIGTERM, then kill after the grace period)
    Stop { worker: String },
    /// Stop and start a worker
    Restart { worker: String },
    /// Force a half-open start attempt on a worker whose breaker is open
    Probe { worker: String },
    /// Run the merge gate for a project; exit 0 allow, 1 deny, 2 allow with warning
    GateCheck {
        #[arg(long, help = "Project whose validation report and review verdict are checked")]
        project: String,
        /// Print the full decision as JSON instead of one line
        #[arg(long)]
        json: bool,
    },
    /// Take a backup snapshot of one or all configured projects
    Backup {
        #[arg(long, help = "Configured project name (all projects when omitted)")]
        project: Option<String>,
        /// Snapshot even when the throttle would skip
        #[arg(long)]
        force: bool,
    },
    /// Compress old snapshots and enforce the retention cap
    Compact {
        #[arg(long, help = "Configured project name (all projects when omitted)")]
        project: Option<String>,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
}
