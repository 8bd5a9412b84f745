use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;

use fleetgate::cli::commands::config::ConfigShowCommand;
use fleetgate::cli::commands::gate_check::GateCheckCommand;
use fleetgate::cli::commands::list::ListCommand;
use fleetgate::cli::commands::retention::{RetentionCommand, RetentionTask};
use fleetgate::cli::commands::serve::ServeCommand;
use fleetgate::cli::commands::status::StatusCommand;
use fleetgate::cli::commands::worker::{WorkerAction, WorkerCommand};
use fleetgate::cli::commands::coordinator_client;
use fleetgate::cli::{Cli, Commands, ConfigCommands};
use fleetgate::config::FleetConfig;
use fleetgate::telemetry::{init_cli_telemetry, init_telemetry};
use fleetgate::GateOutcome;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let gate_check = matches!(cli.command, Commands::GateCheck { .. });

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) if gate_check => {
            // The gate fails closed on anything it could not evaluate
            println!("{}: {:#}", GateOutcome::Deny.label(), e);
            ExitCode::from(GateOutcome::Deny.exit_code() as u8)
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    FleetConfig::load_env_file()?;
    let mut config = FleetConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.api_url {
        config.coordinator.api_url = url;
    }

    match &cli.command {
        Commands::Serve => init_telemetry(&config.observability)?,
        _ => init_cli_telemetry()?,
    }

    match cli.command {
        Commands::Serve => ServeCommand::new(config).execute().await?,
        Commands::Status { json } => {
            StatusCommand::new(coordinator_client(&config)?)
                .with_json(json)
                .execute()
                .await?
        }
        Commands::List { tier } => {
            ListCommand::new(coordinator_client(&config)?)
                .with_tier(tier.map(Into::into))
                .execute()
                .await?
        }
        Commands::Start { worker } => worker_action(&config, WorkerAction::Start, worker).await?,
        Commands::Stop { worker } => worker_action(&config, WorkerAction::Stop, worker).await?,
        Commands::Restart { worker } => worker_action(&config, WorkerAction::Restart, worker).await?,
        Commands::Probe { worker } => worker_action(&config, WorkerAction::Probe, worker).await?,
        Commands::GateCheck { project, json } => {
            let client = Arc::new(coordinator_client(&config)?);
            let code = GateCheckCommand::new(config.gate.clone(), client, project)
                .with_json(json)
                .execute()
                .await?;
            return Ok(code as u8);
        }
        Commands::Backup { project, force } => {
            RetentionCommand::new(config.retention.clone(), RetentionTask::Backup { force })
                .with_project(project)
                .with_alert_sink(Arc::new(coordinator_client(&config)?))
                .execute()
                .await?
        }
        Commands::Compact { project } => {
            RetentionCommand::new(config.retention.clone(), RetentionTask::Compact)
                .with_project(project)
                .with_alert_sink(Arc::new(coordinator_client(&config)?))
                .execute()
                .await?
        }
        Commands::Config {
            command: ConfigCommands::Show,
        } => ConfigShowCommand::new(config).execute().await?,
    }
    Ok(0)
}

async fn worker_action(config: &FleetConfig, action: WorkerAction, worker: String) -> Result<()> {
    WorkerCommand::new(coordinator_client(config)?, action, worker)
        .execute()
        .await
}
