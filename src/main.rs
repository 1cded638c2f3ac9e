use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

use task_conductor::cli::commands::{
    ArchiveCommand, ClaimCommand, CommandContext, CommandOutcome, HealthCommand, HeartbeatCommand,
    ReleaseCommand, SweepStaleCommand,
};
use task_conductor::cli::{Cli, Commands};
use task_conductor::config::ConductorConfig;
use task_conductor::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // --help and --version are not failures
        Err(err) if !err.use_stderr() => {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => return CommandOutcome::error(err.to_string().trim_end()).emit(),
    };
    match run(cli).await {
        Ok(outcome) => outcome.emit(),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "Command failed");
            CommandOutcome::error(format!("{err:#}")).emit()
        }
    }
}

async fn run(cli: Cli) -> Result<CommandOutcome> {
    let mut config = ConductorConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);

    if let Err(err) = init_telemetry(&config.observability) {
        eprintln!("Warning: failed to initialize logging: {err}");
    }

    let ctx = CommandContext::connect(config).await?;

    match cli.command {
        Commands::Claim { role, task_id } => {
            ClaimCommand::new(role)
                .with_task_id(task_id)
                .execute(&ctx)
                .await
        }
        Commands::Heartbeat { agent_id } => HeartbeatCommand::new(agent_id).execute(&ctx).await,
        Commands::Release { agent_id, abandon } => {
            ReleaseCommand::new(agent_id)
                .with_abandon(abandon)
                .execute(&ctx)
                .await
        }
        Commands::Complete { agent_id } => ReleaseCommand::new(agent_id).execute(&ctx).await,
        Commands::SweepStale { timeout, dry_run } => {
            SweepStaleCommand::new(dry_run)
                .with_timeout_minutes(timeout)
                .execute(&ctx)
                .await
        }
        Commands::Health { json } => HealthCommand::new(json).execute(&ctx).await,
        Commands::Archive { max_age, dry_run } => {
            ArchiveCommand::new(dry_run)
                .with_max_age_days(max_age)
                .execute(&ctx)
                .await
        }
    }
}
