// Sortie adversary-emulation engine
// Main entry point for the sortie binary

use clap::Parser;
use sortie_engine::cli::{Cli, Command};
use sortie_engine::config::Config;
use sortie_engine::handlers::{
    handle_history, handle_planners, handle_run, handle_validate, OutputFormat, RunOptions,
};
use sortie_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config level; RUST_LOG wins over both
    init_telemetry_with_level(cli.log.as_deref().unwrap_or(&config.core.log_level));

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("Sortie Engine v{} ({} - {})", version, commit, timestamp);

    match cli.command {
        Command::Run {
            profile,
            agent_platform,
            executors,
            privilege,
            planner,
            step,
            ephemeral,
        } => {
            tracing::info!("Running profile: {}", profile.display());
            let options = RunOptions {
                profile,
                agent_platform,
                executors,
                privilege,
                planner,
                step,
                ephemeral,
            };
            handle_run(options, &config, format).await
        }

        Command::Planners => handle_planners(format).await,

        Command::Validate { profile } => {
            tracing::info!("Validating profile: {}", profile.display());
            handle_validate(&profile, format).await
        }

        Command::History { limit } => {
            tracing::info!("Showing last {} sources", limit);
            handle_history(limit, &config, format).await
        }
    }
}
