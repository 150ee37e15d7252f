//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - run: Execute an operation from a profile against the local machine
//! - planners: List registered planners
//! - validate: Load and check a profile
//! - history: Show sources persisted by past operations

use anyhow::{Context, Result};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::agent::{Agent, Privilege};
use crate::command_executor::CommandExecutor;
use crate::config::Config;
use crate::db::{Database, ResultStore, SourceSink};
use crate::message_bus::{Event, EventType};
use crate::operation::event_log::write_event_logs;
use crate::operation::{EngineServices, Operation, OperationBuilder, OperationSettings, OperationState};
use crate::parsers::ParserRegistry;
use crate::planner::PlannerRegistry;
use crate::profile::Profile;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Options for `sortie run`
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub profile: PathBuf,
    pub agent_platform: Option<String>,
    pub executors: Vec<String>,
    pub privilege: String,
    pub planner: Option<String>,
    pub step: bool,
    pub ephemeral: bool,
}

/// Run an operation to completion and write its event log
///
/// Ctrl-C forces the operation out of time; cleanup still runs before exit.
pub async fn handle_run(options: RunOptions, config: &Config, format: OutputFormat) -> Result<()> {
    let profile = Profile::load(&options.profile)
        .await
        .with_context(|| format!("Failed to load profile {}", options.profile.display()))?;
    let privilege: Privilege = options.privilege.parse()?;

    let executor = CommandExecutor::new(Duration::from_secs(config.operation.link_timeout_secs))
        .with_overrides(config.executor.shells.clone());

    let mut database = None;
    let services = if options.ephemeral {
        EngineServices::in_memory(executor)?.0
    } else {
        let db = Arc::new(
            Database::new(&get_db_path(config))
                .await
                .context("Failed to open database")?,
        );
        database = Some(Arc::clone(&db));
        EngineServices::new(
            executor,
            Arc::clone(&db) as Arc<dyn ResultStore>,
            db as Arc<dyn SourceSink>,
        )?
    };
    profile.validate(&services.parsers, &services.planners)?;

    let paw: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
    let mut agent = Agent::local(paw, options.executors, privilege);
    if let Some(platform) = options.agent_platform {
        agent.platform = platform;
    }

    let planner = profile.planner(options.planner.as_deref(), &config.operation.default_planner);
    let mut builder = OperationBuilder::new(&profile.name, profile.adversary.clone())
        .abilities(profile.abilities.clone())
        .planner(planner)
        .agent(agent)
        .objectives(profile.objectives.clone())
        .settings(OperationSettings::from(&config.operation));
    if let Some(source) = profile.source() {
        builder = builder.source(source.clone());
    }
    if options.step {
        builder = builder.initial_state(OperationState::RunOneLink);
    }
    let operation = builder.build(services.clone());

    let printer = match format {
        OutputFormat::Text => {
            let events = services.bus.subscribe(EventType::All).await;
            Some(tokio::spawn(print_progress(events)))
        }
        OutputFormat::Json => None,
    };
    let stepper = options
        .step
        .then(|| tokio::spawn(step_on_enter(Arc::clone(&operation))));
    let interrupt = {
        let operation = Arc::clone(&operation);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(operation_id = %operation.id, "Interrupted, forcing operation out of time");
                operation.out_of_time().await;
            }
        })
    };

    let span = info_span!("operation", operation_id = %operation.id, name = %operation.name);
    let outcome = operation.run().instrument(span).await;
    interrupt.abort();
    if let Some(stepper) = stepper {
        stepper.abort();
    }
    if let Some(printer) = printer {
        let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    }

    // Links that ran before a failure are still logged, and the database is
    // closed before any error is returned.
    let (entries, failure) = match outcome {
        Ok(entries) => (entries, None),
        Err(e) => (operation.event_logs().await, Some(e)),
    };
    let written = match (&failure, entries.is_empty()) {
        (Some(_), true) => None,
        _ => Some(write_event_logs(&config.core.data_dir.join("event_logs"), &operation.id, &entries).await),
    };
    let facts = operation.all_facts().await;

    if let Some(db) = database {
        db.close().await?;
    }
    if let Some(e) = failure {
        if let Some(Ok(path)) = &written {
            warn!(operation_id = %operation.id, event_log = %path.display(), "Event log written for failed operation");
        }
        return Err(anyhow::Error::new(e).context("Operation failed"));
    }
    let log_path = written
        .context("Event log was not written")?
        .context("Failed to write event logs")?;

    match format {
        OutputFormat::Text => {
            println!();
            println!("✓ Operation {} {}", operation.name, operation.state());
            println!("  Id: {}", operation.id);
            println!("  Links run: {}", entries.len());
            println!("  Facts known: {}", facts.len());
            println!("  Event log: {}", log_path.display());
        }
        OutputFormat::Json => {
            let output = json!({
                "operation_id": operation.id,
                "name": operation.name,
                "state": operation.state(),
                "links": entries.len(),
                "facts": facts,
                "event_log": log_path,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Print operation events until the operation finishes
async fn print_progress(mut events: mpsc::Receiver<Event>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::OperationStarted { name, .. } => println!("Operation {} started", name),
            Event::LinkApplied { ability, paw, command, .. } => {
                println!("→ [{}] {}: {}", paw, ability, command)
            }
            Event::LinkFinished { status, .. } if status == 0 => println!("  ✓ exit 0"),
            Event::LinkFinished { status, .. } => println!("  ✗ exit {}", status),
            Event::FactLearned { trait_name, value, .. } => println!("  + {} = {}", trait_name, value),
            Event::StateChanged { state, .. } => println!("  state: {}", state),
            Event::OperationFinished { .. } => break,
        }
    }
}

/// Admit one more link per line on stdin; `c` resumes normal running
async fn step_on_enter(operation: Arc<Operation>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if operation.state().is_closed() {
            break;
        }
        if line.trim().eq_ignore_ascii_case("c") {
            operation.resume().await;
            break;
        }
        operation.step().await;
    }
}

/// List registered planners
pub async fn handle_planners(format: OutputFormat) -> Result<()> {
    let names = PlannerRegistry::new().names();
    match format {
        OutputFormat::Text => {
            println!("Registered planners:");
            for name in &names {
                println!("  {}", name);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&json!({ "planners": names }))?);
        }
    }
    Ok(())
}

/// Load a profile and check it against the registered parsers and planners
pub async fn handle_validate(path: &Path, format: OutputFormat) -> Result<()> {
    let profile = Profile::load(path)
        .await
        .with_context(|| format!("Failed to load profile {}", path.display()))?;
    profile.validate(&ParserRegistry::new(), &PlannerRegistry::new())?;
    info!(profile = %profile.name, "Profile is valid");

    match format {
        OutputFormat::Text => {
            println!("✓ Profile {} is valid", profile.name);
            println!("  Adversary: {}", profile.adversary.name);
            println!("  Abilities: {}", profile.abilities.len());
            println!("  Atomic ordering: {}", profile.adversary.atomic_ordering.join(", "));
            println!("  Sources: {}", profile.sources.len());
            println!("  Planners: {}", profile.planners.len());
            println!("  Objectives: {}", profile.objectives.len());
        }
        OutputFormat::Json => {
            let output = json!({
                "valid": true,
                "name": profile.name,
                "adversary": profile.adversary,
                "abilities": profile.abilities.len(),
                "sources": profile.sources.len(),
                "planners": profile.planners,
                "objectives": profile.objectives,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Show the most recent persisted sources
pub async fn handle_history(limit: usize, config: &Config, format: OutputFormat) -> Result<()> {
    let database = Database::new(&get_db_path(config))
        .await
        .context("Failed to open database")?;

    let sources = database
        .sources()
        .list(limit as i64)
        .await
        .context("Failed to fetch source history")?;

    match format {
        OutputFormat::Text => {
            if sources.is_empty() {
                println!("No operations in history");
            } else {
                println!("Operation History (last {} sources):", limit);
                println!();
                for source in &sources {
                    let created = chrono::DateTime::from_timestamp(source.created_at, 0)
                        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "Unknown".to_string());
                    println!("Source ID: {}", source.id);
                    println!("  Operation: {} ({})", source.name, source.operation_id);
                    println!("  Facts: {}", source.fact_count);
                    println!("  Relationships: {}", source.relationship_count);
                    println!("  Created: {}", created);
                    println!();
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "sources": sources,
                "count": sources.len(),
                "limit": limit
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    database.close().await?;
    Ok(())
}

/// Get database path from config
fn get_db_path(config: &Config) -> PathBuf {
    config.core.data_dir.join("sortie.db")
}
