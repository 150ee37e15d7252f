//! Integration tests for profile loading
//!
//! Loads profile documents from disk, including the bundled demo, and runs a
//! small profile end to end the way `sortie run` does.

use sdk::errors::EngineError;
use sdk::types::RuleAction;
use sortie_engine::objective::GoalOperator;
use sortie_engine::parsers::ParserRegistry;
use sortie_engine::planner::PlannerRegistry;
use sortie_engine::profile::Profile;
use std::path::PathBuf;
use tempfile::TempDir;

fn demo_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("demos")
        .join("discovery.toml")
}

async fn write_profile(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("profile.toml");
    tokio::fs::write(&path, body).await.unwrap();
    path
}

#[tokio::test]
async fn test_demo_profile_loads_and_validates() {
    let profile = Profile::load(&demo_path()).await.unwrap();
    profile
        .validate(&ParserRegistry::new(), &PlannerRegistry::new())
        .unwrap();

    assert_eq!(profile.name, "local discovery");
    assert_eq!(profile.adversary.atomic_ordering.len(), 5);
    assert_eq!(profile.abilities.len(), 5);

    let whoami = profile.abilities.iter().find(|a| a.id == "whoami").unwrap();
    assert_eq!(whoami.technique_id, "T1033");
    assert_eq!(whoami.executors.len(), 2);
    assert_eq!(whoami.executors[0].parsers[0].module, "basic");

    let source = profile.source().unwrap();
    assert_eq!(source.id, "basic");
    assert_eq!(source.facts[0].trait_name, "host.dir.home");
    assert_eq!(source.rules[0].action, RuleAction::Deny);

    let objective = profile
        .objectives
        .iter()
        .find(|o| o.id == "found-address")
        .unwrap();
    assert_eq!(objective.goals[0].operator, GoalOperator::Any);
    assert!(profile.objectives.iter().any(|o| o.name == "default"));

    let planner = profile.planner(None, "privileged_persistence");
    assert_eq!(planner.module, "atomic");
    assert_eq!(planner.name, "Atomic");
}

#[tokio::test]
async fn test_missing_profile_is_io_error() {
    let temp_dir = TempDir::new().unwrap();
    let result = Profile::load(&temp_dir.path().join("absent.toml")).await;
    assert!(matches!(result, Err(EngineError::Io(_))));
}

#[tokio::test]
async fn test_parse_error_names_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_profile(&temp_dir, "[adversary]\nname = \"no id\"\n").await;

    let err = Profile::load(&path).await.unwrap_err();
    match err {
        EngineError::Profile(msg) => assert!(msg.contains("profile.toml"), "message was {}", msg),
        other => panic!("expected profile error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_shell_in_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_profile(
        &temp_dir,
        r#"
[adversary]
id = "adv"
name = "adv"
atomic_ordering = ["a"]

[[abilities]]
id = "a"
tactic = "discovery"

[[abilities.executors]]
name = "cmd"
platform = "windows"
command = "whoami"
"#,
    )
    .await;

    let err = Profile::load(&path).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownShell(ref s) if s == "cmd"));
}

#[tokio::test]
async fn test_unregistered_planner_fails_validation() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_profile(
        &temp_dir,
        r#"
[adversary]
id = "adv"
name = "adv"

[[planners]]
id = "p1"
name = "Batch"
module = "batch"
"#,
    )
    .await;

    let profile = Profile::load(&path).await.unwrap();
    let err = profile
        .validate(&ParserRegistry::new(), &PlannerRegistry::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::PlannerNotFound(ref m) if m == "batch"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_profile_runs_end_to_end() {
    use sortie_engine::agent::{Agent, Privilege};
    use sortie_engine::command_executor::CommandExecutor;
    use sortie_engine::operation::{EngineServices, OperationBuilder, OperationSettings, OperationState};
    use std::time::Duration;

    let temp_dir = TempDir::new().unwrap();
    let path = write_profile(
        &temp_dir,
        r#"
name = "e2e"
planner = "atomic"

[adversary]
id = "adv"
name = "adv"
atomic_ordering = ["list", "show"]
objective = "saw-file"

[[sources]]
id = "seed"
facts = [{ trait = "target.dir", value = "/" }]

[[objectives]]
id = "saw-file"
name = "saw file"
goals = [{ target = "seen.entry", value = "marker", operator = "in" }]

[[abilities]]
id = "list"
tactic = "discovery"

[[abilities.executors]]
name = "sh"
platform = "test"
command = "echo marker-#{target.dir}"
parsers = [{ module = "basic", parserconfigs = [{ source = "seen.entry" }] }]

[[abilities]]
id = "show"
tactic = "discovery"

[[abilities.executors]]
name = "sh"
platform = "test"
command = "echo never"
"#,
    )
    .await;

    let profile = Profile::load(&path).await.unwrap();
    let (services, store) = EngineServices::in_memory(CommandExecutor::default()).unwrap();
    profile.validate(&services.parsers, &services.planners).unwrap();

    let mut agent = Agent::local("e2e000", vec!["sh".to_string()], Privilege::User);
    agent.platform = "test".to_string();
    let settings = OperationSettings {
        apply_poll: Duration::from_millis(50),
        link_poll: Duration::from_millis(50),
        finish_poll: Duration::from_millis(50),
        ..OperationSettings::default()
    };
    let op = OperationBuilder::new(&profile.name, profile.adversary.clone())
        .abilities(profile.abilities.clone())
        .planner(profile.planner(None, "privileged_persistence"))
        .source(profile.source().unwrap().clone())
        .agent(agent)
        .objectives(profile.objectives.clone())
        .settings(settings)
        .build(services);

    let logs = op.run().await.unwrap();

    // the objective is met by the first link, so the second never runs
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].command, "echo marker-/");
    assert!(op.has_fact("seen.entry", "marker-/").await);
    assert_eq!(op.state(), OperationState::Finished);
    assert_eq!(store.sources().await.len(), 1);
}
