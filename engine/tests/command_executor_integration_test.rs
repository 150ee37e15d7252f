//! Integration tests for the command executor
//!
//! Runs real subprocesses through each supported shell mapping and checks
//! how failures, timeouts, and agent capability selection are reported.

use sdk::errors::EngineError;
use sortie_engine::ability::{Ability, AbilityExecutor};
use sortie_engine::agent::{Agent, Privilege};
use sortie_engine::command_executor::{CommandExecutor, SPAWN_FAILURE_EXIT_CODE};
use sortie_engine::link::{Link, LinkStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn link_for(ability: Ability, command: &str) -> Link {
    let executor = ability.executors[0].clone();
    Link::new(Arc::new(ability), executor, "paw", command, LinkStatus::EXECUTE)
}

#[cfg(unix)]
#[tokio::test]
async fn test_running_link_through_sh() {
    let executor = CommandExecutor::default();
    let ability = Ability::new("echo", "discovery", AbilityExecutor::new("sh", "linux", "echo hi"));
    let link = link_for(ability, "echo hello from link");

    let result = executor.running(&link).await.unwrap();

    assert_eq!(result.link_id, link.id);
    assert_eq!(result.stdout, "hello from link\n");
    assert_eq!(result.exit_code, 0);
    assert!(result.stderr.is_empty());
    assert!(result.pid.is_some());
}

#[cfg(unix)]
#[tokio::test]
async fn test_stderr_and_exit_code_captured() {
    let executor = CommandExecutor::default();
    let result = executor
        .run_command("l1", "echo bad 1>&2; exit 7", "sh", None)
        .await
        .unwrap();

    assert_eq!(result.stderr, "bad\n");
    assert_eq!(result.exit_code, 7);
    assert!(result.has_output());
}

#[cfg(unix)]
#[tokio::test]
async fn test_proc_runs_without_shell() {
    let executor = CommandExecutor::default();
    let result = executor
        .run_command("l1", "echo one   two", "proc", None)
        .await
        .unwrap();

    assert_eq!(result.stdout, "one two\n");
    assert_eq!(result.exit_code, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_executor_timeout_reports_124() {
    let executor = CommandExecutor::default();
    let mut ability = Ability::new("slow", "discovery", AbilityExecutor::new("sh", "linux", "sleep 5"));
    ability.executors[0].timeout = Some(1);
    let link = link_for(ability, "sleep 5");

    let started = std::time::Instant::now();
    let result = executor.running(&link).await.unwrap();

    assert_eq!(result.exit_code, LinkStatus::TIMEOUT.0);
    assert!(result.stderr.contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[cfg(unix)]
#[tokio::test]
async fn test_configured_timeout_applies_without_executor_timeout() {
    let executor = CommandExecutor::new(Duration::from_millis(200));
    let ability = Ability::new("slow", "discovery", AbilityExecutor::new("sh", "linux", "sleep 2"));
    assert_eq!(ability.executors[0].timeout, None);
    let link = link_for(ability, "sleep 2");

    let started = std::time::Instant::now();
    let result = executor.running(&link).await.unwrap();

    assert_eq!(result.exit_code, LinkStatus::TIMEOUT.0);
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[tokio::test]
async fn test_unstartable_program_reports_127() {
    let mut overrides = BTreeMap::new();
    overrides.insert(
        "sh".to_string(),
        vec!["sortie-missing-shell-4c1d".to_string(), "-c".to_string()],
    );
    let executor = CommandExecutor::default().with_overrides(overrides);

    let result = executor.run_command("l1", "id", "sh", None).await.unwrap();

    assert_eq!(result.exit_code, SPAWN_FAILURE_EXIT_CODE);
    assert!(result.stdout.is_empty());
    assert!(!result.stderr.is_empty());
    assert!(result.pid.is_none());
}

#[tokio::test]
async fn test_unknown_shell_is_error() {
    let executor = CommandExecutor::default();
    let ability = Ability::new("odd", "discovery", AbilityExecutor::new("foo", "linux", "id"));
    let link = link_for(ability, "id");

    let err: EngineError = executor.running(&link).await.unwrap_err().into();
    assert!(matches!(err, EngineError::UnknownShell(ref s) if s == "foo"));
}

#[test]
fn test_agent_picks_sh_over_other_executors() {
    let mut ability = Ability::new("multi", "discovery", AbilityExecutor::new("proc", "linux", "id"));
    ability.executors.push(AbilityExecutor::new("sh", "linux", "id -u"));
    let agent = Agent::new("paw", "linux", vec!["proc".to_string(), "sh".to_string()]);

    let chosen = agent.preferred_executor(&ability).unwrap();
    assert_eq!(chosen.name, "sh");
    assert_eq!(chosen.command, "id -u");
}

#[test]
fn test_agent_prefers_psh_on_windows() {
    let mut ability = Ability::new("multi", "discovery", AbilityExecutor::new("pwsh", "windows", "whoami"));
    ability.executors.push(AbilityExecutor::new("psh", "windows", "whoami /all"));
    let agent = Agent::new("paw", "windows", vec!["pwsh".to_string(), "psh".to_string()]);

    assert_eq!(agent.preferred_executor(&ability).unwrap().name, "psh");
}

#[test]
fn test_capabilities_respect_platform_and_privilege() {
    let linux = Ability::new("linux", "discovery", AbilityExecutor::new("sh", "linux", "id"));
    let windows = Ability::new("windows", "discovery", AbilityExecutor::new("psh", "windows", "whoami"));
    let mut elevated = Ability::new("root", "discovery", AbilityExecutor::new("sh", "linux", "cat /etc/shadow"));
    elevated.privilege = Some(Privilege::Elevated);
    let abilities = vec![linux, windows, elevated];

    let user = Agent::new("paw", "linux", vec!["sh".to_string()]);
    let ids: Vec<&str> = user.capabilities(&abilities).iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["linux"]);

    let mut admin = Agent::new("paw", "linux", vec!["sh".to_string()]);
    admin.privilege = Privilege::Elevated;
    let ids: Vec<&str> = admin.capabilities(&abilities).iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["linux", "root"]);
}

#[test]
fn test_no_matching_executor() {
    let ability = Ability::new("win", "discovery", AbilityExecutor::new("psh", "windows", "whoami"));
    let agent = Agent::new("paw", "linux", vec!["sh".to_string()]);
    assert!(agent.preferred_executor(&ability).is_none());
    assert!(agent.capabilities([&ability]).is_empty());
}
