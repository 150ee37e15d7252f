//! Event log records
//!
//! One record per link that actually ran, written as a JSON array to
//! `<data_dir>/event_logs/operation_<id>.json` when an operation ends.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::ability::Ability;
use crate::link::{Link, LinkResult};

pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn format_time(time: &DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AbilityMetadata {
    pub ability_id: String,
    pub ability_name: String,
    pub ability_description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationMetadata {
    pub operation_name: String,
    pub operation_start: Option<String>,
    pub operation_adversary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttackMetadata {
    pub tactic: String,
    pub technique_name: String,
    pub technique_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventLogEntry {
    pub command: String,
    pub plaintext_command: String,
    pub delegated_timestamp: String,
    pub collected_timestamp: Option<String>,
    pub finished_timestamp: Option<String>,
    pub status: i32,
    pub platform: String,
    pub executor: String,
    pub pid: Option<u32>,
    pub agent_metadata: serde_json::Value,
    pub ability_metadata: AbilityMetadata,
    pub operation_metadata: OperationMetadata,
    pub attack_metadata: AttackMetadata,
    /// Decoded `{stdout, stderr, exit_code}` of the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_reported_time: Option<String>,
}

impl EventLogEntry {
    pub fn from_link(
        link: &Link,
        agent_metadata: serde_json::Value,
        operation_metadata: OperationMetadata,
        output: Option<serde_json::Value>,
    ) -> Self {
        Self {
            command: link.command.clone(),
            plaintext_command: link.plaintext_command.clone(),
            delegated_timestamp: format_time(&link.decide),
            collected_timestamp: link.collect.as_ref().map(format_time),
            finished_timestamp: link.finish.as_ref().map(format_time),
            status: link.status.0,
            platform: link.executor.platform.clone(),
            executor: link.executor.name.clone(),
            pid: link.pid,
            agent_metadata,
            ability_metadata: ability_metadata(&link.ability),
            operation_metadata,
            attack_metadata: attack_metadata(&link.ability),
            output,
            agent_reported_time: link.agent_reported_time.as_ref().map(format_time),
        }
    }
}

fn ability_metadata(ability: &Ability) -> AbilityMetadata {
    AbilityMetadata {
        ability_id: ability.id.clone(),
        ability_name: ability.name.clone(),
        ability_description: ability.description.clone(),
    }
}

fn attack_metadata(ability: &Ability) -> AttackMetadata {
    AttackMetadata {
        tactic: ability.tactic.clone(),
        technique_name: ability.technique_name.clone(),
        technique_id: ability.technique_id.clone(),
    }
}

/// Base64 of the JSON `{stdout, stderr, exit_code}` object for a result
pub fn encode_result(result: &LinkResult) -> Result<String, EngineError> {
    let body = serde_json::to_vec(&serde_json::json!({
        "stdout": result.stdout,
        "stderr": result.stderr,
        "exit_code": result.exit_code,
    }))
    .map_err(|e| EngineError::Serialization(e.to_string()))?;
    Ok(STANDARD.encode(body))
}

/// Inverse of [`encode_result`]
pub fn decode_result(payload: &str) -> Result<serde_json::Value, EngineError> {
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| EngineError::Serialization(format!("Invalid result encoding: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| EngineError::Serialization(format!("Invalid result body: {}", e)))
}

/// Write `entries` as `operation_<id>.json` under `dir`, returning the file path
pub async fn write_event_logs(
    dir: &Path,
    operation_id: &str,
    entries: &[EventLogEntry],
) -> Result<PathBuf, EngineError> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("operation_{}.json", operation_id));
    let mut body =
        serde_json::to_string(entries).map_err(|e| EngineError::Serialization(e.to_string()))?;
    body.push('\n');
    tokio::fs::write(&path, body).await?;
    debug!(path = %path.display(), records = entries.len(), "Wrote event logs");
    Ok(path)
}
