//! Links and link results
//!
//! A [`Link`] is one ability bound to one executor and one agent. Its command,
//! ability, and decide time are fixed at creation. The execution fields
//! (`collect`, `finish`, `status`, `pid`, `output`, `agent_reported_time`) go
//! from unset to set exactly once, through [`Link::finalize`].

use chrono::{DateTime, Utc};
use sdk::types::{Fact, Relationship};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::ability::{Ability, AbilityExecutor};

/// Numeric link status
///
/// Non-negative values are exit codes. Negative values are reserved for links
/// that have not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkStatus(pub i32);

impl LinkStatus {
    pub const SUCCESS: Self = Self(0);
    pub const HIGH_VIZ: Self = Self(-5);
    pub const UNTRUSTED: Self = Self(-4);
    /// Queued by an autonomous planner
    pub const EXECUTE: Self = Self(-3);
    /// Discarded by an operator before running
    pub const DISCARD: Self = Self(-2);
    /// Queued manually, waiting for approval
    pub const PAUSE: Self = Self(-1);
    /// Killed by the per-link timeout
    pub const TIMEOUT: Self = Self(124);

    pub fn is_pending(self) -> bool {
        matches!(self, Self::EXECUTE | Self::PAUSE)
    }
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Captured outcome of running one link
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkResult {
    pub link_id: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub pid: Option<u32>,
    pub agent_reported_time: DateTime<Utc>,
}

impl LinkResult {
    /// Result for a link whose command was killed because the operation closed
    pub fn interrupted(link_id: impl Into<String>) -> Self {
        Self {
            link_id: link_id.into(),
            stdout: String::new(),
            stderr: "Command interrupted: operation closed".to_string(),
            exit_code: LinkStatus::TIMEOUT.0,
            pid: None,
            agent_reported_time: Utc::now(),
        }
    }

    pub fn has_output(&self) -> bool {
        !self.stdout.is_empty() || !self.stderr.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Link {
    pub id: String,
    #[serde(skip)]
    pub ability: Arc<Ability>,
    pub executor: AbilityExecutor,
    pub paw: String,
    /// Rendered command, after obfuscation
    pub command: String,
    pub plaintext_command: String,
    pub decide: DateTime<Utc>,
    pub collect: Option<DateTime<Utc>>,
    pub finish: Option<DateTime<Utc>>,
    pub status: LinkStatus,
    pub pid: Option<u32>,
    /// Whether the run produced stdout or stderr
    pub output: bool,
    pub agent_reported_time: Option<DateTime<Utc>>,
    pub score: i64,
    pub jitter: u64,
    /// Facts substituted into the command
    pub used: Vec<Fact>,
    /// Facts learned from this link's output
    pub facts: Vec<Fact>,
    pub relationships: Vec<Relationship>,
    /// Marks links generated from executor cleanup commands
    pub cleanup: bool,
}

impl Link {
    pub fn new(
        ability: Arc<Ability>,
        executor: AbilityExecutor,
        paw: impl Into<String>,
        command: impl Into<String>,
        status: LinkStatus,
    ) -> Self {
        let command = command.into();
        Self {
            id: Uuid::new_v4().to_string(),
            ability,
            executor,
            paw: paw.into(),
            plaintext_command: command.clone(),
            command,
            decide: Utc::now(),
            collect: None,
            finish: None,
            status,
            pid: None,
            output: false,
            agent_reported_time: None,
            score: 0,
            jitter: 0,
            used: Vec::new(),
            facts: Vec::new(),
            relationships: Vec::new(),
            cleanup: false,
        }
    }

    /// Discarded or high-visibility links never ran and are left out of reports
    pub fn can_ignore(&self) -> bool {
        matches!(self.status, LinkStatus::DISCARD | LinkStatus::HIGH_VIZ)
    }

    pub fn is_finished(&self) -> bool {
        self.finish.is_some()
    }

    /// Record a result; a second call is ignored and returns `false`
    pub fn finalize(&mut self, result: &LinkResult) -> bool {
        if self.finish.is_some() {
            return false;
        }
        let now = Utc::now();
        self.collect = Some(now);
        self.finish = Some(now);
        self.status = LinkStatus(result.exit_code);
        self.pid = result.pid;
        self.output = result.has_output();
        self.agent_reported_time = Some(result.agent_reported_time);
        true
    }

    /// Record a learned fact, deduplicated by key
    pub fn add_fact(&mut self, fact: Fact) {
        if !self.facts.contains(&fact) {
            self.facts.push(fact);
        }
    }

    pub fn add_relationship(&mut self, relationship: Relationship) {
        if !self.relationships.contains(&relationship) {
            self.relationships.push(relationship);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> Link {
        let ability = Arc::new(Ability::new("a", "discovery", AbilityExecutor::new("sh", "linux", "id")));
        let executor = ability.executors[0].clone();
        Link::new(ability, executor, "paw", "id", LinkStatus::EXECUTE)
    }

    fn result(id: &str, exit_code: i32) -> LinkResult {
        LinkResult {
            link_id: id.to_string(),
            stdout: String::new(),
            stderr: "boom".to_string(),
            exit_code,
            pid: Some(42),
            agent_reported_time: Utc::now(),
        }
    }

    #[test]
    fn test_finalize_sets_fields_once() {
        let mut link = link();
        assert!(link.status.is_pending());
        let first = result(&link.id, 2);
        assert!(link.finalize(&first));
        assert_eq!(link.status, LinkStatus(2));
        assert!(link.output);
        let finish = link.finish;

        assert!(!link.finalize(&result(&link.id, 0)));
        assert_eq!(link.status, LinkStatus(2));
        assert_eq!(link.finish, finish);
    }

    #[test]
    fn test_can_ignore() {
        let mut link = link();
        assert!(!link.can_ignore());
        link.status = LinkStatus::DISCARD;
        assert!(link.can_ignore());
        link.status = LinkStatus::HIGH_VIZ;
        assert!(link.can_ignore());
    }
}
