//! Execution targets
//!
//! An [`Agent`] is a host the engine runs links against. It decides which
//! abilities it can run and through which executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::ability::{Ability, AbilityExecutor};
use sdk::errors::EngineError;

/// Privilege level, ordered from least to most privileged
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Privilege {
    #[default]
    User,
    Elevated,
}

impl FromStr for Privilege {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "elevated" => Ok(Self::Elevated),
            other => Err(EngineError::Config(format!(
                "Unknown privilege '{}'. Choose from 'User' or 'Elevated'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Privilege {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "User"),
            Self::Elevated => write!(f, "Elevated"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub paw: String,
    pub host: String,
    pub username: String,
    pub platform: String,
    /// Available executor names, in the agent's order of preference
    pub executors: Vec<String>,
    pub privilege: Privilege,
    pub group: String,
    pub location: String,
    pub pid: u32,
    pub ppid: u32,
    pub created: DateTime<Utc>,
    /// Ids of links run on this agent
    #[serde(default)]
    pub links: Vec<String>,
}

impl Agent {
    pub fn new(paw: impl Into<String>, platform: impl Into<String>, executors: Vec<String>) -> Self {
        Self {
            paw: paw.into(),
            host: "unknown".to_string(),
            username: "unknown".to_string(),
            platform: platform.into(),
            executors,
            privilege: Privilege::User,
            group: "red".to_string(),
            location: "unknown".to_string(),
            pid: 0,
            ppid: 0,
            created: Utc::now(),
            links: Vec::new(),
        }
    }

    /// Agent describing the machine the engine itself runs on
    pub fn local(paw: impl Into<String>, executors: Vec<String>, privilege: Privilege) -> Self {
        let mut agent = Self::new(paw, std::env::consts::OS, executors);
        agent.privilege = privilege;
        agent.pid = std::process::id();
        agent.host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "localhost".to_string());
        agent.username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        agent.location = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        agent
    }

    pub fn privileged_to_run(&self, ability: &Ability) -> bool {
        ability.privilege.map_or(true, |required| self.privilege >= required)
    }

    /// Abilities this agent may run, in input order
    pub fn capabilities<'a>(&self, abilities: impl IntoIterator<Item = &'a Ability>) -> Vec<&'a Ability> {
        abilities
            .into_iter()
            .filter(|a| {
                self.privileged_to_run(a) && !a.find_executors(&self.executors, &self.platform).is_empty()
            })
            .collect()
    }

    /// Executor to run `ability` with, or `None` if nothing matches
    pub fn preferred_executor<'a>(&self, ability: &'a Ability) -> Option<&'a AbilityExecutor> {
        let candidates = ability.find_executors(&self.executors, &self.platform);
        let preferred = self.preferred_executor_name()?;
        candidates
            .iter()
            .find(|e| e.name == preferred)
            .or_else(|| candidates.first())
            .copied()
    }

    fn preferred_executor_name(&self) -> Option<&str> {
        ["psh", "sh"]
            .into_iter()
            .find(|name| self.executors.iter().any(|e| e == name))
            .or_else(|| self.executors.first().map(String::as_str))
    }

    /// Snapshot attached to event log records
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "paw": self.paw,
            "group": self.group,
            "architecture": std::env::consts::ARCH,
            "username": self.username,
            "location": self.location,
            "pid": self.pid,
            "ppid": self.ppid,
            "privilege": self.privilege.to_string(),
            "host": self.host,
            "platform": self.platform,
            "executors": self.executors,
            "created": self.created.format(crate::operation::event_log::TIME_FORMAT).to_string(),
        })
    }
}
