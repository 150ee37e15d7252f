//! Abilities, adversaries, planners, and fact sources
//!
//! Typed inputs an operation is built from. Every struct rejects unknown
//! fields and defaults the optional ones, so a typo in a profile is a load
//! error rather than silently ignored state.

use sdk::parser::ParserConfig;
use sdk::types::{Fact, Relationship, Rule};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::agent::Privilege;

/// Parser invocation declared by an executor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ParserSpec {
    /// Registered parser name
    pub module: String,

    #[serde(default)]
    pub parserconfigs: Vec<ParserConfig>,
}

/// Check a link's used facts must pass before it may run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Requirement {
    /// Registered requirement name (`paw_provenance`, `basic`)
    pub module: String,

    #[serde(default)]
    pub relationship_match: Vec<RelationshipMatch>,
}

/// Trait names a requirement inspects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RelationshipMatch {
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Platform-specific way of running an ability
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AbilityExecutor {
    /// Shell name (`psh`, `pwsh`, `sh`, `proc`)
    pub name: String,

    pub platform: String,

    /// Command template; may contain `#{trait}` placeholders
    #[serde(default)]
    pub command: String,

    #[serde(default)]
    pub cleanup: Vec<String>,

    #[serde(default)]
    pub payloads: Vec<String>,

    #[serde(default)]
    pub uploads: Vec<String>,

    /// Seconds before the command is killed; unset falls back to the
    /// executor's configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub parsers: Vec<ParserSpec>,
}

impl AbilityExecutor {
    pub fn new(name: impl Into<String>, platform: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform: platform.into(),
            command: command.into(),
            cleanup: Vec::new(),
            payloads: Vec::new(),
            uploads: Vec::new(),
            timeout: None,
            parsers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ability {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tactic: String,
    pub technique_id: String,
    pub technique_name: String,
    pub executors: Vec<AbilityExecutor>,
    pub requirements: Vec<Requirement>,
    pub privilege: Option<Privilege>,
    pub repeatable: bool,
    pub singleton: bool,
    /// Planner buckets the ability belongs to
    pub buckets: Vec<String>,
}

impl Ability {
    /// Ability with one executor, placed in the bucket named after its tactic
    pub fn new(id: impl Into<String>, tactic: impl Into<String>, executor: AbilityExecutor) -> Self {
        let id = id.into();
        let tactic = tactic.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            buckets: vec![tactic.clone()],
            tactic,
            technique_id: String::new(),
            technique_name: String::new(),
            executors: vec![executor],
            requirements: Vec::new(),
            privilege: None,
            repeatable: false,
            singleton: false,
        }
    }

    /// Executors runnable on `platform` through one of `names`, in declared order
    pub fn find_executors(&self, names: &[String], platform: &str) -> Vec<&AbilityExecutor> {
        self.executors
            .iter()
            .filter(|e| e.platform == platform && names.iter().any(|n| *n == e.name))
            .collect()
    }

    pub fn in_bucket(&self, bucket: &str) -> bool {
        self.buckets.iter().any(|b| b == bucket)
    }
}

/// Named ordering of abilities plus the objective it pursues
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Adversary {
    #[serde(alias = "adversary_id")]
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub atomic_ordering: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
}

/// Planner configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PlannerSpec {
    pub id: String,

    pub name: String,

    /// Registry key of the planner implementation
    pub module: String,

    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// Facts whose presence stops the planner
    #[serde(default)]
    pub stopping_conditions: Vec<Fact>,

    /// Requirement modules the planner does not enforce
    #[serde(default)]
    pub ignore_enforcement_modules: Vec<String>,

    #[serde(default = "default_true")]
    pub allow_repeatable_abilities: bool,
}

fn default_true() -> bool {
    true
}

impl PlannerSpec {
    /// Planner spec using a registered module under its own name
    pub fn named(module: impl Into<String>) -> Self {
        let module = module.into();
        Self {
            id: module.clone(),
            name: module.clone(),
            module,
            params: BTreeMap::new(),
            stopping_conditions: Vec::new(),
            ignore_enforcement_modules: Vec::new(),
            allow_repeatable_abilities: true,
        }
    }
}

/// Seed facts, relationships, and rules
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct Source {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub facts: Vec<Fact>,

    #[serde(default)]
    pub relationships: Vec<Relationship>,

    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Source {
    pub fn empty(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            ..Default::default()
        }
    }
}
