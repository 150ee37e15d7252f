//! Profile documents
//!
//! A profile is a single TOML file describing everything an operation needs
//! except its agents: the abilities, the adversary ordering them, fact
//! sources, planner configurations, and objectives.
//!
//! ```toml
//! name = "discovery sweep"
//!
//! [adversary]
//! id = "adv-1"
//! name = "Sweeper"
//! atomic_ordering = ["whoami"]
//!
//! [[abilities]]
//! id = "whoami"
//! tactic = "discovery"
//! technique = { attack_id = "T1033", name = "System Owner/User Discovery" }
//!
//! [[abilities.executors]]
//! name = "sh"
//! platform = "linux"
//! command = "whoami"
//! ```
//!
//! Loading is strict: missing required fields and unknown keys are errors,
//! executor shells and requirement modules are checked against what the
//! engine supports, and a `default` objective is added when none is declared.

use sdk::errors::EngineError;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::ability::{Ability, AbilityExecutor, Adversary, PlannerSpec, Requirement, Source};
use crate::agent::Privilege;
use crate::command_executor::ShellType;
use crate::objective::Objective;
use crate::parsers::ParserRegistry;
use crate::planner::PlannerRegistry;
use crate::planning::REQUIREMENT_MODULES;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProfile {
    #[serde(default)]
    name: Option<String>,

    adversary: Adversary,

    #[serde(default)]
    abilities: Vec<RawAbility>,

    #[serde(default)]
    sources: Vec<Source>,

    #[serde(default)]
    planners: Vec<PlannerSpec>,

    #[serde(default)]
    objectives: Vec<Objective>,

    /// Id of the source to seed from; the first declared source otherwise
    #[serde(default)]
    source: Option<String>,

    /// Id, name, or module of the planner to run
    #[serde(default)]
    planner: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTechnique {
    attack_id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAbility {
    #[serde(alias = "ability_id")]
    id: String,

    #[serde(default)]
    name: Option<String>,

    #[serde(default)]
    description: String,

    tactic: String,

    #[serde(default)]
    technique_id: Option<String>,

    #[serde(default)]
    technique_name: Option<String>,

    #[serde(default)]
    technique: Option<RawTechnique>,

    #[serde(default)]
    executors: Vec<AbilityExecutor>,

    #[serde(default)]
    requirements: Vec<Requirement>,

    #[serde(default)]
    privilege: Option<String>,

    #[serde(default)]
    repeatable: bool,

    #[serde(default)]
    singleton: bool,

    #[serde(default)]
    buckets: Vec<String>,
}

impl RawAbility {
    fn into_ability(self) -> Result<Ability, EngineError> {
        let privilege = self
            .privilege
            .as_deref()
            .map(Privilege::from_str)
            .transpose()
            .map_err(|e| EngineError::Profile(format!("ability {}: {}", self.id, e)))?;

        for executor in &self.executors {
            ShellType::from_str(&executor.name)?;
            if executor.timeout == Some(0) {
                return Err(EngineError::Profile(format!(
                    "ability {}: executor '{}' timeout must be positive",
                    self.id, executor.name
                )));
            }
        }
        for requirement in &self.requirements {
            if !REQUIREMENT_MODULES.contains(&requirement.module.as_str()) {
                return Err(EngineError::Profile(format!(
                    "ability {}: unknown requirement module '{}'",
                    self.id, requirement.module
                )));
            }
        }

        let (technique_id, technique_name) = match self.technique {
            Some(t) => (
                self.technique_id.unwrap_or(t.attack_id),
                self.technique_name.unwrap_or(t.name),
            ),
            None => (
                self.technique_id.unwrap_or_default(),
                self.technique_name.unwrap_or_default(),
            ),
        };
        let buckets = if self.buckets.is_empty() {
            vec![self.tactic.clone()]
        } else {
            self.buckets
        };

        Ok(Ability {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            description: self.description,
            tactic: self.tactic,
            technique_id,
            technique_name,
            executors: self.executors,
            requirements: self.requirements,
            privilege,
            repeatable: self.repeatable,
            singleton: self.singleton,
            buckets,
        })
    }
}

/// Validated profile document
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub adversary: Adversary,
    pub abilities: Vec<Ability>,
    pub sources: Vec<Source>,
    pub planners: Vec<PlannerSpec>,
    pub objectives: Vec<Objective>,
    source_id: Option<String>,
    planner_id: Option<String>,
}

impl Profile {
    /// Parse and validate a profile from TOML text
    ///
    /// # Errors
    /// `EngineError::Profile` for malformed documents, missing or unknown
    /// fields, duplicate ability ids, and unknown requirement modules;
    /// `EngineError::UnknownShell` for executors naming an unsupported shell.
    pub fn from_toml(text: &str) -> Result<Self, EngineError> {
        let raw: RawProfile = toml::from_str(text).map_err(|e| EngineError::Profile(e.to_string()))?;

        let mut seen = HashSet::new();
        let mut abilities = Vec::with_capacity(raw.abilities.len());
        for ability in raw.abilities {
            if !seen.insert(ability.id.clone()) {
                return Err(EngineError::Profile(format!("duplicate ability id '{}'", ability.id)));
            }
            abilities.push(ability.into_ability()?);
        }

        for id in &raw.adversary.atomic_ordering {
            if !seen.contains(id) {
                warn!(adversary = %raw.adversary.name, ability_id = %id, "Adversary references an ability the profile does not define");
            }
        }

        let mut objectives = raw.objectives;
        if !objectives.iter().any(|o| o.name == "default") {
            objectives.push(Objective::default_objective());
        }
        if let Some(id) = &raw.adversary.objective {
            if !objectives.iter().any(|o| &o.id == id) {
                warn!(objective = %id, "Adversary objective not in profile, the default objective will be used");
            }
        }

        if let Some(id) = &raw.source {
            if !raw.sources.iter().any(|s| &s.id == id) {
                return Err(EngineError::Profile(format!("source '{}' is not declared", id)));
            }
        }

        let profile = Self {
            name: raw.name.unwrap_or_else(|| raw.adversary.name.clone()),
            adversary: raw.adversary,
            abilities,
            sources: raw.sources,
            planners: raw.planners,
            objectives,
            source_id: raw.source,
            planner_id: raw.planner,
        };
        debug!(
            profile = %profile.name,
            abilities = profile.abilities.len(),
            sources = profile.sources.len(),
            planners = profile.planners.len(),
            "Loaded profile"
        );
        Ok(profile)
    }

    pub async fn load(path: &Path) -> Result<Self, EngineError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&text)
            .map_err(|e| match e {
                EngineError::Profile(msg) => EngineError::Profile(format!("{}: {}", path.display(), msg)),
                other => other,
            })
    }

    /// Check parser and planner names against what is registered
    pub fn validate(&self, parsers: &ParserRegistry, planners: &PlannerRegistry) -> Result<(), EngineError> {
        for ability in &self.abilities {
            for parser in ability.executors.iter().flat_map(|e| e.parsers.iter()) {
                if !parsers.contains(&parser.module) {
                    return Err(EngineError::ParserNotFound(format!(
                        "{} (ability {})",
                        parser.module, ability.id
                    )));
                }
            }
        }
        for spec in &self.planners {
            if !planners.contains(&spec.module) {
                return Err(EngineError::PlannerNotFound(spec.module.clone()));
            }
        }
        Ok(())
    }

    /// Source the operation seeds from
    pub fn source(&self) -> Option<&Source> {
        match &self.source_id {
            Some(id) => self.sources.iter().find(|s| &s.id == id),
            None => self.sources.first(),
        }
    }

    /// Planner to run: `requested`, then the profile's choice, then `fallback`
    ///
    /// Names are matched against declared planner ids, names, and modules; a
    /// name no declared planner matches is used as a bare module name.
    pub fn planner(&self, requested: Option<&str>, fallback: &str) -> PlannerSpec {
        let wanted = requested
            .or(self.planner_id.as_deref())
            .unwrap_or(fallback);
        self.planners
            .iter()
            .find(|p| p.id == wanted || p.name == wanted)
            .or_else(|| self.planners.iter().find(|p| p.module == wanted))
            .cloned()
            .unwrap_or_else(|| PlannerSpec::named(wanted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [adversary]
        id = "adv"
        name = "Adversary"
        atomic_ordering = ["a1"]

        [[abilities]]
        id = "a1"
        tactic = "discovery"

        [[abilities.executors]]
        name = "sh"
        platform = "linux"
        command = "whoami"
    "#;

    #[test]
    fn test_minimal_profile_defaults() {
        let profile = Profile::from_toml(MINIMAL).unwrap();
        assert_eq!(profile.name, "Adversary");
        let ability = &profile.abilities[0];
        assert_eq!(ability.name, "a1");
        assert_eq!(ability.buckets, vec!["discovery"]);
        assert_eq!(ability.executors[0].timeout, None);
        assert!(profile.objectives.iter().any(|o| o.name == "default"));
        assert!(profile.source().is_none());
    }

    #[test]
    fn test_technique_table_fills_flat_fields() {
        let text = MINIMAL.replace(
            "tactic = \"discovery\"",
            "tactic = \"discovery\"\ntechnique = { attack_id = \"T1033\", name = \"Owner Discovery\" }",
        );
        let profile = Profile::from_toml(&text).unwrap();
        assert_eq!(profile.abilities[0].technique_id, "T1033");
        assert_eq!(profile.abilities[0].technique_name, "Owner Discovery");
    }

    #[test]
    fn test_missing_required_field() {
        let text = MINIMAL.replace("tactic = \"discovery\"", "");
        let err = Profile::from_toml(&text).unwrap_err();
        assert!(matches!(err, EngineError::Profile(ref msg) if msg.contains("tactic")));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let text = MINIMAL.replace("tactic = \"discovery\"", "tactic = \"discovery\"\ncolour = \"red\"");
        assert!(matches!(Profile::from_toml(&text), Err(EngineError::Profile(_))));
    }

    #[test]
    fn test_unknown_shell_rejected() {
        let text = MINIMAL.replace("name = \"sh\"", "name = \"foo\"");
        assert!(matches!(Profile::from_toml(&text), Err(EngineError::UnknownShell(s)) if s == "foo"));
    }

    #[test]
    fn test_unknown_requirement_module() {
        let text = format!("{}\n[[abilities.requirements]]\nmodule = \"psychic\"\n", MINIMAL);
        assert!(matches!(Profile::from_toml(&text), Err(EngineError::Profile(_))));
    }

    #[test]
    fn test_duplicate_ability_ids() {
        let text = format!(
            "{}\n[[abilities]]\nid = \"a1\"\ntactic = \"collection\"\n",
            MINIMAL
        );
        assert!(matches!(Profile::from_toml(&text), Err(EngineError::Profile(ref m)) if m.contains("duplicate")));
    }

    #[test]
    fn test_privilege_parsed_case_insensitively() {
        let text = MINIMAL.replace("tactic = \"discovery\"", "tactic = \"discovery\"\nprivilege = \"elevated\"");
        let profile = Profile::from_toml(&text).unwrap();
        assert_eq!(profile.abilities[0].privilege, Some(Privilege::Elevated));
    }

    #[test]
    fn test_planner_resolution() {
        let text = format!(
            "planner = \"fast\"\n{}\n[[planners]]\nid = \"p1\"\nname = \"fast\"\nmodule = \"atomic\"\n",
            MINIMAL
        );
        let profile = Profile::from_toml(&text).unwrap();
        assert_eq!(profile.planner(None, "privileged_persistence").module, "atomic");
        assert_eq!(
            profile.planner(Some("privileged_persistence"), "atomic").module,
            "privileged_persistence"
        );
    }

    #[test]
    fn test_validate_unknown_parser() {
        let text = format!(
            "{}\n[[abilities.executors.parsers]]\nmodule = \"nmap\"\n",
            MINIMAL
        );
        let profile = Profile::from_toml(&text).unwrap();
        let err = profile
            .validate(&ParserRegistry::new(), &PlannerRegistry::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::ParserNotFound(_)));
    }

    #[test]
    fn test_zero_executor_timeout_rejected() {
        let err = Profile::from_toml(&format!("{}timeout = 0\n", MINIMAL)).unwrap_err();
        assert!(matches!(err, EngineError::Profile(ref msg) if msg.contains("timeout")));

        let profile = Profile::from_toml(&format!("{}timeout = 5\n", MINIMAL)).unwrap();
        assert_eq!(profile.abilities[0].executors[0].timeout, Some(5));
    }
}
