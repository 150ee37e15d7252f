//! Knowledge value types shared by the engine and output parsers

use serde::{Deserialize, Serialize};

/// Where a fact came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OriginType {
    /// Copied from the operation's fact source at start
    Seeded,
    /// Extracted from command output during the operation
    #[default]
    Learned,
    /// Loaded from a previously persisted source
    Imported,
    /// Entered by an operator
    User,
}

/// A scored (trait, value) observation
///
/// Score is a soft suppression signal: facts with a score of zero or less stay
/// in the knowledge store but are ignored by objectives and link generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fact {
    #[serde(rename = "trait")]
    pub trait_name: String,

    pub value: String,

    #[serde(default = "default_score")]
    pub score: i64,

    #[serde(default)]
    pub origin_type: OriginType,

    /// Identity of the source (fact source id or operation id) that owns this fact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Paws of the agents whose output produced this fact
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collected_by: Vec<String>,

    /// Ids of the links that produced this fact
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
}

fn default_score() -> i64 {
    1
}

impl Fact {
    /// Create a learned fact with the default score
    pub fn new(trait_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            trait_name: trait_name.into(),
            value: value.into(),
            score: default_score(),
            origin_type: OriginType::Learned,
            source: None,
            collected_by: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Set the score
    pub fn with_score(mut self, score: i64) -> Self {
        self.score = score;
        self
    }

    /// Set the owning source
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the origin type
    pub fn with_origin(mut self, origin_type: OriginType) -> Self {
        self.origin_type = origin_type;
        self
    }

    /// Key identifying the observation regardless of who made it
    pub fn unique(&self) -> String {
        format!("{}{}", self.trait_name, self.value)
    }

    /// Whether the fact may count towards objectives and link generation
    pub fn is_active(&self) -> bool {
        self.score > 0
    }

    /// Merge provenance from another copy of the same observation
    pub fn absorb(&mut self, other: &Fact) {
        for paw in &other.collected_by {
            if !self.collected_by.contains(paw) {
                self.collected_by.push(paw.clone());
            }
        }
        for link in &other.links {
            if !self.links.contains(link) {
                self.links.push(link.clone());
            }
        }
    }
}

impl PartialEq for Fact {
    fn eq(&self, other: &Self) -> bool {
        self.trait_name == other.trait_name
            && self.value == other.value
            && self.source == other.source
    }
}

/// A labelled edge between two facts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Relationship {
    pub source: Fact,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Fact>,

    #[serde(default = "default_score")]
    pub score: i64,

    /// Identity of the source or link that produced the relationship
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl Relationship {
    /// Create a relationship with no edge and no target
    pub fn new(source: Fact) -> Self {
        Self {
            source,
            edge: None,
            target: None,
            score: default_score(),
            origin: None,
        }
    }

    /// Attach an edge label and a target fact
    pub fn with_target(mut self, edge: Option<String>, target: Fact) -> Self {
        self.edge = edge;
        self.target = Some(target);
        self
    }

    /// Attach an edge label without a target
    pub fn with_edge(mut self, edge: impl Into<String>) -> Self {
        self.edge = Some(edge.into());
        self
    }

    /// Both ends of the relationship
    pub fn facts(&self) -> impl Iterator<Item = &Fact> {
        std::iter::once(&self.source).chain(self.target.iter())
    }
}

impl PartialEq for Relationship {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.edge == other.edge && self.target == other.target
    }
}

/// Allow or deny
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleAction {
    Allow,
    Deny,
}

/// Restricts which values of a trait may be substituted into commands
///
/// `pattern` is a regular expression matched against the start of the fact value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub action: RuleAction,

    #[serde(rename = "trait")]
    pub trait_name: String,

    #[serde(rename = "match", default = "default_rule_pattern")]
    pub pattern: String,
}

fn default_rule_pattern() -> String {
    ".*".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fact_equality_ignores_score_and_provenance() {
        let a = Fact::new("host.user.name", "root").with_score(5);
        let mut b = Fact::new("host.user.name", "root");
        b.collected_by.push("abc123".into());
        assert_eq!(a, b);

        let c = Fact::new("host.user.name", "root").with_source("op-1");
        assert_ne!(a, c);
    }

    #[test]
    fn test_absorb_merges_provenance_once() {
        let mut a = Fact::new("t", "v");
        a.collected_by.push("paw1".into());
        let mut b = Fact::new("t", "v");
        b.collected_by.push("paw1".into());
        b.collected_by.push("paw2".into());
        b.links.push("link-1".into());

        a.absorb(&b);
        a.absorb(&b);
        assert_eq!(a.collected_by, vec!["paw1", "paw2"]);
        assert_eq!(a.links, vec!["link-1"]);
    }

    #[test]
    fn test_fact_deserializes_with_defaults() {
        let fact: Fact = serde_json::from_str(r#"{"trait": "a.b", "value": "c"}"#).unwrap();
        assert_eq!(fact.score, 1);
        assert_eq!(fact.origin_type, OriginType::Learned);
        assert!(fact.is_active());
    }

    #[test]
    fn test_fact_rejects_unknown_fields() {
        let parsed: Result<Fact, _> =
            serde_json::from_str(r#"{"trait": "a", "value": "b", "colour": "red"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_rule_defaults_to_match_everything() {
        let rule: Rule = serde_json::from_str(r#"{"action": "DENY", "trait": "a"}"#).unwrap();
        assert_eq!(rule.pattern, ".*");
        assert_eq!(rule.action, RuleAction::Deny);
    }
}
