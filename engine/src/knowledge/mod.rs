//! Knowledge store
//!
//! Holds every fact, relationship, and rule known to the engine. All methods
//! take `&self`; the store synchronizes internally so the learning path can
//! write while planners and objectives read.
//!
//! Facts are keyed by `(trait, value, source)`. Adding a fact that already
//! exists merges its provenance into the stored copy instead of duplicating it.
//! A fact whose score drops to zero or below stays in the store; callers that
//! care about relevance filter on [`Fact::is_active`].

use sdk::types::{Fact, OriginType, Relationship, Rule};
use tokio::sync::RwLock;
use tracing::debug;

/// Structural match over facts; unset fields match anything
#[derive(Debug, Clone, Default)]
pub struct FactCriteria {
    pub trait_name: Option<String>,
    pub value: Option<String>,
    pub source: Option<String>,
    pub origin_type: Option<OriginType>,
    pub collected_by: Option<String>,
}

impl FactCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trait_name(mut self, trait_name: impl Into<String>) -> Self {
        self.trait_name = Some(trait_name.into());
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn origin_type(mut self, origin_type: OriginType) -> Self {
        self.origin_type = Some(origin_type);
        self
    }

    pub fn collected_by(mut self, paw: impl Into<String>) -> Self {
        self.collected_by = Some(paw.into());
        self
    }

    /// Criteria matching exactly the key of `fact`
    pub fn for_fact(fact: &Fact) -> Self {
        Self {
            trait_name: Some(fact.trait_name.clone()),
            value: Some(fact.value.clone()),
            source: fact.source.clone(),
            ..Self::default()
        }
    }

    pub fn matches(&self, fact: &Fact) -> bool {
        self.trait_name
            .as_ref()
            .map_or(true, |t| &fact.trait_name == t)
            && self.value.as_ref().map_or(true, |v| &fact.value == v)
            && self
                .source
                .as_ref()
                .map_or(true, |s| fact.source.as_ref() == Some(s))
            && self.origin_type.map_or(true, |o| fact.origin_type == o)
            && self
                .collected_by
                .as_ref()
                .map_or(true, |p| fact.collected_by.contains(p))
    }
}

/// Fields to change on matching facts
#[derive(Debug, Clone, Default)]
pub struct FactUpdate {
    pub value: Option<String>,
    pub score: Option<i64>,
    /// Added to the current score after `score` is applied
    pub score_delta: Option<i64>,
    pub origin_type: Option<OriginType>,
}

/// Structural match over relationships
#[derive(Debug, Clone, Default)]
pub struct RelationshipCriteria {
    pub source: Option<FactCriteria>,
    pub edge: Option<String>,
    pub target: Option<FactCriteria>,
    pub origin: Option<String>,
}

impl RelationshipCriteria {
    pub fn matches(&self, relationship: &Relationship) -> bool {
        self.source
            .as_ref()
            .map_or(true, |c| c.matches(&relationship.source))
            && self
                .edge
                .as_ref()
                .map_or(true, |e| relationship.edge.as_ref() == Some(e))
            && self.target.as_ref().map_or(true, |c| {
                relationship.target.as_ref().is_some_and(|t| c.matches(t))
            })
            && self
                .origin
                .as_ref()
                .map_or(true, |o| relationship.origin.as_ref() == Some(o))
    }
}

#[derive(Debug, Default)]
struct Inner {
    facts: Vec<Fact>,
    relationships: Vec<Relationship>,
    rules: Vec<(Option<String>, Rule)>,
}

/// In-process fact, relationship, and rule store
#[derive(Debug, Default)]
pub struct KnowledgeStore {
    inner: RwLock<Inner>,
}

impl KnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fact, merging provenance into an existing copy
    ///
    /// Returns `true` when the fact was not known before.
    pub async fn add_fact(&self, fact: Fact) -> bool {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.facts.iter_mut().find(|f| **f == fact) {
            existing.absorb(&fact);
            return false;
        }
        debug!(trait_name = %fact.trait_name, value = %fact.value, "Fact added");
        inner.facts.push(fact);
        true
    }

    /// Apply `update` to every fact matching `criteria`, returning how many changed
    pub async fn update_fact(&self, criteria: &FactCriteria, update: &FactUpdate) -> usize {
        let mut inner = self.inner.write().await;
        let mut changed = 0;
        for fact in inner.facts.iter_mut().filter(|f| criteria.matches(f)) {
            if let Some(value) = &update.value {
                fact.value = value.clone();
            }
            if let Some(score) = update.score {
                fact.score = score;
            }
            if let Some(delta) = update.score_delta {
                fact.score += delta;
            }
            if let Some(origin_type) = update.origin_type {
                fact.origin_type = origin_type;
            }
            changed += 1;
        }
        changed
    }

    pub async fn get_facts(&self, criteria: &FactCriteria) -> Vec<Fact> {
        let inner = self.inner.read().await;
        inner
            .facts
            .iter()
            .filter(|f| criteria.matches(f))
            .cloned()
            .collect()
    }

    /// Remove matching facts, returning how many were removed
    pub async fn delete_fact(&self, criteria: &FactCriteria) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.facts.len();
        inner.facts.retain(|f| !criteria.matches(f));
        before - inner.facts.len()
    }

    /// Whether `fact` is present, either in the store or in `listing` when given
    pub async fn check_fact_exists(&self, fact: &Fact, listing: Option<&[Fact]>) -> bool {
        match listing {
            Some(facts) => facts.iter().any(|f| f == fact),
            None => {
                let criteria = FactCriteria::for_fact(fact);
                let inner = self.inner.read().await;
                inner.facts.iter().any(|f| criteria.matches(f))
            }
        }
    }

    /// Source identity and origin type of the first stored copy of `fact`
    pub async fn fact_origin(&self, trait_name: &str, value: &str) -> Option<(Option<String>, OriginType)> {
        let inner = self.inner.read().await;
        inner
            .facts
            .iter()
            .find(|f| f.trait_name == trait_name && f.value == value)
            .map(|f| (f.source.clone(), f.origin_type))
    }

    /// Add a relationship; both ends are added as facts too
    pub async fn add_relationship(&self, relationship: Relationship) -> bool {
        for fact in relationship.facts() {
            self.add_fact(fact.clone()).await;
        }
        let mut inner = self.inner.write().await;
        if inner.relationships.contains(&relationship) {
            return false;
        }
        inner.relationships.push(relationship);
        true
    }

    pub async fn get_relationships(&self, criteria: &RelationshipCriteria) -> Vec<Relationship> {
        let inner = self.inner.read().await;
        inner
            .relationships
            .iter()
            .filter(|r| criteria.matches(r))
            .cloned()
            .collect()
    }

    pub async fn delete_relationship(&self, criteria: &RelationshipCriteria) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.relationships.len();
        inner.relationships.retain(|r| !criteria.matches(r));
        before - inner.relationships.len()
    }

    /// Add a rule owned by `source`
    pub async fn add_rule(&self, rule: Rule, source: Option<String>) {
        let mut inner = self.inner.write().await;
        if !inner.rules.iter().any(|(s, r)| *s == source && *r == rule) {
            inner.rules.push((source, rule));
        }
    }

    /// Rules for `trait_name` (all rules when `None`), in insertion order
    pub async fn get_rules(&self, trait_name: Option<&str>, source: Option<&str>) -> Vec<Rule> {
        let inner = self.inner.read().await;
        inner
            .rules
            .iter()
            .filter(|(s, r)| {
                trait_name.map_or(true, |t| r.trait_name == t)
                    && source.map_or(true, |src| s.as_deref() == Some(src))
            })
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub async fn delete_rules(&self, trait_name: &str) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.rules.len();
        inner.rules.retain(|(_, r)| r.trait_name != trait_name);
        before - inner.rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::types::RuleAction;

    #[tokio::test]
    async fn test_add_fact_merges_duplicates() {
        let store = KnowledgeStore::new();
        let mut first = Fact::new("host.user.name", "root").with_source("op");
        first.collected_by.push("paw1".into());
        let mut second = first.clone();
        second.collected_by = vec!["paw2".into()];

        assert!(store.add_fact(first).await);
        assert!(!store.add_fact(second).await);

        let facts = store.get_facts(&FactCriteria::new()).await;
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].collected_by, vec!["paw1", "paw2"]);
    }

    #[tokio::test]
    async fn test_get_facts_filters_by_source() {
        let store = KnowledgeStore::new();
        store.add_fact(Fact::new("a", "1").with_source("src-1")).await;
        store.add_fact(Fact::new("a", "1").with_source("op-1")).await;
        store.add_fact(Fact::new("b", "2").with_source("op-1")).await;

        let op_facts = store.get_facts(&FactCriteria::new().source("op-1")).await;
        assert_eq!(op_facts.len(), 2);
        let seeded = store.get_facts(&FactCriteria::new().source("src-1")).await;
        assert_eq!(seeded.len(), 1);
    }

    #[tokio::test]
    async fn test_score_suppression_keeps_fact() {
        let store = KnowledgeStore::new();
        let fact = Fact::new("a", "1");
        store.add_fact(fact.clone()).await;

        let changed = store
            .update_fact(
                &FactCriteria::for_fact(&fact),
                &FactUpdate {
                    score_delta: Some(-1),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(changed, 1);

        let facts = store.get_facts(&FactCriteria::new().trait_name("a")).await;
        assert_eq!(facts.len(), 1);
        assert!(!facts[0].is_active());
    }

    #[tokio::test]
    async fn test_check_fact_exists_store_and_listing() {
        let store = KnowledgeStore::new();
        let fact = Fact::new("a", "1");
        assert!(!store.check_fact_exists(&fact, None).await);
        store.add_fact(fact.clone()).await;
        assert!(store.check_fact_exists(&fact, None).await);

        let listing = vec![Fact::new("b", "2")];
        assert!(!store.check_fact_exists(&fact, Some(&listing)).await);
    }

    #[tokio::test]
    async fn test_relationship_adds_both_facts() {
        let store = KnowledgeStore::new();
        let rel = Relationship::new(Fact::new("host.user.name", "bob"))
            .with_target(Some("has_password".into()), Fact::new("host.user.password", "pw"));
        assert!(store.add_relationship(rel.clone()).await);
        assert!(!store.add_relationship(rel).await);

        assert_eq!(store.get_facts(&FactCriteria::new()).await.len(), 2);
        let found = store
            .get_relationships(&RelationshipCriteria {
                edge: Some("has_password".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_rules_by_trait() {
        let store = KnowledgeStore::new();
        let rule = Rule {
            action: RuleAction::Deny,
            trait_name: "host.file.path".into(),
            pattern: ".*".into(),
        };
        store.add_rule(rule.clone(), Some("src".into())).await;
        store.add_rule(rule, Some("src".into())).await;
        assert_eq!(store.get_rules(Some("host.file.path"), None).await.len(), 1);
        assert!(store.get_rules(Some("other"), None).await.is_empty());
        assert_eq!(store.delete_rules("host.file.path").await, 1);
    }
}
