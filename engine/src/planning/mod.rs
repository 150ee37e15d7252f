//! Planning service
//!
//! Shared collaborator of every planner. Generates candidate links for a
//! bucket, drives a bucket to exhaustion, runs a planner's bucket loop, and
//! produces cleanup links when an operation closes.
//!
//! # Link generation
//!
//! For each agent, the adversary's abilities are filtered to the requested
//! buckets and to what the agent can run, then bound to the agent's preferred
//! executor. Command templates are rendered in two passes:
//!
//! 1. Reserved variables (`#{paw}`, `#{group}`, `#{location}`) from the agent.
//! 2. `#{trait}` variables from active facts the rules allow. One link is
//!    produced per combination of values, up to [`MAX_VARIANTS`].
//!
//! Links that still contain a variable, fail an enforced requirement, or
//! repeat a command already in the chain for that agent are dropped.

use regex::Regex;
use sdk::errors::EngineError;
use sdk::types::{Fact, Relationship, RuleAction};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use crate::ability::{Ability, Requirement};
use crate::agent::Agent;
use crate::knowledge::{KnowledgeStore, RelationshipCriteria};
use crate::link::{Link, LinkStatus};
use crate::operation::Operation;
use crate::planner::{Planner, PlannerContext};

/// Upper bound on links rendered from one command template
pub const MAX_VARIANTS: usize = 256;

/// Requirement modules [`PlanningService`] knows how to enforce
pub const REQUIREMENT_MODULES: &[&str] = &["paw_provenance", "basic"];

/// `#{name}` placeholders in command templates
static VARIABLE: OnceLock<Regex> = OnceLock::new();

fn variable_pattern() -> &'static Regex {
    VARIABLE.get_or_init(|| Regex::new(r"#\{([^}\s]+)\}").expect("Invalid variable pattern"))
}

pub struct PlanningService {
    knowledge: Arc<KnowledgeStore>,
}

impl PlanningService {
    pub fn new(knowledge: Arc<KnowledgeStore>) -> Self {
        Self { knowledge }
    }

    /// Candidate links for `buckets` (all buckets when `None`), best score first
    pub async fn get_links(
        &self,
        operation: &Operation,
        buckets: Option<&[&str]>,
        agent: Option<&Agent>,
    ) -> Vec<Link> {
        let abilities: Vec<Arc<Ability>> = operation
            .atomic_abilities()
            .into_iter()
            .filter(|a| buckets.map_or(true, |bs| bs.iter().any(|b| a.in_bucket(b))))
            .collect();

        let agents = match agent {
            Some(agent) => vec![agent.clone()],
            None => operation.agents().await,
        };

        let facts = operation.all_facts().await;
        let chain = operation.chain().await;

        let mut links = Vec::new();
        for agent in &agents {
            let generated = self
                .generate_links(operation, agent, &abilities, &facts)
                .await;
            let generated = self.remove_links_missing_requirements(operation, generated, &facts).await;
            links.extend(remove_completed_links(operation, agent, generated, &chain));
        }

        let mut links = remove_duplicate_singletons(links, &chain);
        links.sort_by(|a, b| b.score.cmp(&a.score));
        links
    }

    async fn generate_links(
        &self,
        operation: &Operation,
        agent: &Agent,
        abilities: &[Arc<Ability>],
        facts: &[Fact],
    ) -> Vec<Link> {
        let mut links = Vec::new();
        let capable = abilities
            .iter()
            .filter(|a| !agent.capabilities([a.as_ref()]).is_empty());
        for ability in capable {
            let Some(executor) = agent.preferred_executor(ability) else {
                continue;
            };
            if executor.command.trim().is_empty() {
                continue;
            }

            for (command, used) in self.render(&executor.command, agent, facts).await {
                let mut link = Link::new(
                    Arc::clone(ability),
                    executor.clone(),
                    &agent.paw,
                    command,
                    operation.link_status(),
                );
                link.score = used.iter().map(|f| f.score).sum();
                link.used = used;
                links.push(link);
            }
        }
        links
    }

    /// Every rendering of `template` for `agent`; empty when a variable has no usable value
    async fn render(&self, template: &str, agent: &Agent, facts: &[Fact]) -> Vec<(String, Vec<Fact>)> {
        let command = replace_reserved(template, agent);

        let mut variables: Vec<String> = Vec::new();
        for capture in variable_pattern().captures_iter(&command) {
            let name = capture[1].to_string();
            if !variables.contains(&name) {
                variables.push(name);
            }
        }
        if variables.is_empty() {
            return vec![(command, Vec::new())];
        }

        let mut candidates: Vec<Vec<Fact>> = Vec::with_capacity(variables.len());
        for variable in &variables {
            let rules = self.knowledge.get_rules(Some(variable), None).await;
            let mut values: Vec<Fact> = Vec::new();
            for fact in facts.iter().filter(|f| f.is_active() && &f.trait_name == variable) {
                if values.iter().any(|v| v.value == fact.value) {
                    continue;
                }
                if is_allowed(&fact.value, &rules) {
                    values.push(fact.clone());
                }
            }
            if values.is_empty() {
                debug!(variable = %variable, "No usable facts for variable");
                return Vec::new();
            }
            candidates.push(values);
        }

        cartesian(&candidates, MAX_VARIANTS)
            .into_iter()
            .map(|combo| {
                let mut rendered = command.clone();
                for (variable, fact) in variables.iter().zip(&combo) {
                    rendered = rendered.replace(&format!("#{{{}}}", variable), &fact.value);
                }
                (rendered, combo)
            })
            .collect()
    }

    async fn remove_links_missing_requirements(
        &self,
        operation: &Operation,
        links: Vec<Link>,
        facts: &[Fact],
    ) -> Vec<Link> {
        let relationships = self
            .knowledge
            .get_relationships(&RelationshipCriteria::default())
            .await;
        let ignored = &operation.planner.ignore_enforcement_modules;

        links
            .into_iter()
            .filter(|link| {
                link.ability
                    .requirements
                    .iter()
                    .filter(|r| !ignored.contains(&r.module))
                    .all(|r| {
                        let met = enforce(r, link, facts, &relationships);
                        if !met {
                            debug!(link_id = %link.id, requirement = %r.module, "Requirement not met");
                        }
                        met
                    })
            })
            .collect()
    }

    /// Apply links from `bucket` until none are left
    ///
    /// With `batch` the links of one round are applied together and awaited as
    /// a group; otherwise each is awaited before the next is applied. A command
    /// is applied at most once per call, so repeatable abilities cannot keep a
    /// bucket open forever.
    pub async fn exhaust_bucket(
        &self,
        ctx: &mut PlannerContext,
        bucket: &str,
        agent: Option<&Agent>,
        batch: bool,
        condition_stop: bool,
    ) -> Result<(), EngineError> {
        let operation = Arc::clone(&ctx.operation);
        let mut attempted: HashSet<(String, String)> = HashSet::new();

        loop {
            let links: Vec<Link> = self
                .get_links(&operation, Some(&[bucket][..]), agent)
                .await
                .into_iter()
                .filter(|l| attempted.insert((l.paw.clone(), l.command.clone())))
                .collect();
            if links.is_empty() {
                return Ok(());
            }

            let mut link_ids = Vec::new();
            for link in links {
                link_ids.push(operation.apply(link).await?);
                if !batch {
                    operation.wait_for_links_completion(&link_ids).await?;
                    link_ids.clear();
                }
                if self.stop_bucket_exhaustion(ctx, condition_stop).await {
                    operation.wait_for_links_completion(&link_ids).await?;
                    return Ok(());
                }
            }
            if batch {
                operation.wait_for_links_completion(&link_ids).await?;
            }
            if self.stop_bucket_exhaustion(ctx, condition_stop).await {
                return Ok(());
            }
        }
    }

    async fn stop_bucket_exhaustion(&self, ctx: &mut PlannerContext, condition_stop: bool) -> bool {
        if condition_stop && !ctx.stopping_conditions.is_empty() {
            self.update_stopping_condition_met(ctx).await;
            if ctx.stopping_condition_met {
                return true;
            }
        }
        ctx.operation.is_finished().await
    }

    /// Bucket after `current` in `state_machine`, wrapping around
    pub fn default_next_bucket(&self, current: &str, state_machine: &[&str]) -> Result<String, EngineError> {
        let index = state_machine
            .iter()
            .position(|b| *b == current)
            .ok_or_else(|| EngineError::UnknownBucket {
                planner: state_machine.join(","),
                bucket: current.to_string(),
            })?;
        Ok(state_machine[(index + 1) % state_machine.len()].to_string())
    }

    /// Run `planner` bucket by bucket until it returns no next bucket
    ///
    /// Also stops when a stopping condition is met or the operation finishes.
    pub async fn execute_planner(&self, planner: &mut (dyn Planner + '_)) -> Result<(), EngineError> {
        let mut next_bucket = planner.initial_bucket();
        while let Some(bucket) = next_bucket {
            let ctx = planner.context();
            if ctx.stopping_condition_met && !ctx.stopping_conditions.is_empty() {
                info!(planner = planner.name(), "Stopping condition met");
                break;
            }
            if ctx.operation.is_finished().await {
                break;
            }

            debug!(planner = planner.name(), bucket = %bucket, "Entering bucket");
            next_bucket = planner.run_bucket(&bucket).await?;
            self.update_stopping_condition_met(planner.context_mut()).await;
        }
        debug!(planner = planner.name(), "Planner completed");
        Ok(())
    }

    pub async fn update_stopping_condition_met(&self, ctx: &mut PlannerContext) {
        for condition in &ctx.stopping_conditions {
            if ctx
                .operation
                .has_fact(&condition.trait_name, &condition.value)
                .await
            {
                ctx.stopping_condition_met = true;
                return;
            }
        }
    }

    /// Cleanup links for every executed link on `agent`, newest first
    pub async fn get_cleanup_links(&self, operation: &Operation, agent: &Agent) -> Vec<Link> {
        let mut links: Vec<Link> = Vec::new();
        for link in operation.chain().await {
            if link.paw != agent.paw || link.cleanup || !link.is_finished() || link.status.0 < 0 {
                continue;
            }
            for template in &link.executor.cleanup {
                let Some(command) = render_with_used(template, agent, &link.used) else {
                    debug!(link_id = %link.id, "Cleanup command has unresolved variables");
                    continue;
                };
                if links.iter().any(|l| l.command == command) {
                    continue;
                }
                let mut cleanup = Link::new(
                    Arc::clone(&link.ability),
                    link.executor.clone(),
                    &agent.paw,
                    command,
                    LinkStatus::EXECUTE,
                );
                cleanup.cleanup = true;
                cleanup.used = link.used.clone();
                links.push(cleanup);
            }
        }
        links.reverse();
        links
    }
}

fn replace_reserved(template: &str, agent: &Agent) -> String {
    template
        .replace("#{paw}", &agent.paw)
        .replace("#{group}", &agent.group)
        .replace("#{location}", &agent.location)
}

fn render_with_used(template: &str, agent: &Agent, used: &[Fact]) -> Option<String> {
    let mut command = replace_reserved(template, agent);
    for fact in used {
        command = command.replace(&format!("#{{{}}}", fact.trait_name), &fact.value);
    }
    (!variable_pattern().is_match(&command)).then_some(command)
}

/// Last matching rule decides; values with no matching rule are allowed
fn is_allowed(value: &str, rules: &[sdk::types::Rule]) -> bool {
    let mut allowed = true;
    for rule in rules {
        match Regex::new(&format!("^(?:{})", rule.pattern)) {
            Ok(pattern) if pattern.is_match(value) => {
                allowed = rule.action == RuleAction::Allow;
            }
            Ok(_) => {}
            Err(e) => warn!(pattern = %rule.pattern, error = %e, "Skipping invalid rule pattern"),
        }
    }
    allowed
}

fn cartesian(candidates: &[Vec<Fact>], limit: usize) -> Vec<Vec<Fact>> {
    let mut combos: Vec<Vec<Fact>> = vec![Vec::new()];
    for values in candidates {
        let mut next = Vec::new();
        'outer: for combo in &combos {
            for value in values {
                if next.len() == limit {
                    break 'outer;
                }
                let mut extended = combo.clone();
                extended.push(value.clone());
                next.push(extended);
            }
        }
        combos = next;
    }
    combos
}

fn enforce(requirement: &Requirement, link: &Link, facts: &[Fact], relationships: &[Relationship]) -> bool {
    match requirement.module.as_str() {
        "paw_provenance" => requirement.relationship_match.iter().all(|m| {
            link.used.iter().filter(|u| u.trait_name == m.source).any(|used| {
                facts.iter().any(|f| {
                    f.trait_name == used.trait_name
                        && f.value == used.value
                        && f.collected_by.contains(&link.paw)
                })
            })
        }),
        "basic" => requirement.relationship_match.iter().all(|m| {
            link.used.iter().filter(|u| u.trait_name == m.source).any(|used| {
                relationships.iter().any(|r| {
                    r.source.trait_name == used.trait_name
                        && r.source.value == used.value
                        && m.edge.as_ref().map_or(true, |e| r.edge.as_ref() == Some(e))
                        && m.target.as_ref().map_or(true, |target| {
                            let expected = link.used.iter().find(|u| &u.trait_name == target);
                            match (&r.target, expected) {
                                (Some(t), Some(u)) => t.trait_name == *target && t.value == u.value,
                                _ => false,
                            }
                        })
                })
            })
        }),
        other => {
            warn!(requirement = other, "Unknown requirement module");
            false
        }
    }
}

/// Drop links whose command already ran, or is queued, for the same agent
fn remove_completed_links(operation: &Operation, agent: &Agent, links: Vec<Link>, chain: &[Link]) -> Vec<Link> {
    let seen: HashSet<&str> = chain
        .iter()
        .filter(|l| l.paw == agent.paw && !l.cleanup)
        .map(|l| l.command.as_str())
        .collect();
    let allow_repeat = operation.planner.allow_repeatable_abilities;
    links
        .into_iter()
        .filter(|l| !seen.contains(l.command.as_str()) || (allow_repeat && l.ability.repeatable))
        .collect()
}

/// Singleton abilities run on one agent at a time
fn remove_duplicate_singletons(links: Vec<Link>, chain: &[Link]) -> Vec<Link> {
    let mut running: HashSet<String> = chain
        .iter()
        .filter(|l| l.ability.singleton && !l.is_finished() && !l.can_ignore())
        .map(|l| l.ability.id.clone())
        .collect();
    links
        .into_iter()
        .filter(|l| !l.ability.singleton || running.insert(l.ability.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::types::Rule;

    #[test]
    fn test_is_allowed_last_rule_wins() {
        let deny_all = Rule {
            action: RuleAction::Deny,
            trait_name: "host.file.path".into(),
            pattern: ".*".into(),
        };
        let allow_tmp = Rule {
            action: RuleAction::Allow,
            trait_name: "host.file.path".into(),
            pattern: "/tmp/".into(),
        };
        let rules = vec![deny_all, allow_tmp];
        assert!(is_allowed("/tmp/x.txt", &rules));
        assert!(!is_allowed("/etc/passwd", &rules));
        assert!(is_allowed("/etc/passwd", &[]));
    }

    #[test]
    fn test_cartesian_is_capped() {
        let values: Vec<Fact> = (0..20).map(|i| Fact::new("a", i.to_string())).collect();
        let combos = cartesian(&[values.clone(), values], 256);
        assert_eq!(combos.len(), 256);
        assert!(combos.iter().all(|c| c.len() == 2));
    }

    #[test]
    fn test_render_with_used_requires_all_variables() {
        let agent = Agent::new("abc", "linux", vec!["sh".into()]);
        let used = vec![Fact::new("host.file.path", "/tmp/x")];
        assert_eq!(
            render_with_used("rm #{host.file.path} # #{paw}", &agent, &used).as_deref(),
            Some("rm /tmp/x # abc")
        );
        assert!(render_with_used("rm #{other}", &agent, &used).is_none());
    }

    #[test]
    fn test_default_next_bucket_wraps() {
        let planning = PlanningService::new(Arc::new(KnowledgeStore::new()));
        let machine = ["a", "b", "c"];
        assert_eq!(planning.default_next_bucket("b", &machine).unwrap(), "c");
        assert_eq!(planning.default_next_bucket("c", &machine).unwrap(), "a");
        assert!(planning.default_next_bucket("z", &machine).is_err());
    }
}
