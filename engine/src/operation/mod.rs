//! Operation lifecycle
//!
//! An [`Operation`] binds an adversary, a planner, a fact source, and a set of
//! agents, and owns the ordered chain of links those produce. It is shared as
//! `Arc<Operation>` between the planner driving it and whoever controls it
//! (the CLI, tests): all mutable state sits behind async locks, and the state
//! machine lives in a `watch` channel so waiters wake on transitions instead
//! of sleeping through them.
//!
//! # State machine
//!
//! ```text
//! running ──pause──▶ paused ──resume──▶ running
//!    │                 │ ▲
//!    └──step──▶ run_one_link ──(one link applied)──┘
//!
//! any non-terminal ──out_of_time──▶ out_of_time
//! running/paused   ──close──▶ cleanup ──▶ finished
//! ```
//!
//! `finished` and `out_of_time` are terminal: `apply` rejects links with
//! `EngineError::OperationClosed` once either is reached.

pub mod event_log;

use chrono::{DateTime, Utc};
use sdk::errors::EngineError;
use sdk::parser::ParseContext;
use sdk::types::{Fact, OriginType, Relationship};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ability::{Ability, Adversary, PlannerSpec, Source};
use crate::agent::Agent;
use crate::command_executor::CommandExecutor;
use crate::config::OperationConfig;
use crate::db::{MemoryStore, ResultStore, SourceDocument, SourceSink};
use crate::knowledge::{FactCriteria, FactUpdate, KnowledgeStore};
use crate::learning::LearningService;
use crate::link::{Link, LinkResult, LinkStatus};
use crate::message_bus::{Event, MessageBus};
use crate::objective::Objective;
use crate::parsers::ParserRegistry;
use crate::planner::PlannerRegistry;
use crate::planning::PlanningService;

pub use event_log::{EventLogEntry, OperationMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Running,
    RunOneLink,
    Paused,
    OutOfTime,
    Finished,
    Cleanup,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::OutOfTime)
    }

    /// Terminal, or closing down
    pub fn is_closed(self) -> bool {
        self.is_terminal() || self == Self::Cleanup
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::RunOneLink => "run_one_link",
            Self::Paused => "paused",
            Self::OutOfTime => "out_of_time",
            Self::Finished => "finished",
            Self::Cleanup => "cleanup",
        };
        write!(f, "{}", name)
    }
}

/// Per-operation tunables
#[derive(Debug, Clone)]
pub struct OperationSettings {
    pub apply_poll: Duration,
    pub link_poll: Duration,
    pub finish_poll: Duration,
    pub base_timeout: Duration,
    pub obfuscator: String,
    pub use_learning_parsers: bool,
    pub auto_close: bool,
    /// When false, new links start as `PAUSE` and wait for approval
    pub autonomous: bool,
}

impl From<&OperationConfig> for OperationSettings {
    fn from(config: &OperationConfig) -> Self {
        Self {
            apply_poll: config.apply_poll(),
            link_poll: config.link_poll(),
            finish_poll: config.finish_poll(),
            base_timeout: config.base_timeout(),
            obfuscator: config.obfuscator.clone(),
            use_learning_parsers: config.use_learning_parsers,
            auto_close: config.auto_close,
            autonomous: true,
        }
    }
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self::from(&OperationConfig::default())
    }
}

/// Collaborators an operation runs against
#[derive(Clone)]
pub struct EngineServices {
    pub knowledge: Arc<KnowledgeStore>,
    pub planning: Arc<PlanningService>,
    pub planners: Arc<PlannerRegistry>,
    pub executor: Arc<CommandExecutor>,
    pub parsers: Arc<ParserRegistry>,
    pub learning: Arc<LearningService>,
    pub results: Arc<dyn ResultStore>,
    pub sources: Arc<dyn SourceSink>,
    pub bus: Arc<MessageBus>,
}

impl EngineServices {
    pub fn new(
        executor: CommandExecutor,
        results: Arc<dyn ResultStore>,
        sources: Arc<dyn SourceSink>,
    ) -> Result<Self, EngineError> {
        let knowledge = Arc::new(KnowledgeStore::new());
        Ok(Self {
            planning: Arc::new(PlanningService::new(Arc::clone(&knowledge))),
            knowledge,
            planners: Arc::new(PlannerRegistry::new()),
            executor: Arc::new(executor),
            parsers: Arc::new(ParserRegistry::new()),
            learning: Arc::new(LearningService::new()?),
            results,
            sources,
            bus: Arc::new(MessageBus::new()),
        })
    }

    /// Services backed by a [`MemoryStore`], returned alongside for inspection
    pub fn in_memory(executor: CommandExecutor) -> Result<(Self, Arc<MemoryStore>), EngineError> {
        let store = Arc::new(MemoryStore::new());
        let results: Arc<dyn ResultStore> = Arc::clone(&store) as Arc<dyn ResultStore>;
        let sources: Arc<dyn SourceSink> = Arc::clone(&store) as Arc<dyn SourceSink>;
        Ok((Self::new(executor, results, sources)?, store))
    }
}

pub struct OperationBuilder {
    name: String,
    adversary: Adversary,
    abilities: Vec<Ability>,
    source: Option<Source>,
    planner: PlannerSpec,
    agents: Vec<Agent>,
    objectives: Vec<Objective>,
    settings: OperationSettings,
    state: OperationState,
}

impl OperationBuilder {
    pub fn new(name: impl Into<String>, adversary: Adversary) -> Self {
        Self {
            name: name.into(),
            adversary,
            abilities: Vec::new(),
            source: None,
            planner: PlannerSpec::named(crate::planner::atomic::NAME),
            agents: Vec::new(),
            objectives: Vec::new(),
            settings: OperationSettings::default(),
            state: OperationState::Running,
        }
    }

    pub fn abilities(mut self, abilities: Vec<Ability>) -> Self {
        self.abilities = abilities;
        self
    }

    pub fn source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    pub fn planner(mut self, planner: PlannerSpec) -> Self {
        self.planner = planner;
        self
    }

    pub fn agent(mut self, agent: Agent) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn objectives(mut self, objectives: Vec<Objective>) -> Self {
        self.objectives = objectives;
        self
    }

    pub fn settings(mut self, settings: OperationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn initial_state(mut self, state: OperationState) -> Self {
        self.state = state;
        self
    }

    pub fn build(self, services: EngineServices) -> Arc<Operation> {
        let abilities: HashMap<String, Arc<Ability>> = self
            .abilities
            .into_iter()
            .map(|a| (a.id.clone(), Arc::new(a)))
            .collect();
        for id in &self.adversary.atomic_ordering {
            if !abilities.contains_key(id) {
                warn!(adversary = %self.adversary.name, ability_id = %id, "Adversary references unknown ability, skipping");
            }
        }

        let mut objectives = self.objectives;
        if !objectives.iter().any(|o| o.name == "default") {
            objectives.push(Objective::default_objective());
        }

        let (state, _) = watch::channel(self.state);
        Arc::new(Operation {
            id: Uuid::new_v4().to_string(),
            name: self.name,
            adversary: self.adversary,
            source: self.source,
            planner: self.planner,
            settings: self.settings,
            abilities,
            objectives,
            services,
            state,
            start: RwLock::new(None),
            finish: RwLock::new(None),
            chain: RwLock::new(Vec::new()),
            potential_links: RwLock::new(Vec::new()),
            ignored_links: RwLock::new(HashSet::new()),
            agents: RwLock::new(self.agents),
            objective: RwLock::new(None),
            link_signal: Notify::new(),
        })
    }
}

pub struct Operation {
    pub id: String,
    pub name: String,
    pub adversary: Adversary,
    pub source: Option<Source>,
    pub planner: PlannerSpec,
    pub settings: OperationSettings,
    abilities: HashMap<String, Arc<Ability>>,
    objectives: Vec<Objective>,
    services: EngineServices,
    state: watch::Sender<OperationState>,
    start: RwLock<Option<DateTime<Utc>>>,
    finish: RwLock<Option<DateTime<Utc>>>,
    chain: RwLock<Vec<Link>>,
    potential_links: RwLock<Vec<Link>>,
    ignored_links: RwLock<HashSet<String>>,
    agents: RwLock<Vec<Agent>>,
    objective: RwLock<Option<Objective>>,
    /// Fired whenever a link finishes or changes status
    link_signal: Notify,
}

impl Operation {
    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    pub fn state(&self) -> OperationState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn watch_state(&self) -> watch::Receiver<OperationState> {
        self.state.subscribe()
    }

    /// Status new links start in
    pub fn link_status(&self) -> LinkStatus {
        if self.settings.autonomous {
            LinkStatus::EXECUTE
        } else {
            LinkStatus::PAUSE
        }
    }

    pub fn ability(&self, id: &str) -> Option<Arc<Ability>> {
        self.abilities.get(id).map(Arc::clone)
    }

    /// The adversary's abilities in atomic order, each once
    pub fn atomic_abilities(&self) -> Vec<Arc<Ability>> {
        let mut seen = HashSet::new();
        self.adversary
            .atomic_ordering
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter_map(|id| self.ability(id))
            .collect()
    }

    pub async fn agents(&self) -> Vec<Agent> {
        self.agents.read().await.clone()
    }

    pub async fn add_agent(&self, agent: Agent) {
        let mut agents = self.agents.write().await;
        if !agents.iter().any(|a| a.paw == agent.paw) {
            agents.push(agent);
        }
    }

    pub async fn chain(&self) -> Vec<Link> {
        self.chain.read().await.clone()
    }

    pub async fn get_link(&self, link_id: &str) -> Option<Link> {
        self.chain.read().await.iter().find(|l| l.id == link_id).cloned()
    }

    /// Whether `link_id` is in the chain or the potential-link queue
    pub async fn has_link(&self, link_id: &str) -> bool {
        self.chain.read().await.iter().any(|l| l.id == link_id)
            || self.potential_links.read().await.iter().any(|l| l.id == link_id)
    }

    pub async fn objective(&self) -> Option<Objective> {
        self.objective.read().await.clone()
    }

    pub async fn start_time(&self) -> Option<DateTime<Utc>> {
        *self.start.read().await
    }

    pub async fn finish_time(&self) -> Option<DateTime<Utc>> {
        *self.finish.read().await
    }

    pub async fn ignored_links(&self) -> HashSet<String> {
        self.ignored_links.read().await.clone()
    }

    /// Active facts seeded from the source plus those learned by this operation
    pub async fn all_facts(&self) -> Vec<Fact> {
        let knowledge = &self.services.knowledge;
        let mut facts = Vec::new();
        if let Some(source) = &self.source {
            facts.extend(knowledge.get_facts(&FactCriteria::new().source(&source.id)).await);
        }
        facts.extend(knowledge.get_facts(&FactCriteria::new().source(&self.id)).await);
        facts.retain(Fact::is_active);
        facts
    }

    pub async fn has_fact(&self, trait_name: &str, value: &str) -> bool {
        self.all_facts()
            .await
            .iter()
            .any(|f| f.trait_name == trait_name && f.value == value)
    }

    /// Whether some fact of `trait_name` holds the value `true`, any case
    pub async fn has_true_fact(&self, trait_name: &str) -> bool {
        self.all_facts()
            .await
            .iter()
            .any(|f| f.trait_name == trait_name && f.value.eq_ignore_ascii_case("true"))
    }

    async fn transition(&self, next: impl FnOnce(OperationState) -> Option<OperationState>) -> bool {
        let mut changed = None;
        self.state.send_if_modified(|state| match next(*state) {
            Some(target) if target != *state => {
                changed = Some((*state, target));
                *state = target;
                true
            }
            _ => false,
        });

        let Some((from, to)) = changed else {
            return false;
        };
        info!(operation_id = %self.id, from = %from, to = %to, "Operation state changed");
        self.services
            .bus
            .publish(Event::StateChanged {
                operation_id: self.id.clone(),
                state: to,
            })
            .await;
        true
    }

    pub async fn pause(&self) -> bool {
        self.transition(|s| match s {
            OperationState::Running | OperationState::RunOneLink => Some(OperationState::Paused),
            _ => None,
        })
        .await
    }

    pub async fn resume(&self) -> bool {
        self.transition(|s| match s {
            OperationState::Paused | OperationState::RunOneLink => Some(OperationState::Running),
            _ => None,
        })
        .await
    }

    /// Admit exactly one more link, then pause
    pub async fn step(&self) -> bool {
        self.transition(|s| match s {
            OperationState::Running | OperationState::Paused => Some(OperationState::RunOneLink),
            _ => None,
        })
        .await
    }

    /// Force the operation into `out_of_time`; cleanup still runs on close
    pub async fn out_of_time(&self) -> bool {
        self.transition(|s| (!s.is_terminal()).then_some(OperationState::OutOfTime))
            .await
    }

    /// Append `link` to the chain according to the current state
    ///
    /// Waits while the operation is paused, re-checking at least every
    /// `apply_poll`. In `run_one_link` the link is admitted and the operation
    /// pauses.
    ///
    /// # Errors
    /// `EngineError::OperationClosed` once the operation is closing or closed.
    pub async fn apply(&self, link: Link) -> Result<String, EngineError> {
        let mut state_rx = self.state.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                OperationState::Running => return Ok(self.add_link(link).await),
                OperationState::RunOneLink => {
                    if self
                        .transition(|s| (s == OperationState::RunOneLink).then_some(OperationState::Paused))
                        .await
                    {
                        return Ok(self.add_link(link).await);
                    }
                }
                OperationState::Paused => {
                    let _ = tokio::time::timeout(self.settings.apply_poll, state_rx.changed()).await;
                }
                OperationState::OutOfTime | OperationState::Finished | OperationState::Cleanup => {
                    return Err(EngineError::OperationClosed(self.id.clone()));
                }
            }
        }
    }

    /// Append `link` to the chain unconditionally
    pub async fn add_link(&self, link: Link) -> String {
        let link_id = link.id.clone();
        let event = Event::LinkApplied {
            operation_id: self.id.clone(),
            link_id: link_id.clone(),
            ability: link.ability.name.clone(),
            paw: link.paw.clone(),
            command: link.plaintext_command.clone(),
        };
        debug!(operation_id = %self.id, link_id = %link_id, paw = %link.paw, "Link applied");

        if let Some(agent) = self.agents.write().await.iter_mut().find(|a| a.paw == link.paw) {
            agent.links.push(link_id.clone());
        }
        self.chain.write().await.push(link);
        self.services.bus.publish(event).await;
        link_id
    }

    /// Block until every link in `link_ids` has finished or been ignored
    ///
    /// Links still in `EXECUTE` are run here through the command executor.
    /// Links in `PAUSE` wait for approval, or for the operation to close. A
    /// command still running when the operation closes is killed and its link
    /// finished with `LinkStatus::TIMEOUT`.
    ///
    /// # Errors
    /// Fatal executor errors such as an unknown shell, and
    /// `EngineError::OperationClosed` when the operation closes mid-wait.
    pub async fn wait_for_links_completion(&self, link_ids: &[String]) -> Result<(), EngineError> {
        for link_id in link_ids {
            loop {
                let signal = self.link_signal.notified();
                tokio::pin!(signal);
                signal.as_mut().enable();
                let mut state_rx = self.state.subscribe();

                let Some(link) = self.get_link(link_id).await else {
                    warn!(operation_id = %self.id, link_id = %link_id, "Link not found in chain");
                    break;
                };
                if link.can_ignore() {
                    self.ignored_links.write().await.insert(link.id.clone());
                    break;
                }
                if link.is_finished() {
                    break;
                }
                if link.status == LinkStatus::PAUSE {
                    if self.state().is_closed() {
                        break;
                    }
                    tokio::select! {
                        _ = &mut signal => {}
                        _ = state_rx.changed() => {}
                        _ = tokio::time::sleep(self.settings.link_poll) => {}
                    }
                    continue;
                }

                if self.state().is_closed() {
                    return Err(EngineError::OperationClosed(self.id.clone()));
                }
                tokio::select! {
                    result = self.services.executor.running(&link) => {
                        self.save(result?, true).await;
                    }
                    _ = closed(self.state.subscribe()) => {
                        warn!(operation_id = %self.id, link_id = %link.id, "Link interrupted by operation close");
                        self.save(LinkResult::interrupted(&link.id), false).await;
                        return Err(EngineError::OperationClosed(self.id.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    async fn set_link_status(&self, link_id: &str, status: LinkStatus) -> Result<(), EngineError> {
        {
            let mut chain = self.chain.write().await;
            let link = chain
                .iter_mut()
                .find(|l| l.id == link_id)
                .ok_or_else(|| EngineError::LinkNotFound(link_id.to_string()))?;
            if link.is_finished() {
                return Ok(());
            }
            link.status = status;
        }
        self.link_signal.notify_waiters();
        Ok(())
    }

    /// Release a `PAUSE` link for execution
    pub async fn approve_link(&self, link_id: &str) -> Result<(), EngineError> {
        self.set_link_status(link_id, LinkStatus::EXECUTE).await
    }

    /// Mark a pending link as discarded; it will never run
    pub async fn discard_link(&self, link_id: &str) -> Result<(), EngineError> {
        self.set_link_status(link_id, LinkStatus::DISCARD).await
    }

    /// Park a link for manual review instead of applying it
    pub async fn add_potential_link(&self, link: Link) {
        self.potential_links.write().await.push(link);
    }

    pub async fn potential_links(&self) -> Vec<Link> {
        self.potential_links.read().await.clone()
    }

    /// Move a reviewed link from the queue into the chain
    pub async fn promote_potential_link(&self, link_id: &str) -> Result<String, EngineError> {
        let link = {
            let mut queue = self.potential_links.write().await;
            let index = queue
                .iter()
                .position(|l| l.id == link_id)
                .ok_or_else(|| EngineError::LinkNotFound(link_id.to_string()))?;
            queue.remove(index)
        };
        self.apply(link).await
    }

    /// Store a result, extract knowledge from it, and finish its link
    async fn save(&self, result: LinkResult, postprocess: bool) {
        let Some(link) = self.get_link(&result.link_id).await else {
            warn!(operation_id = %self.id, link_id = %result.link_id, "Result for unknown link dropped");
            return;
        };

        if result.has_output() {
            match event_log::encode_result(&result) {
                Ok(payload) => {
                    if let Err(e) = self.services.results.save_result(&link.id, &payload).await {
                        error!(link_id = %link.id, error = %e, "Failed to store link result");
                    }
                }
                Err(e) => error!(link_id = %link.id, error = %e, "Failed to encode link result"),
            }
        }

        let (facts, relationships) = if !postprocess || result.stdout.trim().is_empty() {
            (Vec::new(), Vec::new())
        } else if !link.executor.parsers.is_empty() {
            if result.exit_code == 0 {
                self.parse(&link, &result.stdout).await
            } else {
                debug!(link_id = %link.id, exit_code = result.exit_code, "Skipping parsers for failed link");
                (Vec::new(), Vec::new())
            }
        } else if self.settings.use_learning_parsers {
            (self.learn(&link, &result.stdout).await, Vec::new())
        } else {
            (Vec::new(), Vec::new())
        };

        let status = {
            let mut chain = self.chain.write().await;
            let Some(stored) = chain.iter_mut().find(|l| l.id == link.id) else {
                return;
            };
            for fact in facts {
                stored.add_fact(fact);
            }
            for relationship in relationships {
                stored.add_relationship(relationship);
            }
            if !stored.finalize(&result) {
                debug!(link_id = %link.id, "Link already finished, result ignored");
            }
            stored.status
        };

        self.services
            .bus
            .publish(Event::LinkFinished {
                operation_id: self.id.clone(),
                link_id: link.id.clone(),
                status: status.0,
            })
            .await;
        self.link_signal.notify_waiters();
    }

    async fn parse(&self, link: &Link, stdout: &str) -> (Vec<Fact>, Vec<Relationship>) {
        let ctx = ParseContext {
            paw: &link.paw,
            link_id: &link.id,
            used_facts: &link.used,
        };
        let mut facts = Vec::new();
        let mut relationships = Vec::new();

        for spec in &link.executor.parsers {
            let parser = match self.services.parsers.get(&spec.module) {
                Ok(parser) => parser,
                Err(e) => {
                    error!(link_id = %link.id, error = %e, "Parser unavailable");
                    continue;
                }
            };
            let parsed = match parser.parse(stdout, &spec.parserconfigs, &ctx) {
                Ok(parsed) => parsed,
                Err(e) => {
                    error!(link_id = %link.id, parser = %spec.module, error = %e, "Parser failed");
                    continue;
                }
            };

            let count = parsed.len() as i64;
            for relationship in parsed {
                let Some(source) = self.save_fact(link, relationship.source, relationship.score).await else {
                    continue;
                };
                let target = match relationship.target {
                    Some(target) => match self.save_fact(link, target, relationship.score).await {
                        Some(target) => Some(target),
                        None => continue,
                    },
                    None => None,
                };
                facts.push(source.clone());
                facts.extend(target.clone());

                let stored = Relationship {
                    source,
                    edge: relationship.edge,
                    target,
                    score: relationship.score,
                    origin: Some(link.id.clone()),
                };
                self.services.knowledge.add_relationship(stored.clone()).await;
                relationships.push(stored);
            }
            self.update_scores(&link.used, count).await;
        }
        (facts, relationships)
    }

    async fn learn(&self, link: &Link, stdout: &str) -> Vec<Fact> {
        let known = self.all_facts().await;
        let mut facts = Vec::new();
        for fact in self.services.learning.learn(&known, stdout) {
            if let Some(saved) = self.save_fact(link, fact, 1).await {
                facts.push(saved);
            }
        }
        self.update_scores(&link.used, facts.len() as i64).await;
        facts
    }

    /// Record a fact produced by `link`
    ///
    /// A fact already known to this operation (seeded or learned) gains the
    /// link's provenance instead of being stored twice.
    async fn save_fact(&self, link: &Link, mut fact: Fact, score: i64) -> Option<Fact> {
        if fact.trait_name.is_empty() || fact.value.is_empty() {
            return None;
        }
        let owners: Vec<&str> = self
            .source
            .iter()
            .map(|s| s.id.as_str())
            .chain(std::iter::once(self.id.as_str()))
            .collect();
        let existing = self
            .services
            .knowledge
            .get_facts(&FactCriteria::new().trait_name(&fact.trait_name).value(&fact.value))
            .await
            .into_iter()
            .find(|f| f.source.as_deref().is_some_and(|s| owners.contains(&s)));

        fact.source = existing
            .as_ref()
            .and_then(|f| f.source.clone())
            .or_else(|| Some(self.id.clone()));
        fact.score = existing.as_ref().map_or(score, |f| f.score);
        fact.origin_type = existing.as_ref().map_or(OriginType::Learned, |f| f.origin_type);
        fact.collected_by = vec![link.paw.clone()];
        fact.links = vec![link.id.clone()];

        if self.services.knowledge.add_fact(fact.clone()).await {
            debug!(operation_id = %self.id, trait_name = %fact.trait_name, value = %fact.value, "Fact learned");
            self.services
                .bus
                .publish(Event::FactLearned {
                    operation_id: self.id.clone(),
                    trait_name: fact.trait_name.clone(),
                    value: fact.value.clone(),
                })
                .await;
        }
        Some(fact)
    }

    /// Raise the score of facts a link consumed by what it produced
    async fn update_scores(&self, used: &[Fact], increment: i64) {
        if increment == 0 {
            return;
        }
        let update = FactUpdate {
            score_delta: Some(increment),
            ..Default::default()
        };
        for fact in used {
            self.services
                .knowledge
                .update_fact(&FactCriteria::for_fact(fact), &update)
                .await;
        }
    }

    /// True when closing or closed, or when the objective is satisfied
    pub async fn is_finished(&self) -> bool {
        if self.state().is_closed() {
            return true;
        }
        match self.objective().await {
            Some(objective) => objective.completed(&self.all_facts().await),
            None => false,
        }
    }

    /// Mark the operation finished when it is done; out-of-time stays as is
    pub async fn is_closeable(&self) -> bool {
        if !self.is_finished().await {
            return false;
        }
        self.transition(|s| (s != OperationState::OutOfTime).then_some(OperationState::Finished))
            .await;
        true
    }

    /// Run cleanup, persist learned knowledge as a new source, and finish
    pub async fn close(&self) {
        self.transition(|s| (!s.is_terminal()).then_some(OperationState::Cleanup))
            .await;
        self.discard_unstarted_links().await;
        self.cleanup_operation().await;
        self.save_new_source().await;
        self.transition(|s| (s != OperationState::OutOfTime).then_some(OperationState::Finished))
            .await;

        let finish = Utc::now();
        *self.finish.write().await = Some(finish);
        let links = self.chain.read().await.len();
        info!(operation_id = %self.id, state = %self.state(), links, "Operation closed");
        self.services
            .bus
            .publish(Event::OperationFinished {
                operation_id: self.id.clone(),
                state: self.state(),
                links,
            })
            .await;
    }

    // Links admitted but never run are left out of reports.
    async fn discard_unstarted_links(&self) {
        let mut chain = self.chain.write().await;
        for link in chain.iter_mut().filter(|l| !l.is_finished() && l.status.is_pending()) {
            debug!(operation_id = %self.id, link_id = %link.id, "Discarding link that never ran");
            link.status = LinkStatus::DISCARD;
        }
    }

    async fn cleanup_operation(&self) {
        for agent in self.agents().await {
            let links = self.services.planning.get_cleanup_links(self, &agent).await;
            if !links.is_empty() {
                info!(operation_id = %self.id, paw = %agent.paw, count = links.len(), "Running cleanup links");
            }
            for link in links {
                self.add_link(link.clone()).await;
                match self.services.executor.running(&link).await {
                    Ok(result) => self.save(result, false).await,
                    Err(e) => error!(link_id = %link.id, error = %e, "Cleanup link failed"),
                }
            }
        }
    }

    async fn save_new_source(&self) {
        let chain = self.chain().await;
        let knowledge = &self.services.knowledge;

        let mut facts: Vec<Fact> = Vec::new();
        for fact in chain.iter().flat_map(|l| l.facts.iter()) {
            let score = knowledge
                .get_facts(&FactCriteria::for_fact(fact))
                .await
                .first()
                .map_or(fact.score, |f| f.score);
            let exported = Fact::new(&fact.trait_name, &fact.value).with_score(score);
            if !facts.contains(&exported) {
                facts.push(exported);
            }
        }

        let strip = |f: &Fact| Fact::new(&f.trait_name, &f.value).with_score(f.score);
        let mut relationships: Vec<Relationship> = Vec::new();
        for relationship in chain.iter().flat_map(|l| l.relationships.iter()) {
            let exported = Relationship {
                source: strip(&relationship.source),
                edge: relationship.edge.clone(),
                target: relationship.target.as_ref().map(strip),
                score: relationship.score,
                origin: None,
            };
            if !relationships.contains(&exported) {
                relationships.push(exported);
            }
        }

        let document = SourceDocument {
            id: Uuid::new_v4().to_string(),
            name: self.name.clone(),
            operation_id: self.id.clone(),
            facts,
            relationships,
            created: Utc::now(),
        };
        match self.services.sources.persist_source(&document).await {
            Ok(()) => debug!(operation_id = %self.id, source_id = %document.id, facts = document.facts.len(), "Persisted learned source"),
            Err(e) => error!(operation_id = %self.id, error = %e, "Failed to persist learned source"),
        }
    }

    async fn init_source(&self) {
        let Some(source) = &self.source else {
            return;
        };
        let knowledge = &self.services.knowledge;
        let seed = |f: &Fact| {
            f.clone()
                .with_source(&source.id)
                .with_origin(OriginType::Seeded)
        };

        for fact in &source.facts {
            knowledge.add_fact(seed(fact)).await;
        }
        for relationship in &source.relationships {
            let mut seeded = relationship.clone();
            seeded.source = seed(&relationship.source);
            seeded.target = relationship.target.as_ref().map(seed);
            seeded.origin = Some(source.id.clone());
            knowledge.add_relationship(seeded).await;
        }
        for rule in &source.rules {
            knowledge.add_rule(rule.clone(), Some(source.id.clone())).await;
        }
        debug!(
            operation_id = %self.id,
            source_id = %source.id,
            facts = source.facts.len(),
            relationships = source.relationships.len(),
            rules = source.rules.len(),
            "Seeded fact source"
        );
    }

    async fn load_objective(&self) -> Result<(), EngineError> {
        let wanted = self.adversary.objective.as_deref();
        let objective = wanted
            .and_then(|id| self.objectives.iter().find(|o| o.id == id))
            .or_else(|| self.objectives.iter().find(|o| o.name == "default"))
            .cloned()
            .ok_or_else(|| EngineError::ObjectiveNotFound(wanted.unwrap_or("default").to_string()))?;

        if let Some(id) = wanted.filter(|id| *id != objective.id) {
            warn!(operation_id = %self.id, objective = %id, "Objective not found, using default");
        }
        *self.objective.write().await = Some(objective);
        Ok(())
    }

    /// Run the operation to completion and return its event logs
    ///
    /// Seeds the fact source, resolves the objective, and runs the planner.
    /// The run is cut short when the operation exceeds `base_timeout` or is
    /// closed from outside; cleanup and source persistence happen regardless.
    ///
    /// # Errors
    /// Configuration errors (unknown planner, missing objective) before the
    /// planner starts, and fatal planner errors after the operation is closed.
    pub async fn run(self: &Arc<Self>) -> Result<Vec<EventLogEntry>, EngineError> {
        *self.start.write().await = Some(Utc::now());
        info!(operation_id = %self.id, name = %self.name, planner = %self.planner.module, "Operation started");
        self.services
            .bus
            .publish(Event::OperationStarted {
                operation_id: self.id.clone(),
                name: self.name.clone(),
            })
            .await;

        self.init_source().await;
        self.load_objective().await?;
        let mut planner = self.services.planners.build(
            &self.planner,
            Arc::clone(self),
            Arc::clone(&self.services.planning),
        )?;

        let deadline = tokio::time::sleep(self.settings.base_timeout);
        tokio::pin!(deadline);

        // The planner is never dropped mid-link; once the operation closes it
        // stops at the next admission or wait.
        let outcome = {
            let execution = planner.execute();
            tokio::pin!(execution);
            tokio::select! {
                outcome = &mut execution => outcome,
                _ = &mut deadline => {
                    warn!(operation_id = %self.id, timeout_secs = self.settings.base_timeout.as_secs(), "Operation ran out of time");
                    self.out_of_time().await;
                    execution.await
                }
            }
        };
        let failure = match outcome {
            Ok(()) => {
                debug!(operation_id = %self.id, "Planner finished");
                None
            }
            Err(EngineError::OperationClosed(_)) => {
                debug!(operation_id = %self.id, "Planner stopped by closed operation");
                None
            }
            Err(e) => {
                error!(operation_id = %self.id, error = %e, "Planner failed");
                Some(e)
            }
        };

        if failure.is_none() && !self.settings.auto_close {
            while !self.is_closeable().await {
                let mut state_rx = self.state.subscribe();
                tokio::select! {
                    _ = &mut deadline => {
                        warn!(operation_id = %self.id, "Operation ran out of time");
                        self.out_of_time().await;
                    }
                    _ = state_rx.changed() => {}
                    _ = tokio::time::sleep(self.settings.finish_poll) => {}
                }
            }
        }

        self.is_closeable().await;
        self.close().await;

        match failure {
            Some(e) => Err(e),
            None => Ok(self.event_logs().await),
        }
    }

    /// One record per link that ran, in chain order
    pub async fn event_logs(&self) -> Vec<EventLogEntry> {
        let chain = self.chain().await;
        let ignored = self.ignored_links().await;
        let agents = self.agents().await;
        let operation_metadata = OperationMetadata {
            operation_name: self.name.clone(),
            operation_start: self.start_time().await.as_ref().map(event_log::format_time),
            operation_adversary: self.adversary.name.clone(),
        };

        let mut entries = Vec::new();
        for link in chain.iter().filter(|l| !l.can_ignore() && !ignored.contains(&l.id)) {
            let agent_metadata = agents
                .iter()
                .find(|a| a.paw == link.paw)
                .map_or_else(|| serde_json::json!({}), Agent::metadata);
            let output = if link.output {
                self.read_output(&link.id).await
            } else {
                None
            };
            entries.push(EventLogEntry::from_link(
                link,
                agent_metadata,
                operation_metadata.clone(),
                output,
            ));
        }
        entries
    }

    async fn read_output(&self, link_id: &str) -> Option<serde_json::Value> {
        match self.services.results.read_result(link_id).await {
            Ok(Some(payload)) => match event_log::decode_result(&payload) {
                Ok(output) => Some(output),
                Err(e) => {
                    warn!(link_id = %link_id, error = %e, "Stored result could not be decoded");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(link_id = %link_id, error = %e, "Failed to read stored result");
                None
            }
        }
    }
}

/// Resolves once the operation is closing or closed
async fn closed(mut state_rx: watch::Receiver<OperationState>) {
    loop {
        if state_rx.borrow_and_update().is_closed() {
            return;
        }
        if state_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ability::AbilityExecutor;

    fn adversary(ordering: &[&str]) -> Adversary {
        Adversary {
            id: "adv".into(),
            name: "Test adversary".into(),
            description: String::new(),
            atomic_ordering: ordering.iter().map(|s| s.to_string()).collect(),
            objective: None,
        }
    }

    fn operation(abilities: Vec<Ability>, ordering: &[&str]) -> Arc<Operation> {
        let (services, _) = EngineServices::in_memory(CommandExecutor::default()).unwrap();
        OperationBuilder::new("test", adversary(ordering))
            .abilities(abilities)
            .agent(Agent::new("paw", "linux", vec!["sh".into()]))
            .build(services)
    }

    fn link(op: &Operation, id: &str) -> Link {
        let ability = op.ability(id).unwrap();
        let executor = ability.executors[0].clone();
        Link::new(ability, executor, "paw", "echo hi", LinkStatus::EXECUTE)
    }

    fn echo(id: &str) -> Ability {
        Ability::new(id, "discovery", AbilityExecutor::new("sh", "linux", "echo hi"))
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&OperationState::RunOneLink).unwrap(), "\"run_one_link\"");
        assert_eq!(OperationState::OutOfTime.to_string(), "out_of_time");
        assert!(OperationState::Finished.is_terminal());
        assert!(!OperationState::Cleanup.is_terminal());
        assert!(OperationState::Cleanup.is_closed());
    }

    #[tokio::test]
    async fn test_atomic_abilities_skip_unknown_and_repeats() {
        let op = operation(vec![echo("a"), echo("b")], &["b", "missing", "a", "b"]);
        let ids: Vec<String> = op.atomic_abilities().iter().map(|a| a.id.clone()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_apply_in_run_one_link_pauses() {
        let op = operation(vec![echo("a")], &["a"]);
        assert!(op.step().await);
        op.apply(link(&op, "a")).await.unwrap();
        assert_eq!(op.state(), OperationState::Paused);
        assert_eq!(op.chain().await.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_rejected_when_closed() {
        let op = operation(vec![echo("a")], &["a"]);
        assert!(op.out_of_time().await);
        let err = op.apply(link(&op, "a")).await.unwrap_err();
        assert!(matches!(err, EngineError::OperationClosed(_)));
        assert!(op.chain().await.is_empty());
    }

    #[tokio::test]
    async fn test_paused_apply_resumes_on_transition() {
        let op = operation(vec![echo("a")], &["a"]);
        op.pause().await;

        let waiter = {
            let op = Arc::clone(&op);
            let link = link(&op, "a");
            tokio::spawn(async move { op.apply(link).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(op.chain().await.is_empty());

        op.resume().await;
        waiter.await.unwrap().unwrap();
        assert_eq!(op.chain().await.len(), 1);
    }

    #[tokio::test]
    async fn test_discarded_link_is_ignored_by_wait() {
        let op = operation(vec![echo("a")], &["a"]);
        let mut pending = link(&op, "a");
        pending.status = LinkStatus::PAUSE;
        let id = op.add_link(pending).await;
        op.discard_link(&id).await.unwrap();

        op.wait_for_links_completion(&[id.clone()]).await.unwrap();
        assert!(op.ignored_links().await.contains(&id));
        assert!(op.event_logs().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_discards_links_that_never_ran() {
        let op = operation(vec![echo("a")], &["a"]);
        let id = op.add_link(link(&op, "a")).await;
        assert!(op.out_of_time().await);

        let err = op.wait_for_links_completion(&[id.clone()]).await.unwrap_err();
        assert!(matches!(err, EngineError::OperationClosed(_)));

        op.close().await;
        let stored = op.get_link(&id).await.unwrap();
        assert_eq!(stored.status, LinkStatus::DISCARD);
        assert!(!stored.is_finished());
        assert!(op.event_logs().await.is_empty());
    }

    #[tokio::test]
    async fn test_approve_unknown_link() {
        let op = operation(vec![echo("a")], &["a"]);
        assert!(matches!(
            op.approve_link("nope").await,
            Err(EngineError::LinkNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_promote_potential_link() {
        let op = operation(vec![echo("a")], &["a"]);
        let queued = link(&op, "a");
        let id = queued.id.clone();
        op.add_potential_link(queued).await;
        assert!(op.has_link(&id).await);

        op.promote_potential_link(&id).await.unwrap();
        assert!(op.potential_links().await.is_empty());
        assert!(op.get_link(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_suppressed_facts_are_not_active() {
        let op = operation(vec![echo("a")], &["a"]);
        let knowledge = &op.services().knowledge;
        knowledge
            .add_fact(Fact::new("host.user.name", "root").with_source(&op.id))
            .await;
        knowledge
            .add_fact(Fact::new("host.user.name", "guest").with_source(&op.id).with_score(0))
            .await;
        knowledge
            .add_fact(Fact::new("host.user.name", "other").with_source("elsewhere"))
            .await;

        let facts = op.all_facts().await;
        assert_eq!(facts.len(), 1);
        assert!(op.has_fact("host.user.name", "root").await);
        assert!(!op.has_fact("host.user.name", "guest").await);
    }
}
