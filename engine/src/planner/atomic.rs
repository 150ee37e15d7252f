//! Atomic planner
//!
//! Runs the adversary's abilities one at a time per agent, in atomic
//! ordering, until no agent has a runnable link left.

use async_trait::async_trait;
use sdk::errors::EngineError;
use std::collections::HashSet;
use std::sync::Arc;

use super::{Planner, PlannerContext};

pub const NAME: &str = "atomic";

pub struct AtomicPlanner {
    ctx: PlannerContext,
    attempted: HashSet<(String, String)>,
}

impl AtomicPlanner {
    pub fn new(ctx: PlannerContext) -> Self {
        Self {
            ctx,
            attempted: HashSet::new(),
        }
    }

    async fn atomic(&mut self) -> Result<Option<String>, EngineError> {
        let operation = Arc::clone(&self.ctx.operation);
        let ordering = &operation.adversary.atomic_ordering;

        let mut link_ids = Vec::new();
        for agent in operation.agents().await {
            let links = self
                .ctx
                .planning
                .get_links(&operation, None, Some(&agent))
                .await;
            let next = ordering.iter().find_map(|ability_id| {
                links.iter().find(|l| {
                    &l.ability.id == ability_id
                        && !self.attempted.contains(&(l.paw.clone(), l.command.clone()))
                })
            });
            if let Some(link) = next.cloned() {
                self.attempted.insert((link.paw.clone(), link.command.clone()));
                link_ids.push(operation.apply(link).await?);
            }
        }

        if link_ids.is_empty() {
            return Ok(None);
        }
        operation.wait_for_links_completion(&link_ids).await?;
        Ok(Some(NAME.to_string()))
    }
}

#[async_trait]
impl Planner for AtomicPlanner {
    fn name(&self) -> &str {
        NAME
    }

    fn initial_bucket(&self) -> Option<String> {
        Some(NAME.to_string())
    }

    fn context(&self) -> &PlannerContext {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut PlannerContext {
        &mut self.ctx
    }

    async fn run_bucket(&mut self, bucket: &str) -> Result<Option<String>, EngineError> {
        match bucket {
            NAME => self.atomic().await,
            other => Err(EngineError::UnknownBucket {
                planner: NAME.to_string(),
                bucket: other.to_string(),
            }),
        }
    }
}
