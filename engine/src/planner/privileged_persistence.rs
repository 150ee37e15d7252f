//! Privileged persistence planner
//!
//! Escalates privilege, persists when escalation worked, collects, discovers,
//! and moves laterally back into escalation:
//!
//! ```text
//! privilege_escalation --root/admin--> persistence --> collection
//!          \--otherwise--> collection --> discovery --lateral links--> lateral_movement
//!                                              \--none--> done
//! lateral_movement --> privilege_escalation
//! ```

use async_trait::async_trait;
use sdk::errors::EngineError;
use std::sync::Arc;
use tracing::info;

use super::{Planner, PlannerContext};

pub const NAME: &str = "privileged_persistence";

const STATE_MACHINE: [&str; 5] = [
    "privilege_escalation",
    "persistence",
    "collection",
    "discovery",
    "lateral_movement",
];

/// Ability bucket holding escalation techniques
const PRIVILEGE_ESCALATION_BUCKET: &str = "privilege escalation";

pub struct PrivilegedPersistencePlanner {
    ctx: PlannerContext,
}

impl PrivilegedPersistencePlanner {
    pub fn new(ctx: PlannerContext) -> Self {
        Self { ctx }
    }

    async fn privilege_escalation(&mut self) -> Result<Option<String>, EngineError> {
        let operation = Arc::clone(&self.ctx.operation);
        let links = self
            .ctx
            .planning
            .get_links(&operation, Some(&[PRIVILEGE_ESCALATION_BUCKET][..]), None)
            .await;
        let paw = links.first().map(|l| l.paw.clone());

        let mut link_ids = Vec::with_capacity(links.len());
        for link in links {
            link_ids.push(operation.apply(link).await?);
        }
        operation.wait_for_links_completion(&link_ids).await?;

        let escalated = match paw {
            Some(paw) => {
                operation.has_true_fact(&format!("{}.privilege.root", paw)).await
                    || operation.has_true_fact(&format!("{}.privilege.admin", paw)).await
            }
            None => false,
        };
        info!(escalated, "Privilege escalation bucket done");

        Ok(Some(if escalated { "persistence" } else { "collection" }.to_string()))
    }

    async fn persistence(&mut self) -> Result<Option<String>, EngineError> {
        let planning = Arc::clone(&self.ctx.planning);
        planning
            .exhaust_bucket(&mut self.ctx, "persistence", None, true, true)
            .await?;
        planning
            .default_next_bucket("persistence", &STATE_MACHINE)
            .map(Some)
    }

    async fn collection(&mut self) -> Result<Option<String>, EngineError> {
        let planning = Arc::clone(&self.ctx.planning);
        planning
            .exhaust_bucket(&mut self.ctx, "collection", None, true, true)
            .await?;
        Ok(Some("discovery".to_string()))
    }

    // No lateral links ends the run here; an empty discovery bucket alone does not.
    async fn discovery(&mut self) -> Result<Option<String>, EngineError> {
        let planning = Arc::clone(&self.ctx.planning);
        planning
            .exhaust_bucket(&mut self.ctx, "discovery", None, true, true)
            .await?;
        let lateral_movement_unlocked = !planning
            .get_links(&self.ctx.operation, Some(&["lateral_movement"][..]), None)
            .await
            .is_empty();
        if lateral_movement_unlocked {
            planning
                .default_next_bucket("discovery", &STATE_MACHINE)
                .map(Some)
        } else {
            Ok(None)
        }
    }

    async fn lateral_movement(&mut self) -> Result<Option<String>, EngineError> {
        let planning = Arc::clone(&self.ctx.planning);
        planning
            .exhaust_bucket(&mut self.ctx, "lateral_movement", None, true, true)
            .await?;
        Ok(Some("privilege_escalation".to_string()))
    }
}

#[async_trait]
impl Planner for PrivilegedPersistencePlanner {
    fn name(&self) -> &str {
        NAME
    }

    fn initial_bucket(&self) -> Option<String> {
        Some(STATE_MACHINE[0].to_string())
    }

    fn context(&self) -> &PlannerContext {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut PlannerContext {
        &mut self.ctx
    }

    async fn run_bucket(&mut self, bucket: &str) -> Result<Option<String>, EngineError> {
        match bucket {
            "privilege_escalation" => self.privilege_escalation().await,
            "persistence" => self.persistence().await,
            "collection" => self.collection().await,
            "discovery" => self.discovery().await,
            "lateral_movement" => self.lateral_movement().await,
            other => Err(EngineError::UnknownBucket {
                planner: NAME.to_string(),
                bucket: other.to_string(),
            }),
        }
    }
}
