//! Planners
//!
//! A planner is a state machine over named buckets. The planning service calls
//! [`Planner::run_bucket`] with the current bucket until it returns `None`.
//! Buckets may lead back to earlier ones.
//!
//! Planners are resolved by module name through the [`PlannerRegistry`].

pub mod atomic;
pub mod privileged_persistence;

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::Fact;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::ability::PlannerSpec;
use crate::operation::Operation;
use crate::planning::PlanningService;

pub use atomic::AtomicPlanner;
pub use privileged_persistence::PrivilegedPersistencePlanner;

/// State every planner carries
pub struct PlannerContext {
    pub operation: Arc<Operation>,
    pub planning: Arc<PlanningService>,
    pub stopping_conditions: Vec<Fact>,
    pub stopping_condition_met: bool,
}

impl PlannerContext {
    pub fn new(operation: Arc<Operation>, planning: Arc<PlanningService>, stopping_conditions: Vec<Fact>) -> Self {
        Self {
            operation,
            planning,
            stopping_conditions,
            stopping_condition_met: false,
        }
    }
}

#[async_trait]
pub trait Planner: Send {
    fn name(&self) -> &str;

    /// Bucket the planner starts in
    fn initial_bucket(&self) -> Option<String>;

    fn context(&self) -> &PlannerContext;

    fn context_mut(&mut self) -> &mut PlannerContext;

    /// Run one bucket and return the next, or `None` when done
    ///
    /// # Errors
    /// `EngineError::UnknownBucket` for a bucket the planner does not define.
    async fn run_bucket(&mut self, bucket: &str) -> Result<Option<String>, EngineError>;
}

impl dyn Planner + '_ {
    /// Run the planner to completion
    pub async fn execute(&mut self) -> Result<(), EngineError> {
        let planning = Arc::clone(&self.context().planning);
        planning.execute_planner(self).await
    }
}

pub type PlannerConstructor = fn(PlannerContext, &BTreeMap<String, String>) -> Box<dyn Planner>;

/// Planner module name to constructor
pub struct PlannerRegistry {
    constructors: HashMap<String, PlannerConstructor>,
}

impl PlannerRegistry {
    /// Registry with the built-in planners
    pub fn new() -> Self {
        let mut registry = Self {
            constructors: HashMap::new(),
        };
        registry.register(privileged_persistence::NAME, |ctx, _| {
            Box::new(PrivilegedPersistencePlanner::new(ctx))
        });
        registry.register(atomic::NAME, |ctx, _| Box::new(AtomicPlanner::new(ctx)));
        registry
    }

    pub fn register(&mut self, module: &str, constructor: PlannerConstructor) {
        self.constructors.insert(module.to_string(), constructor);
    }

    pub fn contains(&self, module: &str) -> bool {
        self.constructors.contains_key(module)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build the planner `spec` names, bound to `operation`
    pub fn build(
        &self,
        spec: &PlannerSpec,
        operation: Arc<Operation>,
        planning: Arc<PlanningService>,
    ) -> Result<Box<dyn Planner>, EngineError> {
        let constructor = self
            .constructors
            .get(&spec.module)
            .ok_or_else(|| EngineError::PlannerNotFound(spec.module.clone()))?;
        let ctx = PlannerContext::new(operation, planning, spec.stopping_conditions.clone());
        Ok(constructor(ctx, &spec.params))
    }
}

impl Default for PlannerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_planners_registered() {
        let registry = PlannerRegistry::new();
        assert_eq!(registry.names(), vec!["atomic", "privileged_persistence"]);
        assert!(!registry.contains("batch"));
    }
}
