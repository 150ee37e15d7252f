//! Objectives and goals
//!
//! An objective is a named set of goals evaluated against the operation's
//! fact set. The operation is finished as soon as every goal is satisfied.

use sdk::types::Fact;
use serde::{Deserialize, Serialize};

/// Identity of the objective used when a profile names none
pub const DEFAULT_OBJECTIVE_ID: &str = "495a9828-cab1-44dd-a0ca-66e58177d8cc";

/// Comparison applied between a fact value and a goal value
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum GoalOperator {
    #[default]
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
    /// Goal value is a substring of the fact value
    #[serde(rename = "in")]
    In,
    /// Any value of the target trait
    #[serde(rename = "*")]
    Any,
}

impl GoalOperator {
    fn compare(self, goal_value: &str, fact_value: &str) -> bool {
        let numeric = goal_value
            .parse::<f64>()
            .ok()
            .zip(fact_value.parse::<f64>().ok());
        match self {
            Self::Any => true,
            Self::In => fact_value.contains(goal_value),
            Self::Eq => match numeric {
                Some((g, f)) => f == g,
                None => fact_value == goal_value,
            },
            // ordering goals read as "goal <op> fact"
            Self::Lt => numeric.is_some_and(|(g, f)| g < f),
            Self::Gt => numeric.is_some_and(|(g, f)| g > f),
            Self::Le => numeric.is_some_and(|(g, f)| g <= f),
            Self::Ge => numeric.is_some_and(|(g, f)| g >= f),
        }
    }
}

/// One requirement on the fact set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Goal {
    /// Trait the goal looks at
    pub target: String,

    #[serde(default = "default_goal_value")]
    pub value: String,

    /// How many matching facts are needed
    #[serde(default = "default_count")]
    pub count: usize,

    #[serde(default)]
    pub operator: GoalOperator,
}

fn default_goal_value() -> String {
    "likely".to_string()
}

fn default_count() -> usize {
    1
}

impl Goal {
    pub fn new(target: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            value: value.into(),
            count: default_count(),
            operator: GoalOperator::Eq,
        }
    }

    /// Whether enough active facts meet the goal
    pub fn satisfied(&self, facts: &[Fact]) -> bool {
        let matching = facts
            .iter()
            .filter(|f| f.is_active() && f.trait_name == self.target)
            .filter(|f| self.operator.compare(&self.value, &f.value))
            .count();
        matching >= self.count
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Objective {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub goals: Vec<Goal>,
}

impl Objective {
    /// Objective whose single goal is never produced by commands, so the
    /// operation runs until the planner is exhausted
    pub fn default_objective() -> Self {
        Self {
            id: DEFAULT_OBJECTIVE_ID.to_string(),
            name: "default".to_string(),
            description: "This is a default objective that runs forever.".to_string(),
            goals: vec![Goal::new("exhaustion", "complete")],
        }
    }

    /// True when every goal is satisfied; an objective without goals always is
    pub fn completed(&self, facts: &[Fact]) -> bool {
        self.goals.iter().all(|g| g.satisfied(facts))
    }

    /// Fraction of goals already satisfied
    pub fn percentage(&self, facts: &[Fact]) -> f64 {
        if self.goals.is_empty() {
            return 100.0;
        }
        let done = self.goals.iter().filter(|g| g.satisfied(facts)).count();
        100.0 * done as f64 / self.goals.len() as f64
    }
}
