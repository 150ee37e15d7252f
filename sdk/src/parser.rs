//! Output parser trait and context types
//!
//! An output parser turns the raw stdout of a link into relationships between
//! facts. Parsers are registered with the engine by name and referenced from
//! ability executors; the engine owns storing whatever they return.

use crate::errors::EngineError;
use crate::types::{Fact, Relationship};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One mapping from parsed output to facts
///
/// `source` names the trait of the source fact. When `target` is set the
/// parser emits a relationship `source --edge--> target`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ParserConfig {
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_parser_vals: BTreeMap<String, String>,
}

impl ParserConfig {
    /// Mapping that produces a single fact per match
    pub fn source(trait_name: impl Into<String>) -> Self {
        Self {
            source: trait_name.into(),
            edge: None,
            target: None,
            custom_parser_vals: BTreeMap::new(),
        }
    }
}

/// Read-only view of the link being parsed
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    /// Paw of the agent that ran the link
    pub paw: &'a str,

    /// Id of the link that produced the output
    pub link_id: &'a str,

    /// Facts substituted into the command
    pub used_facts: &'a [Fact],
}

impl ParseContext<'_> {
    /// Value of the used fact with the given trait, if the command consumed one
    pub fn used_value(&self, trait_name: &str) -> Option<&str> {
        self.used_facts
            .iter()
            .find(|f| f.trait_name == trait_name)
            .map(|f| f.value.as_str())
    }
}

/// Trait that all output parsers must implement
pub trait OutputParser: Send + Sync {
    /// Name the parser is registered under
    fn name(&self) -> &str;

    /// Extract relationships from decoded stdout
    fn parse(
        &self,
        output: &str,
        mappers: &[ParserConfig],
        ctx: &ParseContext<'_>,
    ) -> Result<Vec<Relationship>, EngineError>;
}
