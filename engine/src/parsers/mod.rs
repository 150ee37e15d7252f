//! Output parser registry
//!
//! Executors reference parsers by name. The registry resolves those names to
//! [`OutputParser`] implementations; `basic` is always registered.

use sdk::errors::EngineError;
use sdk::parser::{OutputParser, ParseContext, ParserConfig};
use sdk::types::{Fact, Relationship};
use std::collections::HashMap;
use std::sync::Arc;

/// Emits one relationship per non-empty output line per mapper
///
/// A mapper end whose trait was substituted into the command takes the used
/// fact's value instead of the line.
#[derive(Debug, Default)]
pub struct LineParser;

impl LineParser {
    fn value_for(trait_name: &str, line: &str, ctx: &ParseContext<'_>) -> String {
        ctx.used_value(trait_name).unwrap_or(line).to_string()
    }
}

impl OutputParser for LineParser {
    fn name(&self) -> &str {
        "basic"
    }

    fn parse(
        &self,
        output: &str,
        mappers: &[ParserConfig],
        ctx: &ParseContext<'_>,
    ) -> Result<Vec<Relationship>, EngineError> {
        let mut relationships = Vec::new();
        for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
            for mapper in mappers {
                let source = Fact::new(&mapper.source, Self::value_for(&mapper.source, line, ctx));
                let relationship = match &mapper.target {
                    Some(target) => Relationship::new(source).with_target(
                        mapper.edge.clone(),
                        Fact::new(target, Self::value_for(target, line, ctx)),
                    ),
                    None => match &mapper.edge {
                        Some(edge) => Relationship::new(source).with_edge(edge),
                        None => Relationship::new(source),
                    },
                };
                relationships.push(relationship);
            }
        }
        Ok(relationships)
    }
}

/// Name-to-parser lookup
#[derive(Clone)]
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn OutputParser>>,
}

impl ParserRegistry {
    /// Registry holding the built-in parsers
    pub fn new() -> Self {
        let mut registry = Self {
            parsers: HashMap::new(),
        };
        registry.register(Arc::new(LineParser));
        registry
    }

    pub fn register(&mut self, parser: Arc<dyn OutputParser>) {
        self.parsers.insert(parser.name().to_string(), parser);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn OutputParser>, EngineError> {
        self.parsers
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ParserNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parsers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.parsers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}
