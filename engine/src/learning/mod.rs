//! Generic learning from free-text output
//!
//! Runs when an executor declares no parsers of its own. Each learning parser
//! scans the output for one kind of observation; the service keeps only facts
//! not already in the operation's fact set.

use regex::Regex;
use sdk::errors::EngineError;
use sdk::types::Fact;
use std::net::Ipv4Addr;
use tracing::debug;

/// Extracts facts from arbitrary command output
pub trait LearningParser: Send + Sync {
    fn name(&self) -> &str;

    fn parse(&self, blob: &str) -> Vec<Fact>;
}

/// IPv4 addresses, excluding unspecified and loopback
pub struct IpParser {
    pattern: Regex,
}

impl IpParser {
    pub fn new() -> Result<Self, EngineError> {
        let pattern = Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b")
            .map_err(|e| EngineError::Parser(format!("Invalid IP pattern: {}", e)))?;
        Ok(Self { pattern })
    }
}

impl LearningParser for IpParser {
    fn name(&self) -> &str {
        "ip"
    }

    fn parse(&self, blob: &str) -> Vec<Fact> {
        self.pattern
            .find_iter(blob)
            .filter_map(|m| m.as_str().parse::<Ipv4Addr>().ok())
            .filter(|ip| !ip.is_unspecified() && !ip.is_loopback())
            .map(|ip| Fact::new("host.ip.address", ip.to_string()))
            .collect()
    }
}

/// Absolute file paths with an extension, POSIX or Windows style
pub struct PathParser {
    pattern: Regex,
}

impl PathParser {
    pub fn new() -> Result<Self, EngineError> {
        let pattern = Regex::new(r"(?:/[\w.\-]+)+\.\w+|[A-Za-z]:\\(?:[\w.\- ]+\\)*[\w.\-]+\.\w+")
            .map_err(|e| EngineError::Parser(format!("Invalid path pattern: {}", e)))?;
        Ok(Self { pattern })
    }
}

impl LearningParser for PathParser {
    fn name(&self) -> &str {
        "path"
    }

    fn parse(&self, blob: &str) -> Vec<Fact> {
        self.pattern
            .find_iter(blob)
            .map(|m| Fact::new("host.file.path", m.as_str()))
            .collect()
    }
}

pub struct LearningService {
    parsers: Vec<Box<dyn LearningParser>>,
}

impl LearningService {
    /// Service with the built-in IP and path parsers
    pub fn new() -> Result<Self, EngineError> {
        Ok(Self {
            parsers: vec![Box::new(IpParser::new()?), Box::new(PathParser::new()?)],
        })
    }

    pub fn with_parsers(parsers: Vec<Box<dyn LearningParser>>) -> Self {
        Self { parsers }
    }

    /// Facts found in `blob` that are neither in `known` nor repeated
    pub fn learn(&self, known: &[Fact], blob: &str) -> Vec<Fact> {
        let mut found: Vec<Fact> = Vec::new();
        for parser in &self.parsers {
            for fact in parser.parse(blob) {
                let seen = known
                    .iter()
                    .chain(found.iter())
                    .any(|f| f.trait_name == fact.trait_name && f.value == fact.value);
                if !seen {
                    debug!(parser = parser.name(), trait_name = %fact.trait_name, value = %fact.value, "Learned fact");
                    found.push(fact);
                }
            }
        }
        found
    }
}
