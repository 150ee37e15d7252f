//! Sortie SDK
//!
//! Shared library providing traits and value types for Sortie components.
//! This crate is used by both the engine and out-of-tree output parsers.

/// Error types and handling
pub mod errors;

/// Output parser trait and context types
pub mod parser;

/// Fact, relationship, and rule types
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, SortieErrorExt};
pub use parser::{OutputParser, ParseContext, ParserConfig};
pub use types::{Fact, OriginType, Relationship, Rule, RuleAction};
