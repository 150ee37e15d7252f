//! Error types and handling
//!
//! This module provides the error types used throughout the Sortie engine.
//! All errors implement the `SortieErrorExt` trait which provides operator-facing
//! hints and indicates whether errors are recoverable.
//!
//! # Error Categories
//!
//! The engine distinguishes failures by who has to act on them:
//!
//! - **Configuration**: unknown shell types, missing planners or objectives,
//!   malformed profiles. These abort the run and are never retried.
//! - **Lookup misses**: a fact, link, or ability that is not where the caller
//!   expected it. Most call sites log these and carry on; the variants exist for
//!   the call sites where a miss is fatal.
//! - **Collaborators**: result stores, source persistence, output parsers.
//!
//! A command that exits non-zero is *not* an error. It is ordinary result data
//! and never surfaces through this type.

use thiserror::Error;

/// Trait for Sortie error extensions
///
/// Provides additional context for errors, including an operator-facing
/// hint and recoverability information. All engine errors implement this trait.
pub trait SortieErrorExt {
    /// Returns a short hint describing what the operator should check
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors leave the operation able to make forward progress.
    /// Non-recoverable errors mean the run has to be aborted and reconfigured.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, SortieErrorExt};
///
/// let error = EngineError::UnknownShell("foo".to_string());
/// assert!(!error.is_recoverable());
///
/// let miss = EngineError::LinkNotFound("3f1c".to_string());
/// assert!(miss.is_recoverable());
/// println!("Hint: {}", miss.user_hint());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown shell type '{0}'. Choose from 'psh', 'pwsh', 'sh', or 'proc'")]
    UnknownShell(String),

    #[error("Planner not found: {0}")]
    PlannerNotFound(String),

    #[error("Objective not found: {0}")]
    ObjectiveNotFound(String),

    #[error("Parser not found: {0}")]
    ParserNotFound(String),

    #[error("Unknown bucket '{bucket}' for planner {planner}")]
    UnknownBucket { planner: String, bucket: String },

    #[error("Profile error: {0}")]
    Profile(String),

    // Lookup misses
    #[error("Ability not found: {0}")]
    AbilityNotFound(String),

    #[error("Link not found: {0}")]
    LinkNotFound(String),

    // Operation lifecycle
    #[error("Operation {0} is closed and no longer admits links")]
    OperationClosed(String),

    #[error("Operation {0} ran out of time")]
    OperationTimedOut(String),

    // Collaborator errors
    #[error("Parser error: {0}")]
    Parser(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SortieErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            // Configuration errors
            Self::Config(_) => "Check your config.toml file for errors",
            Self::UnknownShell(_) => "Ability executors must use psh, pwsh, sh, or proc",
            Self::PlannerNotFound(_) => "Run 'sortie planners' to list registered planners",
            Self::ObjectiveNotFound(_) => "Add the objective (or a 'default' one) to the profile",
            Self::ParserNotFound(_) => "Executor references a parser that is not registered",
            Self::UnknownBucket { .. } => "Planner returned a bucket it does not implement",
            Self::Profile(_) => "Check the profile document for missing or unknown fields",

            // Lookup misses
            Self::AbilityNotFound(_) => "Adversary references an ability missing from the profile",
            Self::LinkNotFound(_) => "The link is not part of this operation",

            // Operation lifecycle
            Self::OperationClosed(_) => "The operation has already finished",
            Self::OperationTimedOut(_) => "Raise operation.base_timeout_secs for longer runs",

            // Collaborator errors
            Self::Parser(_) => "Output parser failed. The raw result is still stored",
            Self::Database(_) => "Result store operation failed. Check the data directory",
            Self::Serialization(_) => "Stored data could not be encoded or decoded",

            // Generic IO error
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Configuration errors abort the run
            Self::Config(_)
            | Self::UnknownShell(_)
            | Self::PlannerNotFound(_)
            | Self::ObjectiveNotFound(_)
            | Self::ParserNotFound(_)
            | Self::UnknownBucket { .. }
            | Self::Profile(_)
            | Self::OperationClosed(_) => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}
