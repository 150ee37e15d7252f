//! Sortie Engine Library
//!
//! This library provides the core functionality of the Sortie engine.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Telemetry and Observability
pub mod telemetry;

/// Database persistence module
pub mod db;

/// Message bus for operation progress events
pub mod message_bus;

/// Fact, relationship, and rule storage
pub mod knowledge;

/// Objectives and goals
pub mod objective;

/// Abilities, adversaries, planner configurations, and fact sources
pub mod ability;

/// Execution targets and capability resolution
pub mod agent;

/// Links and link results
pub mod link;

/// Shell command execution
pub mod command_executor;

/// Output parsers
pub mod parsers;

/// Generic learning parsers
pub mod learning;

/// Link generation and bucket execution
pub mod planning;

/// Planner state machines
pub mod planner;

/// Operation lifecycle and event logs
pub mod operation;

/// Profile documents
pub mod profile;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
