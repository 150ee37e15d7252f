//! CLI interface for Sortie
//!
//! This module provides the command-line interface using clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Sortie adversary-emulation engine
///
/// Runs an adversary profile against the local machine as a single agent,
/// planning links from a fact-driven knowledge base and recording everything
/// in event logs.
#[derive(Parser, Debug)]
#[command(name = "sortie")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an operation from a profile
    Run {
        /// Profile document (TOML)
        #[arg(short, long, value_name = "FILE")]
        profile: PathBuf,

        /// Platform reported by the local agent (defaults to this OS)
        #[arg(long, value_name = "PLATFORM")]
        agent_platform: Option<String>,

        /// Executors the local agent offers, in preference order
        #[arg(long, value_delimiter = ',', default_value = "sh")]
        executors: Vec<String>,

        /// Privilege of the local agent (User or Elevated)
        #[arg(long, default_value = "User")]
        privilege: String,

        /// Planner id, name, or module (overrides the profile)
        #[arg(long)]
        planner: Option<String>,

        /// Start paused and admit one link per Enter key press
        #[arg(long)]
        step: bool,

        /// Keep results and sources in memory only
        #[arg(long)]
        ephemeral: bool,
    },

    /// List registered planners
    Planners,

    /// Load and check a profile without running it
    Validate {
        /// Profile document (TOML)
        #[arg(short, long, value_name = "FILE")]
        profile: PathBuf,
    },

    /// Show sources persisted by past operations
    History {
        /// Number of sources to show (default: 10)
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["sortie", "--json", "--log", "debug", "planners"]);
        assert!(cli.json);
        assert_eq!(cli.log, Some("debug".to_string()));
        assert!(matches!(cli.command, Command::Planners));
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::parse_from(["sortie", "run", "--profile", "ops.toml"]);
        if let Command::Run {
            profile,
            executors,
            privilege,
            step,
            ephemeral,
            planner,
            agent_platform,
        } = cli.command
        {
            assert_eq!(profile, PathBuf::from("ops.toml"));
            assert_eq!(executors, vec!["sh"]);
            assert_eq!(privilege, "User");
            assert!(!step);
            assert!(!ephemeral);
            assert!(planner.is_none());
            assert!(agent_platform.is_none());
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_run_executor_list() {
        let cli = Cli::parse_from([
            "sortie",
            "run",
            "-p",
            "ops.toml",
            "--executors",
            "psh,sh",
            "--step",
        ]);
        if let Command::Run { executors, step, .. } = cli.command {
            assert_eq!(executors, vec!["psh", "sh"]);
            assert!(step);
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_history_command() {
        let cli = Cli::parse_from(["sortie", "history", "--limit", "20"]);
        if let Command::History { limit } = cli.command {
            assert_eq!(limit, 20);
        } else {
            panic!("Expected History command");
        }
    }
}
