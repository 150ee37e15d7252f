use chrono::Utc;
use sdk::errors::EngineError;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::link::{Link, LinkResult, LinkStatus};

/// Exit code reported when the target program could not be started
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Shell an ability executor runs its command through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShellType {
    /// Windows PowerShell
    Psh,
    /// Cross-platform PowerShell
    Pwsh,
    /// POSIX shell
    Sh,
    /// No shell; the command is split on whitespace and run directly
    Proc,
}

impl ShellType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Psh => "psh",
            Self::Pwsh => "pwsh",
            Self::Sh => "sh",
            Self::Proc => "proc",
        }
    }

    /// Program and leading arguments the command is appended to
    fn default_prefix(self) -> Option<&'static [&'static str]> {
        match self {
            Self::Psh => Some(&["powershell", "-Command"]),
            Self::Pwsh => Some(&["pwsh", "-Command"]),
            Self::Sh => Some(&["sh", "-c"]),
            Self::Proc => None,
        }
    }
}

impl FromStr for ShellType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "psh" => Ok(Self::Psh),
            "pwsh" => Ok(Self::Pwsh),
            "sh" => Ok(Self::Sh),
            "proc" => Ok(Self::Proc),
            other => Err(EngineError::UnknownShell(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    UnknownShell(#[from] EngineError),

    #[error("Empty command for shell '{0}'")]
    EmptyCommand(&'static str),
}

impl From<CommandError> for EngineError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::UnknownShell(inner) => inner,
            other => EngineError::Config(other.to_string()),
        }
    }
}

/// Runs link commands as local subprocesses
///
/// # Execution
/// - stdin set to null, stdout and stderr piped
/// - the child is killed when the executor timeout elapses
/// - a program that cannot be started is reported as exit code 127 with the
///   spawn error in stderr, never as an `Err`
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    overrides: BTreeMap<String, Vec<String>>,
    default_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            overrides: BTreeMap::new(),
            default_timeout,
        }
    }

    /// Replace the invocation prefix of named shells (e.g. `sh = ["bash", "-c"]`)
    pub fn with_overrides(mut self, overrides: BTreeMap<String, Vec<String>>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Build the argv for `command` under `shell`
    ///
    /// # Errors
    /// `EngineError::UnknownShell` for shell names outside psh, pwsh, sh, proc.
    pub fn argv(&self, command: &str, shell: &str) -> Result<Vec<String>, CommandError> {
        let shell_type: ShellType = shell.parse()?;

        let mut argv: Vec<String> = match self.overrides.get(shell_type.as_str()) {
            Some(prefix) => prefix.clone(),
            None => shell_type
                .default_prefix()
                .map(|p| p.iter().map(|s| s.to_string()).collect())
                .unwrap_or_default(),
        };

        if shell_type == ShellType::Proc && !self.overrides.contains_key("proc") {
            argv.extend(command.split_whitespace().map(str::to_string));
        } else {
            argv.push(command.to_string());
        }

        if argv.is_empty() {
            return Err(CommandError::EmptyCommand(shell_type.as_str()));
        }
        Ok(argv)
    }

    /// Run a command and capture its result
    ///
    /// Only configuration problems are errors. A command that fails, times
    /// out, or cannot be found yields a `LinkResult` with a non-zero exit code.
    pub async fn run_command(
        &self,
        link_id: &str,
        command: &str,
        shell: &str,
        timeout: Option<Duration>,
    ) -> Result<LinkResult, CommandError> {
        let argv = self.argv(command, shell)?;
        let timeout = timeout.unwrap_or(self.default_timeout);

        debug!(link_id, shell, ?argv, "Spawning command");

        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(link_id, program = %argv[0], error = %e, "Failed to start command");
                return Ok(LinkResult {
                    link_id: link_id.to_string(),
                    stdout: String::new(),
                    stderr: e.to_string(),
                    exit_code: SPAWN_FAILURE_EXIT_CODE,
                    pid: None,
                    agent_reported_time: Utc::now(),
                });
            }
        };
        let pid = child.id();

        let result = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => LinkResult {
                link_id: link_id.to_string(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(-1),
                pid,
                agent_reported_time: Utc::now(),
            },
            Ok(Err(e)) => LinkResult {
                link_id: link_id.to_string(),
                stdout: String::new(),
                stderr: e.to_string(),
                exit_code: -1,
                pid,
                agent_reported_time: Utc::now(),
            },
            Err(_) => {
                warn!(link_id, timeout_secs = timeout.as_secs(), "Command timed out");
                LinkResult {
                    link_id: link_id.to_string(),
                    stdout: String::new(),
                    stderr: format!("Command timed out after {} seconds", timeout.as_secs()),
                    exit_code: LinkStatus::TIMEOUT.0,
                    pid,
                    agent_reported_time: Utc::now(),
                }
            }
        };

        Ok(result)
    }

    /// Run a link's rendered command through its executor
    pub async fn running(&self, link: &Link) -> Result<LinkResult, CommandError> {
        info!(
            link_id = %link.id,
            ability = %link.ability.name,
            tactic = %link.ability.tactic,
            technique = %link.ability.technique_id,
            platform = %link.executor.platform,
            shell = %link.executor.name,
            command = %link.plaintext_command,
            "Running procedure"
        );
        let timeout = link.executor.timeout.map(Duration::from_secs);
        let result = self
            .run_command(&link.id, &link.command, &link.executor.name, timeout)
            .await?;
        info!(link_id = %link.id, exit_code = result.exit_code, "Procedure finished");
        Ok(result)
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
