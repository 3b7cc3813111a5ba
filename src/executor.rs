use std::path::PathBuf;
use std::process::Command;

use thiserror::Error;

/// Reserved target meaning "run on this machine without any transport".
pub const LOCALHOST: &str = "localhost";

/// Outcome of one command on one target. Produced exactly once per
/// execution and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The run could not even be attempted (as opposed to a command that ran
/// and returned non-zero, which is a normal `CommandResult`).
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("identity file is not a readable file: '{}'", .0.display())]
    IdentityFile(PathBuf),

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Transport seam: runs one command against one target. The dispatcher and
/// the execution context only ever talk to this trait; how bytes reach the
/// host is the implementation's business.
pub trait Executor: Send + Sync {
    fn execute(&self, target: &str, command: &str) -> Result<CommandResult, ExecError>;
}

/// Production executor. Local targets run under `sh -c`; remote targets are
/// handed to the external `ssh` binary, with the command fed on stdin via a
/// quoted heredoc so shell metacharacters survive the hop.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    /// Passed to ssh as `-i`; validated to exist before the run is attempted.
    pub identity_file: Option<PathBuf>,
    /// Intermediate host to proxy through (`ProxyCommand ssh -A <jumphost> nc %h %p`).
    pub jumphost: Option<String>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn ssh_command(&self, target: &str, command: &str) -> Result<String, ExecError> {
        let mut extra: Vec<String> = Vec::new();
        if let Some(jumphost) = &self.jumphost {
            extra.push(format!("-o \"ProxyCommand ssh -A {jumphost} nc %h %p\""));
        }
        if let Some(identity) = &self.identity_file {
            if !identity.is_file() {
                return Err(ExecError::IdentityFile(identity.clone()));
            }
            extra.push(format!("-i {}", identity.display()));
        }
        Ok(format!(
            "ssh -T {} {} <<'EOF'\n{}\nEOF",
            extra.join(" "),
            target,
            command
        ))
    }
}

impl Executor for ShellExecutor {
    fn execute(&self, target: &str, command: &str) -> Result<CommandResult, ExecError> {
        let shell_cmd = if target == LOCALHOST {
            command.to_string()
        } else {
            self.ssh_command(target, command)?
        };
        run_shell(&shell_cmd)
    }
}

/// Run a command string under `sh -c`, capturing stdout and stderr.
///
/// A process killed by a signal has no exit code; it is reported with the
/// sentinel `-1`. Executors that enforce deadlines are expected to encode
/// them the same way rather than surfacing a scheduler-level error.
pub fn run_shell(command: &str) -> Result<CommandResult, ExecError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(|source| ExecError::Spawn {
            command: command.to_string(),
            source,
        })?;

    Ok(CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}
