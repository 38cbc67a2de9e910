//! Host command execution
//!
//! [`CommandRunner`] is the seam between deployment logic and the host. The
//! production [`SystemRunner`] goes through [`run_command_safe`], which:
//!
//! - spawns the tool in its own process group with a parent-death signal,
//! - registers the PID with [`ChildRegistry::global`] for signal cleanup,
//! - refuses to spawn anything once the run has been cancelled.
//!
//! In dry-run mode mutating commands are logged and skipped; read-only
//! queries (`lsblk`, `blkid`, `systemctl status`) still execute so the
//! preview reflects the real host.

use crate::command_traits::HostCommand;
use crate::process_guard::{CancelToken, ChildRegistry, CommandProcessGroup};
use anyhow::{Context, Result};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Output from a host command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub success: bool,
    /// The command was skipped because of dry-run mode
    pub dry_run: bool,
}

impl CommandOutput {
    /// Output recorded for a mutating command skipped in dry-run mode
    pub fn skipped(description: &str) -> Self {
        Self {
            stdout: format!("[DRY RUN] Skipped: {}", description),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
            dry_run: true,
        }
    }

    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: Some(0),
            success: true,
            ..Self::default()
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code: Some(exit_code),
            success: false,
            ..Self::default()
        }
    }

    /// stdout followed by stderr, for pattern matching on tool messages
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Return an error if the command did not succeed
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            let code = self.exit_code.unwrap_or(-1);
            let detail = if self.stderr.trim().is_empty() {
                self.stdout.trim()
            } else {
                self.stderr.trim()
            };
            anyhow::bail!("{} failed (exit code {}): {}", context, code, detail)
        }
    }
}

/// Executes host commands on behalf of the deployment stages
pub trait CommandRunner {
    /// Run `command`, capturing its output.
    ///
    /// A non-zero exit is reported in [`CommandOutput::success`], not as `Err`.
    /// `Err` means the command could not be run at all.
    fn run(&self, command: &dyn HostCommand) -> Result<CommandOutput>;

    /// Whether mutating commands are being skipped
    fn is_dry_run(&self) -> bool;
}

/// Runs commands on the real host
#[derive(Debug, Clone)]
pub struct SystemRunner {
    dry_run: bool,
    cancel: CancelToken,
}

impl SystemRunner {
    pub fn new(dry_run: bool, cancel: CancelToken) -> Self {
        Self { dry_run, cancel }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, command: &dyn HostCommand) -> Result<CommandOutput> {
        if self.dry_run && command.is_mutating() {
            let description = command.describe();
            info!("[DRY RUN] Skipped: {}", description);
            return Ok(CommandOutput::skipped(&description));
        }
        run_command_safe(command, &self.cancel)
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

/// Execute a host command with process-group isolation.
///
/// This is the only place a host binary is spawned.
pub fn run_command_safe(command: &dyn HostCommand, cancel: &CancelToken) -> Result<CommandOutput> {
    let program = command.program();
    let args = command.to_cli_args();
    let env_vars = command.get_env_vars();

    if cancel.is_cancelled() {
        anyhow::bail!("Not starting {}: run was interrupted", program);
    }

    debug!(program, ?args, ?env_vars, "run_command_safe");

    let mut cmd = Command::new(program);
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    for (key, value) in &env_vars {
        cmd.env(key, value);
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program))?;
    let pid = child.id();

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.register(pid);
    }

    let output = child.wait_with_output();

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.unregister(pid);
    }

    let output = output.with_context(|| format!("Failed waiting for {}", program))?;

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code(),
        success: output.status.success(),
        dry_run: false,
    };

    if result.success {
        debug!("{} exited successfully", program);
    } else {
        debug!("{} failed with exit code {:?}", program, result.exit_code);
    }

    Ok(result)
}
