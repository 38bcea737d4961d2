//! Host command execution.
//!
//! Every side effect the preflight engine has on the host goes through a
//! [`CommandRunner`]. Privileged commands are routed through `sudo` and carry
//! a human-readable reason that is surfaced to the user before escalation.

use std::ffi::OsString;
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info};

/// Name of the privilege escalation helper.
pub const SUDO_BIN: &str = "sudo";

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable representation of the exit status.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised while running host commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command completes with a non-zero exit code.
    #[error("{program} exited with status {status_text}: {stderr}")]
    Failure {
        /// Command name used for the attempted operation.
        program: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when root access is needed but `sudo` is not installed.
    #[error("{SUDO_BIN} is required to {reason} but was not found in PATH")]
    MissingSudo {
        /// Justification that was given for the escalation.
        reason: String,
    },
}

impl CommandError {
    /// Builds a [`CommandError::Failure`] from a finished command.
    #[must_use]
    pub fn failure(program: &str, output: &CommandOutput) -> Self {
        Self::Failure {
            program: program.to_owned(),
            status: output.code,
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        }
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// A non-zero exit status is not an error at this level; callers inspect
    /// [`CommandOutput::is_success`] or use [`CommandRunner::run_checked`].
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError>;

    /// Runs a command whose arguments must not appear in logs.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn run_private(
        &self,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, CommandError> {
        self.run(program, args)
    }

    /// Runs `program` through `sudo`, announcing `reason` first.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when escalation is unavailable or the command
    /// cannot be started.
    fn run_privileged(
        &self,
        reason: &str,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, CommandError> {
        info!("Will use root access: {reason}");
        let mut sudo_args = Vec::with_capacity(args.len() + 1);
        sudo_args.push(OsString::from(program));
        sudo_args.extend(args.iter().cloned());
        self.run(SUDO_BIN, &sudo_args)
    }

    /// Runs a command and converts a non-zero exit into an error.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Failure`] on non-zero exit or
    /// [`CommandError::Spawn`] if the command cannot be started.
    fn run_checked(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let output = self.run(program, args)?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(CommandError::failure(program, &output))
        }
    }

    /// Privileged variant of [`CommandRunner::run_checked`].
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when escalation fails, the command cannot be
    /// started, or it exits with a non-zero status.
    fn run_privileged_checked(
        &self,
        reason: &str,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, CommandError> {
        let output = self.run_privileged(reason, program, args)?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(CommandError::failure(program, &output))
        }
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        (**self).run(program, args)
    }

    fn run_private(
        &self,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, CommandError> {
        (**self).run_private(program, args)
    }

    fn run_privileged(
        &self,
        reason: &str,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, CommandError> {
        (**self).run_privileged(reason, program, args)
    }
}

/// Converts string slices into an owned argument vector.
#[must_use]
pub fn args<I, S>(items: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    items.into_iter().map(Into::into).collect()
}

/// Real command runner that shells out to the host operating system with the
/// C locale so output parsing is stable.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl ProcessCommandRunner {
    fn spawn(program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let output = Command::new(program)
            .args(args)
            .env("LC_ALL", "C")
            .env("LANG", "C")
            .output()
            .map_err(|err| CommandError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.is_success() {
            debug!(
                status = %result.status_text(),
                stdout = %result.stdout,
                stderr = %result.stderr,
                "command {program} failed"
            );
        }
        Ok(result)
    }
}

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let rendered = args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        debug!("Running '{program} {rendered}'");
        Self::spawn(program, args)
    }

    fn run_private(
        &self,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, CommandError> {
        debug!("About to run a hidden command");
        Self::spawn(program, args)
    }

    fn run_privileged(
        &self,
        reason: &str,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, CommandError> {
        let sudo = which::which(SUDO_BIN).map_err(|_| CommandError::MissingSudo {
            reason: reason.to_owned(),
        })?;
        info!("Will use root access: {reason}");
        let mut sudo_args = Vec::with_capacity(args.len() + 1);
        sudo_args.push(OsString::from(program));
        sudo_args.extend(args.iter().cloned());
        self.run(&sudo.to_string_lossy(), &sudo_args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use rstest::rstest;

    #[rstest]
    #[case(Some(0), true)]
    #[case(Some(1), false)]
    #[case(None, false)]
    fn is_success_requires_zero_exit(#[case] code: Option<i32>, #[case] expected: bool) {
        let output = CommandOutput {
            code,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(output.is_success(), expected);
    }

    #[test]
    fn run_privileged_prefixes_sudo_and_records_reason() {
        let runner = ScriptedRunner::new();
        runner.push_success();

        runner
            .run_privileged("Loading kvm module", "modprobe", &args(["kvm"]))
            .expect("privileged run should succeed");

        let invocations = runner.invocations();
        let invocation = invocations.first().expect("expected one invocation");
        assert_eq!(invocation.program, SUDO_BIN);
        assert_eq!(invocation.command_string(), "sudo modprobe kvm");
        assert_eq!(invocation.reason.as_deref(), Some("Loading kvm module"));
    }

    #[test]
    fn run_checked_reports_failure_with_stderr() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(3), "", "boom\n");

        let err = runner
            .run_checked("virsh", &args(["net-info", "crc"]))
            .expect_err("non-zero exit should fail");

        assert_eq!(
            err,
            CommandError::Failure {
                program: String::from("virsh"),
                status: Some(3),
                status_text: String::from("3"),
                stderr: String::from("boom"),
            }
        );
    }
}
