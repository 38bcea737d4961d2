//! SSH transport to the cluster VM.
//!
//! Commands are executed through the system `ssh` client with OpenSSH
//! connection multiplexing, so the first command opens the master connection
//! and later commands in the same run reuse it.

use std::ffi::OsString;

use camino::Utf8PathBuf;
use tracing::debug;

use super::{PRIVATE_COMMAND, RemoteError, RemoteRunner, expand_tilde};
use crate::command::{CommandOutput, CommandRunner};

/// Default login user inside the VM.
pub const DEFAULT_SSH_USER: &str = "core";

/// Connection settings for the VM.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshConfig {
    /// Client binary, normally `ssh`.
    pub ssh_bin: String,
    /// Remote login user.
    pub user: String,
    /// VM address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Private key used for authentication; `~/` is expanded.
    pub identity_file: Option<String>,
    /// Socket used for connection multiplexing. Multiplexing is disabled when
    /// unset.
    pub control_path: Option<Utf8PathBuf>,
    /// Seconds before a connection attempt is abandoned.
    pub connect_timeout_secs: u32,
}

impl SshConfig {
    /// Creates a configuration for `host:port` with default settings.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            user: String::from(DEFAULT_SSH_USER),
            host: host.into(),
            port,
            identity_file: None,
            control_path: None,
            connect_timeout_secs: 10,
        }
    }
}

/// [`RemoteRunner`] backed by the system SSH client.
#[derive(Clone, Debug)]
pub struct SshRunner<R: CommandRunner> {
    config: SshConfig,
    runner: R,
}

impl<R: CommandRunner> SshRunner<R> {
    /// Creates a runner that executes the client through `runner`.
    #[must_use]
    pub const fn new(config: SshConfig, runner: R) -> Self {
        Self { config, runner }
    }

    /// Returns the connection settings.
    #[must_use]
    pub const fn config(&self) -> &SshConfig {
        &self.config
    }

    fn common_ssh_options(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.config.port.to_string()),
        ];

        if let Some(identity_file) = &self.config.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
            args.push(OsString::from("-o"));
            args.push(OsString::from("IdentitiesOnly=yes"));
        }

        for option in [
            String::from("BatchMode=yes"),
            String::from("StrictHostKeyChecking=no"),
            String::from("UserKnownHostsFile=/dev/null"),
            String::from("LogLevel=ERROR"),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
        ] {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }

        if let Some(control_path) = &self.config.control_path {
            for option in [
                String::from("ControlMaster=auto"),
                format!("ControlPath={control_path}"),
                String::from("ControlPersist=60"),
            ] {
                args.push(OsString::from("-o"));
                args.push(OsString::from(option));
            }
        }

        args
    }

    fn build_ssh_args(&self, command: &str) -> Vec<OsString> {
        let mut args = self.common_ssh_options();
        args.push(OsString::from(format!(
            "{}@{}",
            self.config.user, self.config.host
        )));
        args.push(OsString::from(command));
        args
    }

    fn finish(display: &str, output: CommandOutput) -> Result<String, RemoteError> {
        if output.is_success() {
            Ok(output.stdout)
        } else {
            Err(RemoteError::Failure {
                command: display.to_owned(),
                status: output.code,
                status_text: output.status_text(),
                stderr: output.stderr.trim().to_owned(),
            })
        }
    }
}

impl<R: CommandRunner> RemoteRunner for SshRunner<R> {
    fn run(&self, command: &str) -> Result<String, RemoteError> {
        debug!("Running SSH command: {command}");
        let output = self
            .runner
            .run(&self.config.ssh_bin, &self.build_ssh_args(command))?;
        debug!(stdout = %output.stdout, stderr = %output.stderr, "SSH command finished");
        Self::finish(command, output)
    }

    fn run_private(&self, command: &str) -> Result<String, RemoteError> {
        debug!("Running private SSH command");
        let output = self
            .runner
            .run_private(&self.config.ssh_bin, &self.build_ssh_args(command))?;
        Self::finish(PRIVATE_COMMAND, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use rstest::{fixture, rstest};

    #[fixture]
    fn config() -> SshConfig {
        SshConfig {
            identity_file: Some(String::from("/keys/id_ecdsa")),
            control_path: Some(Utf8PathBuf::from("/tmp/nodeprep-ssh.sock")),
            ..SshConfig::new("192.168.130.11", 22)
        }
    }

    #[rstest]
    fn run_builds_multiplexed_ssh_invocation(config: SshConfig) {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "ok\n", "");
        let ssh = SshRunner::new(config, runner.clone());

        let stdout = ssh.run("exit 0").expect("command should succeed");

        assert_eq!(stdout, "ok\n");
        let invocations = runner.invocations();
        let command = invocations.first().expect("one invocation").command_string();
        assert!(command.starts_with("ssh -p 22 -i /keys/id_ecdsa"));
        assert!(command.contains("-o ControlMaster=auto"));
        assert!(command.contains("-o ControlPath=/tmp/nodeprep-ssh.sock"));
        assert!(command.ends_with("core@192.168.130.11 exit 0"));
    }

    #[rstest]
    fn private_failures_hide_the_command(config: SshConfig) {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(1), "", "permission denied");
        let ssh = SshRunner::new(config, runner.clone());

        let err = ssh
            .run_private("echo secret | sudo tee /etc/x")
            .expect_err("command should fail");

        assert!(!err.to_string().contains("secret"));
        assert_eq!(err.stderr(), Some("permission denied"));
        let invocations = runner.invocations();
        assert!(invocations.first().expect("one invocation").private);
    }

    #[rstest]
    fn transport_spawn_failure_is_a_command_error(config: SshConfig) {
        let runner = ScriptedRunner::new();
        let ssh = SshRunner::new(config, runner);

        let err = ssh.run("exit 0").expect_err("no scripted response");
        assert!(matches!(err, RemoteError::Command(_)));
    }
}
