//! Control-plane client bound to a kubeconfig, context, and cluster.

use std::ffi::OsString;

use camino::Utf8PathBuf;
use tracing::debug;

use super::{ControlPlane, PRIVATE_COMMAND, RemoteError};
use crate::command::{CommandOutput, CommandRunner};

/// Runs `oc` against a fixed kubeconfig/context/cluster triple.
#[derive(Clone, Debug)]
pub struct OcClient<R: CommandRunner> {
    runner: R,
    oc_bin: Utf8PathBuf,
    kubeconfig: Utf8PathBuf,
    context: String,
    cluster: String,
}

impl<R: CommandRunner> OcClient<R> {
    /// Creates a client invoking `oc_bin`.
    #[must_use]
    pub fn new(
        runner: R,
        oc_bin: Utf8PathBuf,
        kubeconfig: Utf8PathBuf,
        context: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            oc_bin,
            kubeconfig,
            context: context.into(),
            cluster: cluster.into(),
        }
    }

    fn full_args(&self, args: &[&str]) -> Vec<OsString> {
        let mut full: Vec<OsString> = args.iter().map(OsString::from).collect();
        full.extend([
            OsString::from("--kubeconfig"),
            OsString::from(self.kubeconfig.as_str()),
            OsString::from("--context"),
            OsString::from(&self.context),
            OsString::from("--cluster"),
            OsString::from(&self.cluster),
        ]);
        full
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

impl<R: CommandRunner> ControlPlane for OcClient<R> {
    fn run_command(&self, args: &[&str]) -> Result<String, RemoteError> {
        let display = format!("oc {}", args.join(" "));
        let shown = &display;
        debug!("Running '{shown}'");
        let output = self.runner.run(self.oc_bin.as_str(), &self.full_args(args))?;
        Self::finish(&display, output)
    }

    fn run_command_private(&self, args: &[&str]) -> Result<String, RemoteError> {
        let output = self
            .runner
            .run_private(self.oc_bin.as_str(), &self.full_args(args))?;
        Self::finish(PRIVATE_COMMAND, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;

    fn client(runner: ScriptedRunner) -> OcClient<ScriptedRunner> {
        OcClient::new(
            runner,
            Utf8PathBuf::from("/cache/bin/oc"),
            Utf8PathBuf::from("/machines/crc/kubeconfig"),
            "admin",
            "crc",
        )
    }

    #[test]
    fn appends_binding_flags() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "pods\n", "");

        let stdout = client(runner.clone())
            .run_command(&["get", "pods"])
            .expect("command should succeed");

        assert_eq!(stdout, "pods\n");
        let invocations = runner.invocations();
        assert_eq!(
            invocations.first().expect("one invocation").command_string(),
            "/cache/bin/oc get pods --kubeconfig /machines/crc/kubeconfig --context admin --cluster crc"
        );
    }

    #[test]
    fn failure_carries_stderr() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(1), "", "Error from server (NotFound): nope\n");

        let err = client(runner)
            .run_command(&["get", "clusterversion"])
            .expect_err("command should fail");

        assert_eq!(err.stderr(), Some("Error from server (NotFound): nope"));
        assert!(err.to_string().contains("oc get clusterversion"));
    }
}
