//! Access to the cluster VM and its control plane.
//!
//! [`RemoteRunner`] executes shell commands inside the VM and
//! [`ControlPlane`] runs control-plane client commands bound to a
//! kubeconfig, context, and cluster. [`cluster::ClusterBootstrap`] layers
//! convergence operations on top of both.

pub mod cluster;
pub mod oc;
pub mod ssh;

use thiserror::Error;

use crate::command::CommandError;

pub use cluster::{CertCheck, CertExpiry, ClusterBootstrap, ClusterError, DiskUsage, propagate};
pub use oc::OcClient;
pub use ssh::{SshConfig, SshRunner};

/// Errors raised by remote command execution.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Raised when the local client binary cannot be started.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when a remote command exits with a non-zero status.
    #[error("`{command}` exited with status {status_text}: {stderr}")]
    Failure {
        /// Command as it should appear to the user; private commands are
        /// replaced by a placeholder.
        command: String,
        /// Exit status reported by the client.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the client.
        stderr: String,
    },
}

impl RemoteError {
    /// Stderr of a failed remote command, if any.
    #[must_use]
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Failure { stderr, .. } => Some(stderr),
            Self::Command(_) => None,
        }
    }
}

/// Placeholder used instead of the command text of private commands.
pub const PRIVATE_COMMAND: &str = "<hidden command>";

/// Shell command execution inside the VM.
pub trait RemoteRunner {
    /// Runs `command` and returns its stdout.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the transport fails or the command exits
    /// with a non-zero status.
    fn run(&self, command: &str) -> Result<String, RemoteError>;

    /// Runs `command` without logging it or echoing it in errors.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the transport fails or the command exits
    /// with a non-zero status.
    fn run_private(&self, command: &str) -> Result<String, RemoteError>;
}

/// Control-plane client invocation.
pub trait ControlPlane {
    /// Runs the client with `args` and returns its stdout.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the client cannot be started or exits
    /// with a non-zero status.
    fn run_command(&self, args: &[&str]) -> Result<String, RemoteError>;

    /// Same as [`ControlPlane::run_command`] without logging the arguments.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the client cannot be started or exits
    /// with a non-zero status.
    fn run_command_private(&self, args: &[&str]) -> Result<String, RemoteError>;
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If `HOME` is not set the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use nodeprep::remote::expand_tilde;
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
