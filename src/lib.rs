//! Host readiness and cluster convergence for a local single-node virtual
//! cluster.
//!
//! The crate has two halves. The [`preflight`] engine validates and repairs
//! host preconditions (virtualization, group membership, network and DNS
//! plumbing, cached artifacts) through declarative checks. The [`remote`]
//! module holds the convergence operations used after the VM boots: waiting
//! for SSH and API resources, certificate checks, pod draining, and
//! propagating configuration across several targets. Both halves share the
//! [`retry`] policy and [`multi_error`] aggregation.

pub mod artifact;
pub mod command;
pub mod config;
pub mod config_store;
pub mod host_fs;
pub mod multi_error;
pub mod preflight;
pub mod proxy;
pub mod remote;
pub mod retry;
pub mod test_support;

pub use artifact::{ArtifactCache, ArtifactError, LocalArtifactCache, VersionProbe};
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ClusterConfig, ConfigError, NetworkMode};
pub use config_store::{ConfigSource, ConfigStore, ConfigStoreError, SettingValue};
pub use multi_error::MultiError;
pub use preflight::{
    Check, CheckContext, CheckError, CheckOutcome, ExecutionEngine, Host, HostPaths,
    PreflightError, PreflightReport, RunMode, all_preflight_checks, preflight_checks,
    setting_keys,
};
pub use proxy::{ProxyConfig, ProxyError};
pub use remote::{ClusterBootstrap, ClusterError, OcClient, RemoteError, SshConfig, SshRunner};
pub use retry::{RetryError, RetryPolicy, Sleeper, ThreadSleeper, retry_after};
