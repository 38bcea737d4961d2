//! Convergence operations used while bootstrapping the cluster after the VM
//! boots.
//!
//! Each wait is a [`RetryPolicy`] with fixed attempt counts. Operations that
//! touch several independent targets collect failures into a [`MultiError`]
//! instead of stopping at the first one.

use std::error::Error as StdError;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ControlPlane, RemoteError, RemoteRunner};
use crate::multi_error::MultiError;
use crate::proxy::{INTERNAL_NO_PROXY, ProxyConfig};
use crate::retry::{RetryError, RetryPolicy, Sleeper, ThreadSleeper};

/// Attempts made while waiting for SSH.
pub const SSH_WAIT_POLICY: RetryPolicy = RetryPolicy::new(60, Duration::from_secs(1));
/// Attempts made while waiting for an API resource type.
pub const RESOURCE_WAIT_POLICY: RetryPolicy = RetryPolicy::new(80, Duration::from_secs(1));
/// Attempts made while draining pod sandboxes.
pub const POD_DRAIN_POLICY: RetryPolicy = RetryPolicy::new(2, Duration::from_secs(2));
/// Attempts made while waiting for the request-header client CA.
pub const CLIENT_CA_WAIT_POLICY: RetryPolicy = RetryPolicy::new(90, Duration::from_secs(2));
/// Attempts made while restarting the API server pods.
pub const APISERVER_RESTART_POLICY: RetryPolicy = RetryPolicy::new(60, Duration::from_secs(1));

const CERT_EXPIRY_COMMAND: &str = r#"date --date="$(sudo openssl x509 -in /var/lib/kubelet/pki/kubelet-client-current.pem -noout -enddate | cut -d= -f 2)" --iso-8601=seconds"#;
const STOP_AND_REMOVE_PODS_COMMAND: &str =
    "bash -c 'sudo crictl stopp $(sudo crictl pods -q) && sudo crictl rmp $(sudo crictl pods -q)'";
const ROOT_PARTITION_COMMAND: &str = "df -B1 --output=size,used,target /sysroot | tail -1";
const CRIO_DROP_IN: &str = "/etc/systemd/system/crio.service.d/10-default-env.conf";
const KUBELET_PULL_SECRET: &str = "/var/lib/kubelet/config.json";
const KUBELET_DROP_IN: &str = "/etc/systemd/system/kubelet.service.d/10-default-env.conf";

/// Deployments that need proxy variables set by hand, as
/// `(deployment, namespace)` pairs.
pub const PROXY_DEPLOYMENTS: [(&str, &str); 3] = [
    ("marketplace-operator", "openshift-marketplace"),
    ("ingress-operator", "openshift-ingress-operator"),
    ("cluster-image-registry-operator", "openshift-image-registry"),
];

/// Validity of the kubelet client certificate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CertExpiry {
    /// The expiry date could not be determined.
    Unknown,
    /// The certificate is still valid.
    NotExpired,
    /// The certificate end date has passed.
    Expired,
}

/// Errors raised by bootstrap operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Raised when a remote command fails.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// Raised when the certificate end date cannot be parsed.
    #[error("failed to parse certificate expiry date {raw:?}: {message}")]
    CertParse {
        /// Raw output of the date query.
        raw: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when the kubelet client certificate has expired.
    #[error("certificates have expired, they were valid till: {valid_till}")]
    CertsExpired {
        /// End date rendered in RFC 2822 form.
        valid_till: String,
    },
    /// Raised when a patch or update of a cluster object fails.
    #[error("failed to {action}: {source}")]
    Update {
        /// Action that was attempted.
        action: String,
        /// Underlying failure.
        #[source]
        source: RemoteError,
    },
    /// Raised when a resource exists but is not populated yet.
    #[error("{what} is not available yet")]
    NotReady {
        /// Missing item.
        what: String,
    },
    /// Raised when `df` output cannot be parsed.
    #[error("failed to parse disk usage from {raw:?}")]
    DiskUsage {
        /// Raw `df` output line.
        raw: String,
    },
    /// Raised when several independent targets fail.
    #[error(transparent)]
    Aggregate(#[from] MultiError),
}

/// Outcome of a certificate validity check.
#[derive(Debug)]
pub struct CertCheck {
    /// Classification of the certificate.
    pub state: CertExpiry,
    /// Error explaining `Unknown` or `Expired` states.
    pub error: Option<ClusterError>,
}

impl CertCheck {
    /// Converts the outcome into a result, failing for anything except
    /// [`CertExpiry::NotExpired`].
    ///
    /// # Errors
    ///
    /// Returns the recorded [`ClusterError`].
    pub fn into_result(self) -> Result<(), ClusterError> {
        self.error.map_or(Ok(()), Err)
    }
}

/// Size and usage of the VM root partition in bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DiskUsage {
    /// Partition size.
    pub size: u64,
    /// Bytes in use.
    pub used: u64,
}

/// Classifies the certificate end date `raw` (RFC 3339) against `now`.
#[must_use]
pub fn classify_cert_expiry(raw: &str, now: DateTime<Utc>) -> CertCheck {
    match DateTime::parse_from_rfc3339(raw.trim()) {
        Err(err) => CertCheck {
            state: CertExpiry::Unknown,
            error: Some(ClusterError::CertParse {
                raw: raw.trim().to_owned(),
                message: err.to_string(),
            }),
        },
        Ok(end) if now >= end.with_timezone(&Utc) => CertCheck {
            state: CertExpiry::Expired,
            error: Some(ClusterError::CertsExpired {
                valid_till: end.to_rfc2822(),
            }),
        },
        Ok(_) => CertCheck {
            state: CertExpiry::NotExpired,
            error: None,
        },
    }
}

/// Runs `op` on every target independently and collects the failures.
///
/// # Errors
///
/// Returns a [`MultiError`] holding one entry per failed target, in target
/// order.
pub fn propagate<T, E, F>(targets: &[T], mut op: F) -> Result<(), MultiError>
where
    E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    F: FnMut(&T) -> Result<(), E>,
{
    targets
        .iter()
        .filter_map(|target| op(target).err())
        .collect::<MultiError>()
        .into_result()
}

fn is_not_ready(err: &RemoteError) -> bool {
    err.stderr().is_some_and(|stderr| {
        stderr.contains("NotFound")
            || stderr.contains("doesn't have a resource type")
            || stderr.contains("connection refused")
            || stderr.contains("Unable to connect to the server")
    })
}

/// Convergence operations against a booted VM.
pub struct ClusterBootstrap<'a, S: RemoteRunner, C: ControlPlane> {
    ssh: &'a S,
    oc: &'a C,
    sleeper: Box<dyn Sleeper + 'a>,
}

impl<'a, S: RemoteRunner, C: ControlPlane> ClusterBootstrap<'a, S, C> {
    /// Creates the operations over the given transports, sleeping on the
    /// current thread between attempts.
    #[must_use]
    pub fn new(ssh: &'a S, oc: &'a C) -> Self {
        Self {
            ssh,
            oc,
            sleeper: Box::new(ThreadSleeper),
        }
    }

    /// Replaces the sleeper used between attempts.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'a) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    /// Waits until `exit 0` succeeds over SSH.
    ///
    /// # Errors
    ///
    /// Returns the last transport error once every attempt failed.
    pub fn wait_for_ssh(&self) -> Result<(), RemoteError> {
        info!("Waiting for SSH to be available");
        SSH_WAIT_POLICY.run_with(self.sleeper.as_ref(), || {
            self.ssh
                .run("exit 0")
                .map(drop)
                .map_err(RetryError::Retriable)
        })
    }

    /// Waits until `oc get <kind>` succeeds.
    ///
    /// Not-found errors, unknown resource types, and an unreachable API
    /// server are retried; anything else stops the wait.
    ///
    /// # Errors
    ///
    /// Returns the fatal error, or the last not-ready error once every
    /// attempt failed.
    pub fn wait_for_resource(&self, kind: &str) -> Result<(), RemoteError> {
        debug!("Waiting for {kind} to be available");
        RESOURCE_WAIT_POLICY.run_with(self.sleeper.as_ref(), || {
            self.oc
                .run_command(&["get", kind])
                .map(drop)
                .map_err(|err| {
                    if is_not_ready(&err) {
                        RetryError::Retriable(err)
                    } else {
                        RetryError::Fatal(err)
                    }
                })
        })
    }

    /// Reads the kubelet client certificate end date from the VM and
    /// classifies it against `now`.
    #[must_use]
    pub fn check_certs_validity(&self, now: DateTime<Utc>) -> CertCheck {
        match self.ssh.run(CERT_EXPIRY_COMMAND) {
            Ok(raw) => classify_cert_expiry(&raw, now),
            Err(err) => CertCheck {
                state: CertExpiry::Unknown,
                error: Some(ClusterError::Remote(err)),
            },
        }
    }

    /// Stops and removes every pod sandbox in the VM.
    ///
    /// # Errors
    ///
    /// Returns the last failure once every attempt failed.
    pub fn stop_and_remove_pods(&self) -> Result<(), RemoteError> {
        POD_DRAIN_POLICY.run_with(self.sleeper.as_ref(), || {
            let output = self
                .ssh
                .run(STOP_AND_REMOVE_PODS_COMMAND)
                .map_err(RetryError::Retriable)?;
            debug!("{output}");
            Ok(())
        })
    }

    /// Waits for `clusterversion` and patches a freshly generated cluster
    /// id. Returns the new id.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the wait or the patch fails.
    pub fn update_cluster_id(&self) -> Result<Uuid, ClusterError> {
        let cluster_id = Uuid::new_v4();
        let patch = json!({"spec": {"clusterID": cluster_id.to_string()}}).to_string();
        self.wait_for_resource("clusterversion")?;
        self.oc
            .run_command(&["patch", "clusterversion", "version", "-p", &patch, "--type", "merge"])
            .map_err(|source| ClusterError::Update {
                action: String::from("update cluster ID"),
                source,
            })?;
        Ok(cluster_id)
    }

    /// Installs the pull secret on the VM disk for the kubelet and in the
    /// `openshift-config/pull-secret` object. The secret only travels over
    /// the private paths of both transports.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the disk write, the wait, or the patch
    /// fails.
    pub fn add_pull_secret(&self, secret: &str) -> Result<(), ClusterError> {
        self.ssh
            .run_private(&format!("cat <<EOF | sudo tee {KUBELET_PULL_SECRET}\n{secret}\nEOF"))?;
        let encoded = STANDARD.encode(secret.as_bytes());
        let patch = json!({"data": {".dockerconfigjson": encoded}}).to_string();
        self.wait_for_resource("secret")?;
        self.oc
            .run_command_private(&[
                "patch",
                "secret",
                "pull-secret",
                "-p",
                &patch,
                "-n",
                "openshift-config",
                "--type",
                "merge",
            ])
            .map_err(|source| ClusterError::Update {
                action: String::from("add pull secret"),
                source,
            })?;
        Ok(())
    }

    /// Patches the cluster-wide proxy object.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the wait or the patch fails.
    pub fn add_proxy_config_to_cluster(&self, proxy: &ProxyConfig) -> Result<(), ClusterError> {
        let patch = json!({
            "spec": {
                "httpProxy": proxy.http_proxy,
                "httpsProxy": proxy.https_proxy,
                "noProxy": proxy.no_proxy_string(),
            }
        })
        .to_string();
        self.wait_for_resource("proxy")?;
        self.oc
            .run_command(&[
                "patch",
                "proxy",
                "cluster",
                "-p",
                &patch,
                "-n",
                "openshift-config",
                "--type",
                "merge",
            ])
            .map_err(|source| ClusterError::Update {
                action: String::from("add proxy details"),
                source,
            })?;
        Ok(())
    }

    /// Sets proxy environment variables on every deployment in
    /// [`PROXY_DEPLOYMENTS`], attempting each one independently.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Aggregate`] listing every deployment that
    /// could not be updated.
    pub fn add_proxy_config_to_deployments(&self, proxy: &ProxyConfig) -> Result<(), ClusterError> {
        self.wait_for_resource("deployment")?;
        let http = format!("HTTP_PROXY={}", proxy.http_proxy);
        let https = format!("HTTPS_PROXY={}", proxy.https_proxy);
        let no_proxy = format!("NO_PROXY={},{INTERNAL_NO_PROXY}", proxy.no_proxy_string());
        propagate(&PROXY_DEPLOYMENTS, |&(deployment, namespace)| {
            debug!("Adding proxy configuration to {namespace}/{deployment}");
            self.oc
                .run_command(&[
                    "set",
                    "env",
                    "deployment",
                    deployment,
                    "-n",
                    namespace,
                    &http,
                    &https,
                    &no_proxy,
                ])
                .map(drop)
                .map_err(|source| ClusterError::Update {
                    action: format!("add proxy details to {deployment} (namespace: {namespace})"),
                    source,
                })
        })?;
        Ok(())
    }

    /// Writes systemd drop-ins carrying the proxy settings for the kubelet
    /// and CRI-O. Both services need a restart afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when a drop-in cannot be written.
    pub fn add_proxy_to_kubelet_and_crio(&self, proxy: &ProxyConfig) -> Result<(), ClusterError> {
        let drop_in = format!(
            "[Service]\nEnvironment=HTTP_PROXY={}\nEnvironment=HTTPS_PROXY={}\nEnvironment=NO_PROXY={INTERNAL_NO_PROXY},{}",
            proxy.http_proxy,
            proxy.https_proxy,
            proxy.no_proxy_string(),
        );
        for path in [CRIO_DROP_IN, KUBELET_DROP_IN] {
            self.ssh
                .run_private(&format!("cat <<EOF | sudo tee {path}\n{drop_in}\nEOF"))?;
        }
        Ok(())
    }

    /// Waits until the request-header client CA is published.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the query fails or the CA never
    /// appears.
    pub fn wait_for_request_header_client_ca(&self) -> Result<(), ClusterError> {
        self.wait_for_resource("configmaps")?;
        CLIENT_CA_WAIT_POLICY.run_with(self.sleeper.as_ref(), || {
            let stdout = self
                .oc
                .run_command(&[
                    "get",
                    "configmaps/extension-apiserver-authentication",
                    "-ojsonpath={.data.requestheader-client-ca-file}",
                    "-n",
                    "kube-system",
                ])
                .map_err(|source| {
                    RetryError::Fatal(ClusterError::Update {
                        action: String::from("get request header client ca file"),
                        source,
                    })
                })?;
            if stdout.is_empty() {
                return Err(RetryError::Retriable(ClusterError::NotReady {
                    what: String::from(".data.requestheader-client-ca-file"),
                }));
            }
            debug!("Found .data.requestheader-client-ca-file: {stdout}");
            Ok(())
        })
    }

    /// Deletes every pod in `openshift-apiserver` so they restart with fresh
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the wait fails or deletion keeps
    /// failing.
    pub fn delete_openshift_apiserver_pods(&self) -> Result<(), ClusterError> {
        self.wait_for_resource("pod")?;
        APISERVER_RESTART_POLICY.run_with(self.sleeper.as_ref(), || {
            self.oc
                .run_command(&["delete", "pod", "--all", "-n", "openshift-apiserver"])
                .map(drop)
                .map_err(|err| RetryError::Retriable(ClusterError::Remote(err)))
        })
    }

    /// Size and usage of the VM root partition.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when `df` fails or its output is malformed.
    pub fn root_partition_usage(&self) -> Result<DiskUsage, ClusterError> {
        let output = self.ssh.run(ROOT_PARTITION_COMMAND)?;
        parse_disk_usage(&output)
    }
}

fn parse_disk_usage(output: &str) -> Result<DiskUsage, ClusterError> {
    let line = output.trim();
    let malformed = || ClusterError::DiskUsage {
        raw: line.to_owned(),
    };
    let mut fields = line.split_whitespace();
    let size = fields
        .next()
        .and_then(|field| field.parse().ok())
        .ok_or_else(malformed)?;
    let used = fields
        .next()
        .and_then(|field| field.parse().ok())
        .ok_or_else(malformed)?;
    Ok(DiskUsage { size, used })
}

#[cfg(test)]
mod tests;
