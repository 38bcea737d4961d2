//! Cluster configuration loading via `ortho-config`.

use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::proxy::{ProxyConfig, ProxyError, validate_proxy_url};
use crate::remote::expand_tilde;

/// Default machine name of the cluster VM.
pub const DEFAULT_VM_NAME: &str = "crc";
/// Default state directory, relative to the home directory.
pub const DEFAULT_STATE_DIR: &str = "~/.nodeprep";
/// Minimum number of vCPUs the cluster needs.
pub const MIN_CPUS: u32 = 4;
/// Minimum memory in MiB the cluster needs.
pub const MIN_MEMORY_MIB: u32 = 9216;
/// Minimum disk size in GiB the cluster needs.
pub const MIN_DISK_GIB: u32 = 31;

/// How the VM reaches the network.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum NetworkMode {
    /// A libvirt/NetworkManager managed virtual network with host DNS
    /// integration.
    #[default]
    System,
    /// User-mode networking over vsock; no host network plumbing.
    User,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::System => "system",
            Self::User => "user",
        })
    }
}

impl FromStr for NetworkMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "system" | "default" => Ok(Self::System),
            "user" | "vsock" => Ok(Self::User),
            other => Err(ConfigError::Invalid(format!(
                "network mode '{other}' is not supported: set NODEPREP_NETWORK_MODE or network_mode in nodeprep.toml to 'system' or 'user'"
            ))),
        }
    }
}

/// Cluster settings derived from environment variables and configuration
/// files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "NODEPREP",
    discovery(
        app_name = "nodeprep",
        env_var = "NODEPREP_CONFIG_PATH",
        config_file_name = "nodeprep.toml",
        dotfile_name = ".nodeprep.toml",
        project_file_name = "nodeprep.toml"
    )
)]
pub struct ClusterConfig {
    /// Network mode, `system` or `user`.
    #[ortho_config(default = "system".to_owned())]
    pub network_mode: String,
    /// Name of the cluster VM.
    #[ortho_config(default = DEFAULT_VM_NAME.to_owned())]
    pub vm_name: String,
    /// State directory holding the cache, machines, and binaries. Supports
    /// tilde expansion.
    #[ortho_config(default = DEFAULT_STATE_DIR.to_owned())]
    pub state_dir: String,
    /// Local bundle archive installed into the cache by `setup`.
    pub bundle_path: Option<String>,
    /// Local machine driver binary installed into the cache by `setup`.
    pub driver_source: Option<String>,
    /// Number of vCPUs given to the VM.
    #[ortho_config(default = 4)]
    pub cpus: u32,
    /// VM memory in MiB.
    #[ortho_config(default = 9216)]
    pub memory: u32,
    /// VM disk size in GiB.
    #[ortho_config(default = 31)]
    pub disk_size: u32,
    /// Proxy for plain HTTP traffic.
    pub http_proxy: Option<String>,
    /// Proxy for HTTPS traffic.
    pub https_proxy: Option<String>,
    /// Comma-separated hosts that bypass the proxy.
    pub no_proxy: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl ClusterConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to nodeprep.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    fn require_minimum(value: u32, minimum: u32, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value < minimum {
            return Err(ConfigError::Invalid(format!(
                "{} must be at least {minimum}, got {value}: set {} or {} in nodeprep.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("nodeprep")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Parsed network mode.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown modes.
    pub fn network_mode(&self) -> Result<NetworkMode, ConfigError> {
        self.network_mode.parse()
    }

    /// State directory with `~/` expanded.
    #[must_use]
    pub fn state_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.state_dir))
    }

    /// Directory holding cached bundles and drivers.
    #[must_use]
    pub fn cache_dir(&self) -> Utf8PathBuf {
        self.state_dir().join("cache")
    }

    /// Directory holding helper binaries such as `oc` and the driver.
    #[must_use]
    pub fn bin_dir(&self) -> Utf8PathBuf {
        self.state_dir().join("bin")
    }

    /// Directory holding per-machine state.
    #[must_use]
    pub fn machines_dir(&self) -> Utf8PathBuf {
        self.state_dir().join("machines")
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that fix the problem.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a field is empty or out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network_mode()?;
        Self::require_field(
            &self.vm_name,
            &FieldMetadata::new("VM name", "NODEPREP_VM_NAME", "vm_name"),
        )?;
        Self::require_field(
            &self.state_dir,
            &FieldMetadata::new("state directory", "NODEPREP_STATE_DIR", "state_dir"),
        )?;
        Self::require_minimum(
            self.cpus,
            MIN_CPUS,
            &FieldMetadata::new("CPU count", "NODEPREP_CPUS", "cpus"),
        )?;
        Self::require_minimum(
            self.memory,
            MIN_MEMORY_MIB,
            &FieldMetadata::new("memory (MiB)", "NODEPREP_MEMORY", "memory"),
        )?;
        Self::require_minimum(
            self.disk_size,
            MIN_DISK_GIB,
            &FieldMetadata::new("disk size (GiB)", "NODEPREP_DISK_SIZE", "disk_size"),
        )?;
        Self::require_proxy_url(
            self.http_proxy.as_deref(),
            &FieldMetadata::new("HTTP proxy", "NODEPREP_HTTP_PROXY", "http_proxy"),
        )?;
        Self::require_proxy_url(
            self.https_proxy.as_deref(),
            &FieldMetadata::new("HTTPS proxy", "NODEPREP_HTTPS_PROXY", "https_proxy"),
        )?;
        Ok(())
    }

    fn require_proxy_url(value: Option<&str>, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        validate_proxy_url(value.unwrap_or_default()).map_err(|err| {
            ConfigError::Invalid(format!(
                "{}: {err}: set {} or {} in nodeprep.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            ))
        })
    }

    /// Resolves the proxy settings for the cluster, falling back to the
    /// conventional proxy environment variables for unset fields.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] when a resolved URL is unusable.
    pub fn proxy_config(&self) -> Result<ProxyConfig, ProxyError> {
        ProxyConfig::new(
            self.http_proxy.as_deref().unwrap_or_default(),
            self.https_proxy.as_deref().unwrap_or_default(),
            self.no_proxy.as_deref().unwrap_or_default(),
            None,
        )
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
