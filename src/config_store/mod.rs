//! Persistent preflight settings.
//!
//! Settings live in the `[settings]` table of `nodeprep.toml`, discovered with
//! `OrthoConfig`'s search order. Environment variables named
//! `NODEPREP_<KEY>` (uppercase, `-` replaced by `_`) take precedence over the
//! file when a snapshot is taken.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::ConfigDiscovery;
use thiserror::Error;

use ortho_config::toml;

const APP_NAME: &str = "nodeprep";
const CONFIG_ENV_VAR: &str = "NODEPREP_CONFIG_PATH";
const CONFIG_FILE_NAME: &str = "nodeprep.toml";
const DOTFILE_NAME: &str = ".nodeprep.toml";
const PROJECT_FILE_NAME: &str = "nodeprep.toml";
const SETTINGS_SECTION: &str = "settings";

/// Prefix of environment variables overriding settings.
pub const ENV_PREFIX: &str = "NODEPREP_";

/// Errors raised while reading or updating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigStoreError {
    /// Raised when no configuration candidates are available.
    #[error("no configuration file candidates were discovered")]
    NoCandidates,
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when parsing existing TOML content fails.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when existing TOML has an unexpected structure.
    #[error("invalid configuration in {path}: {message}")]
    InvalidStructure {
        /// Path that had invalid content.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Value of a single setting.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SettingValue {
    /// Boolean flag such as `skip-check-kvm-enabled`.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Free-form string.
    String(String),
}

impl SettingValue {
    /// Interprets a command-line or environment value: booleans first, then
    /// integers, otherwise a string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" => return Self::Bool(true),
            "false" | "no" | "off" => return Self::Bool(false),
            _ => {}
        }
        trimmed
            .parse::<i64>()
            .map_or_else(|_| Self::String(trimmed.to_owned()), Self::Int)
    }

    /// Boolean interpretation; `1` counts as true and `0` as false.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Int(1) => Some(true),
            Self::Int(0) => Some(false),
            Self::Int(_) | Self::String(_) => None,
        }
    }

    fn from_toml(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::Boolean(flag) => Some(Self::Bool(*flag)),
            toml::Value::Integer(number) => Some(Self::Int(*number)),
            toml::Value::String(text) => Some(Self::String(text.clone())),
            _ => None,
        }
    }

    fn to_toml(&self) -> toml::Value {
        match self {
            Self::Bool(flag) => toml::Value::Boolean(*flag),
            Self::Int(number) => toml::Value::Integer(*number),
            Self::String(text) => toml::Value::String(text.clone()),
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(flag) => write!(f, "{flag}"),
            Self::Int(number) => write!(f, "{number}"),
            Self::String(text) => f.write_str(text),
        }
    }
}

/// Read-only access to settings consulted by the preflight engine.
pub trait ConfigSource {
    /// Boolean setting; absent or non-boolean values read as `false`.
    fn get_bool(&self, key: &str) -> bool;

    /// String setting.
    fn get_string(&self, key: &str) -> Option<String>;

    /// Integer setting.
    fn get_int(&self, key: &str) -> Option<i64>;
}

/// Name of the environment variable overriding `key`.
#[must_use]
pub fn env_var_for(key: &str) -> String {
    format!("{ENV_PREFIX}{}", key.to_ascii_uppercase().replace('-', "_"))
}

/// Immutable view of the settings at one point in time.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SettingsSnapshot {
    values: BTreeMap<String, SettingValue>,
}

impl SettingsSnapshot {
    /// Builds a snapshot from file settings overlaid with environment
    /// overrides for every key in `known_keys`.
    #[must_use]
    pub fn from_sources<I>(file: BTreeMap<String, SettingValue>, known_keys: &[String], env_vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let overrides: BTreeMap<String, String> = env_vars.into_iter().collect();
        let mut values = file;
        for key in known_keys {
            if let Some(raw) = overrides.get(&env_var_for(key)) {
                values.insert(key.clone(), SettingValue::parse(raw));
            }
        }
        Self { values }
    }

    /// Returns the raw value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.values.get(key)
    }
}

impl ConfigSource for SettingsSnapshot {
    fn get_bool(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(SettingValue::as_bool)
            .unwrap_or(false)
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.values.get(key).map(ToString::to_string)
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(SettingValue::Int(number)) => Some(*number),
            _ => None,
        }
    }
}

/// Reads and updates `nodeprep.toml` using `OrthoConfig`'s discovery search
/// order.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    discovery: ConfigDiscovery,
    explicit_path: Option<Utf8PathBuf>,
}

impl ConfigStore {
    /// Builds a config store using the standard discovery settings. When
    /// `NODEPREP_CONFIG_PATH` is set, that file is used directly.
    #[must_use]
    pub fn new() -> Self {
        Self {
            discovery: ConfigDiscovery::builder(APP_NAME)
                .env_var(CONFIG_ENV_VAR)
                .config_file_name(CONFIG_FILE_NAME)
                .dotfile_name(DOTFILE_NAME)
                .project_file_name(PROJECT_FILE_NAME)
                .build(),
            explicit_path: env::var(CONFIG_ENV_VAR)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(Utf8PathBuf::from),
        }
    }

    /// Builds a config store using an explicit discovery configuration.
    #[must_use]
    pub const fn with_discovery(discovery: ConfigDiscovery) -> Self {
        Self {
            discovery,
            explicit_path: None,
        }
    }

    fn resolve_target(&self) -> Result<ConfigTarget, ConfigStoreError> {
        if let Some(path) = &self.explicit_path {
            return Ok(ConfigTarget {
                path: path.clone(),
                exists: path_exists(path)?,
            });
        }

        let candidates = self.discovery.utf8_candidates();
        if candidates.is_empty() {
            return Err(ConfigStoreError::NoCandidates);
        }

        for candidate in &candidates {
            if path_exists(candidate)? {
                return Ok(ConfigTarget {
                    path: candidate.clone(),
                    exists: true,
                });
            }
        }

        let fallback = candidates
            .last()
            .cloned()
            .ok_or(ConfigStoreError::NoCandidates)?;
        Ok(ConfigTarget {
            path: fallback,
            exists: false,
        })
    }

    fn load_document(&self) -> Result<(ConfigTarget, toml::Value), ConfigStoreError> {
        let target = self.resolve_target()?;
        let contents = if target.exists {
            read_config(&target.path)?
        } else {
            String::new()
        };
        let value = parse_toml(&target.path, &contents)?;
        Ok((target, value))
    }

    /// Path settings are read from and written to.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError`] when no candidate path exists.
    pub fn path(&self) -> Result<Utf8PathBuf, ConfigStoreError> {
        self.resolve_target().map(|target| target.path)
    }

    /// Settings stored in the file, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError`] when the file cannot be read or parsed.
    pub fn file_settings(&self) -> Result<BTreeMap<String, SettingValue>, ConfigStoreError> {
        let (target, value) = self.load_document()?;
        read_settings(&target.path, &value)
    }

    /// Takes a snapshot of file settings overlaid with environment overrides
    /// for `known_keys`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError`] when the file cannot be read or parsed.
    pub fn snapshot(&self, known_keys: &[String]) -> Result<SettingsSnapshot, ConfigStoreError> {
        Ok(SettingsSnapshot::from_sources(
            self.file_settings()?,
            known_keys,
            env::vars(),
        ))
    }

    /// Persists `key = value` and returns the file written.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError`] when reading or writing the file fails.
    pub fn set(&self, key: &str, value: &SettingValue) -> Result<Utf8PathBuf, ConfigStoreError> {
        let (target, mut document) = self.load_document()?;
        settings_table_mut(&target.path, &mut document)?.insert(key.to_owned(), value.to_toml());
        write_config(&target.path, &document)?;
        Ok(target.path)
    }

    /// Removes `key`. Returns `false` when it was not set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError`] when reading or writing the file fails.
    pub fn unset(&self, key: &str) -> Result<bool, ConfigStoreError> {
        let (target, mut document) = self.load_document()?;
        if !target.exists {
            return Ok(false);
        }
        let removed = settings_table_mut(&target.path, &mut document)?
            .remove(key)
            .is_some();
        if removed {
            write_config(&target.path, &document)?;
        }
        Ok(removed)
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
struct ConfigTarget {
    path: Utf8PathBuf,
    exists: bool,
}

fn invalid(path: &Utf8Path, message: impl Into<String>) -> ConfigStoreError {
    ConfigStoreError::InvalidStructure {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn path_exists(path: &Utf8Path) -> Result<bool, ConfigStoreError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| invalid(path, "configuration file path is missing a filename"))?;

    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir
            .try_exists(file_name)
            .map_err(|err| ConfigStoreError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ConfigStoreError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        }),
    }
}

fn read_config(path: &Utf8Path) -> Result<String, ConfigStoreError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| invalid(path, "configuration file path is missing a filename"))?;

    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| ConfigStoreError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        })?;

    dir.read_to_string(file_name)
        .map_err(|err| ConfigStoreError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

fn parse_toml(path: &Utf8Path, contents: &str) -> Result<toml::Value, ConfigStoreError> {
    if contents.trim().is_empty() {
        return Ok(toml::Value::Table(toml::value::Table::new()));
    }

    toml::from_str(contents).map_err(|err| ConfigStoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn read_settings(
    path: &Utf8Path,
    value: &toml::Value,
) -> Result<BTreeMap<String, SettingValue>, ConfigStoreError> {
    let table = value
        .as_table()
        .ok_or_else(|| invalid(path, "configuration root is not a table"))?;

    let Some(section) = table.get(SETTINGS_SECTION) else {
        return Ok(BTreeMap::new());
    };

    let section_table = section
        .as_table()
        .ok_or_else(|| invalid(path, format!("[{SETTINGS_SECTION}] must be a table")))?;

    section_table
        .iter()
        .map(|(key, raw)| {
            SettingValue::from_toml(raw)
                .map(|setting| (key.clone(), setting))
                .ok_or_else(|| {
                    invalid(
                        path,
                        format!("{SETTINGS_SECTION}.{key} must be a boolean, integer, or string"),
                    )
                })
        })
        .collect()
}

fn settings_table_mut<'doc>(
    path: &Utf8Path,
    value: &'doc mut toml::Value,
) -> Result<&'doc mut toml::value::Table, ConfigStoreError> {
    let table = value
        .as_table_mut()
        .ok_or_else(|| invalid(path, "configuration root is not a table"))?;

    table
        .entry(String::from(SETTINGS_SECTION))
        .or_insert_with(|| toml::Value::Table(toml::value::Table::new()))
        .as_table_mut()
        .ok_or_else(|| invalid(path, format!("[{SETTINGS_SECTION}] must be a table")))
}

fn write_config(path: &Utf8Path, value: &toml::Value) -> Result<(), ConfigStoreError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| {
        ConfigStoreError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        }
    })?;

    let file_name = path
        .file_name()
        .ok_or_else(|| invalid(path, "configuration file path is missing a filename"))?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| ConfigStoreError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        })?;

    let rendered = toml::to_string_pretty(value).map_err(|err| ConfigStoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    dir.write(file_name, rendered)
        .map_err(|err| ConfigStoreError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}
