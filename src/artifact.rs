//! Cached host artifacts such as the machine driver binary and the cluster
//! bundle.
//!
//! Downloading is handled elsewhere; the local cache only verifies presence
//! (and optionally the reported version) and installs from a local source.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use thiserror::Error;
use tracing::{debug, info};

use crate::command::{CommandError, CommandRunner};
use crate::host_fs::{self, FsError};

/// Errors raised while inspecting or populating the artifact cache.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ArtifactError {
    /// Raised when the artifact is absent from the cache.
    #[error("{name} is not cached at {path}")]
    NotCached {
        /// Artifact name.
        name: String,
        /// Expected cache location.
        path: Utf8PathBuf,
    },
    /// Raised when no source is configured for a missing artifact.
    #[error("{name} is not cached at {path} and no source is configured")]
    MissingSource {
        /// Artifact name.
        name: String,
        /// Expected cache location.
        path: Utf8PathBuf,
    },
    /// Raised when the cached artifact reports an unexpected version.
    #[error("{name} version mismatch: expected: {expected} but got: {current}")]
    VersionMismatch {
        /// Artifact name.
        name: String,
        /// Version the caller requires.
        expected: String,
        /// Version reported by the cached artifact.
        current: String,
    },
    /// Raised when copying the artifact into the cache fails.
    #[error("failed to install {name} into {path}: {message}")]
    Install {
        /// Artifact name.
        name: String,
        /// Destination path.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when querying the artifact version fails.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when inspecting the cache directory fails.
    #[error(transparent)]
    Fs(#[from] FsError),
}

/// Presence check and population of a single cached artifact.
pub trait ArtifactCache {
    /// Returns `Ok(())` when the artifact is present and usable.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError`] describing why the artifact is unusable.
    fn is_cached(&self) -> Result<(), ArtifactError>;

    /// Installs the artifact when [`ArtifactCache::is_cached`] fails.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError`] when the artifact cannot be installed.
    fn ensure_cached(&self) -> Result<(), ArtifactError>;
}

/// Version requirement checked by running the cached binary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionProbe {
    /// Arguments that make the binary print its version.
    pub args: Vec<OsString>,
    /// Version string the output must contain.
    pub expected: String,
}

/// Artifact stored as a single file inside a cache directory.
#[derive(Debug)]
pub struct LocalArtifactCache<R: CommandRunner> {
    runner: R,
    name: String,
    destination: Utf8PathBuf,
    source: Option<Utf8PathBuf>,
    version: Option<VersionProbe>,
}

impl<R: CommandRunner> LocalArtifactCache<R> {
    /// Creates a cache entry for `name` stored under `cache_dir`.
    #[must_use]
    pub fn new(runner: R, name: impl Into<String>, cache_dir: &Utf8Path) -> Self {
        let artifact = name.into();
        let destination = cache_dir.join(&artifact);
        Self {
            runner,
            name: artifact,
            destination,
            source: None,
            version: None,
        }
    }

    /// Sets the local file the artifact is installed from.
    #[must_use]
    pub fn with_source(mut self, source: Option<Utf8PathBuf>) -> Self {
        self.source = source;
        self
    }

    /// Requires the cached binary to report `probe.expected`.
    #[must_use]
    pub fn with_version(mut self, probe: VersionProbe) -> Self {
        self.version = Some(probe);
        self
    }

    /// Location of the cached artifact.
    #[must_use]
    pub fn destination(&self) -> &Utf8Path {
        &self.destination
    }

    fn check_version(&self) -> Result<(), ArtifactError> {
        let Some(probe) = &self.version else {
            return Ok(());
        };
        let output = self
            .runner
            .run_checked(self.destination.as_str(), &probe.args)?;
        let current = output.stdout.trim();
        if current.contains(&probe.expected) {
            Ok(())
        } else {
            Err(ArtifactError::VersionMismatch {
                name: self.name.clone(),
                expected: probe.expected.clone(),
                current: current.to_owned(),
            })
        }
    }

    fn install(&self, source: &Utf8Path) -> Result<(), ArtifactError> {
        let install_err = |message: String| ArtifactError::Install {
            name: self.name.clone(),
            path: self.destination.clone(),
            message,
        };
        let source_parent = source.parent().unwrap_or_else(|| Utf8Path::new("."));
        let source_name = source
            .file_name()
            .ok_or_else(|| install_err(format!("{source} has no file name")))?;
        let dest_parent = self
            .destination
            .parent()
            .unwrap_or_else(|| Utf8Path::new("."));

        Dir::create_ambient_dir_all(dest_parent, ambient_authority())
            .map_err(|err| install_err(err.to_string()))?;
        let from = Dir::open_ambient_dir(source_parent, ambient_authority())
            .map_err(|err| install_err(err.to_string()))?;
        let to = Dir::open_ambient_dir(dest_parent, ambient_authority())
            .map_err(|err| install_err(err.to_string()))?;
        from.copy(source_name, &to, &self.name)
            .map_err(|err| install_err(err.to_string()))?;
        Ok(())
    }
}

impl<R: CommandRunner> ArtifactCache for LocalArtifactCache<R> {
    fn is_cached(&self) -> Result<(), ArtifactError> {
        if !host_fs::exists(&self.destination)? {
            return Err(ArtifactError::NotCached {
                name: self.name.clone(),
                path: self.destination.clone(),
            });
        }
        self.check_version()
    }

    fn ensure_cached(&self) -> Result<(), ArtifactError> {
        if self.is_cached().is_ok() {
            debug!("{} is already cached at {}", self.name, self.destination);
            return Ok(());
        }
        let source = self
            .source
            .as_deref()
            .ok_or_else(|| ArtifactError::MissingSource {
                name: self.name.clone(),
                path: self.destination.clone(),
            })?;
        info!("Installing {} from {source}", self.name);
        self.install(source)?;
        self.check_version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::args;
    use crate::test_support::ScriptedRunner;
    use tempfile::TempDir;

    fn utf8(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp path")
    }

    #[test]
    fn missing_artifact_without_source_reports_missing() {
        let tmp = TempDir::new().expect("temp dir");
        let cache = LocalArtifactCache::new(ScriptedRunner::new(), "crc-driver-libvirt", &utf8(&tmp));

        let err = cache.ensure_cached().expect_err("nothing to install from");
        assert!(matches!(err, ArtifactError::MissingSource { .. }));
    }

    #[test]
    fn ensure_cached_copies_from_source() {
        let tmp = TempDir::new().expect("temp dir");
        let root = utf8(&tmp);
        let source = root.join("downloads/driver");
        host_fs::write_file(&source, "binary").expect("seed source");
        let cache = LocalArtifactCache::new(ScriptedRunner::new(), "crc-driver-libvirt", &root.join("bin"))
            .with_source(Some(source));

        cache.ensure_cached().expect("install should succeed");

        assert!(cache.is_cached().is_ok());
        assert!(host_fs::content_matches(cache.destination(), "binary").expect("read back"));
    }

    #[test]
    fn version_mismatch_is_reported() {
        let tmp = TempDir::new().expect("temp dir");
        let root = utf8(&tmp);
        host_fs::write_file(&root.join("driver"), "binary").expect("seed cache");
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "0.12.0\n", "");
        let cache = LocalArtifactCache::new(runner, "driver", &root).with_version(VersionProbe {
            args: args(["version"]),
            expected: String::from("0.13.0"),
        });

        let err = cache.is_cached().expect_err("version differs");
        assert_eq!(
            err.to_string(),
            "driver version mismatch: expected: 0.13.0 but got: 0.12.0"
        );
    }
}
