//! Collaborators the checks act through.

use camino::{Utf8Path, Utf8PathBuf};

use crate::artifact::ArtifactCache;
use crate::command::CommandRunner;
use crate::retry::{Sleeper, ThreadSleeper};

/// Directories owned by the tool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostPaths {
    /// Cached bundles, drivers, and generated files.
    pub cache_dir: Utf8PathBuf,
    /// Helper binaries.
    pub bin_dir: Utf8PathBuf,
    /// Per-machine state.
    pub machines_dir: Utf8PathBuf,
    /// Path of the running executable; capabilities are granted to it.
    pub executable: Utf8PathBuf,
}

/// The host as seen by the checks: a command runner, the tool's
/// directories, and the caches setup populates.
///
/// Absolute system paths such as `/dev/kvm` are resolved through
/// [`Host::path`] so tests can point them at a scratch directory.
pub struct Host<R: CommandRunner> {
    runner: R,
    paths: HostPaths,
    vm_name: String,
    user: String,
    fs_root: Utf8PathBuf,
    driver_cache: Box<dyn ArtifactCache>,
    bundle_cache: Box<dyn ArtifactCache>,
    sleeper: Box<dyn Sleeper>,
}

impl<R: CommandRunner> Host<R> {
    /// Creates a host rooted at `/` that sleeps on the current thread.
    #[must_use]
    pub fn new(
        runner: R,
        paths: HostPaths,
        vm_name: impl Into<String>,
        user: impl Into<String>,
        driver_cache: Box<dyn ArtifactCache>,
        bundle_cache: Box<dyn ArtifactCache>,
    ) -> Self {
        Self {
            runner,
            paths,
            vm_name: vm_name.into(),
            user: user.into(),
            fs_root: Utf8PathBuf::from("/"),
            driver_cache,
            bundle_cache,
            sleeper: Box::new(ThreadSleeper),
        }
    }

    /// Resolves system paths below `root` instead of `/`.
    #[must_use]
    pub fn with_fs_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.fs_root = root.into();
        self
    }

    /// Replaces the sleeper used by in-check waits.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Command runner.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Tool directories.
    #[must_use]
    pub const fn paths(&self) -> &HostPaths {
        &self.paths
    }

    /// Name of the cluster VM.
    #[must_use]
    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    /// Login name of the invoking user.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Machine driver cache.
    #[must_use]
    pub fn driver_cache(&self) -> &dyn ArtifactCache {
        self.driver_cache.as_ref()
    }

    /// Cluster bundle cache.
    #[must_use]
    pub fn bundle_cache(&self) -> &dyn ArtifactCache {
        self.bundle_cache.as_ref()
    }

    /// Sleeper for in-check waits.
    #[must_use]
    pub fn sleeper(&self) -> &dyn Sleeper {
        self.sleeper.as_ref()
    }

    /// Resolves an absolute system path against the filesystem root.
    #[must_use]
    pub fn path(&self, absolute: &str) -> Utf8PathBuf {
        self.fs_root.join(absolute.trim_start_matches('/'))
    }

    /// Filesystem root.
    #[must_use]
    pub fn fs_root(&self) -> &Utf8Path {
        &self.fs_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeArtifactCache, ScriptedRunner};

    fn host(root: &str) -> Host<ScriptedRunner> {
        Host::new(
            ScriptedRunner::new(),
            HostPaths {
                cache_dir: Utf8PathBuf::from("/home/dev/.nodeprep/cache"),
                bin_dir: Utf8PathBuf::from("/home/dev/.nodeprep/bin"),
                machines_dir: Utf8PathBuf::from("/home/dev/.nodeprep/machines"),
                executable: Utf8PathBuf::from("/usr/local/bin/nodeprep"),
            },
            "crc",
            "dev",
            Box::new(FakeArtifactCache::cached()),
            Box::new(FakeArtifactCache::missing()),
        )
        .with_fs_root(root)
    }

    #[test]
    fn system_paths_resolve_against_root() {
        assert_eq!(host("/").path("/dev/kvm"), Utf8PathBuf::from("/dev/kvm"));
        assert_eq!(
            host("/tmp/scratch").path("/etc/hosts"),
            Utf8PathBuf::from("/tmp/scratch/etc/hosts")
        );
    }

    #[test]
    fn exposes_caches() {
        let host = host("/");
        assert!(host.driver_cache().is_cached().is_ok());
        assert!(host.bundle_cache().is_cached().is_err());
        assert_eq!(host.vm_name(), "crc");
        assert_eq!(host.user(), "dev");
    }
}
