//! Check descriptors, flags, and outcomes.

use std::fmt;
use std::ops::BitOr;

use serde::Serialize;
use thiserror::Error;

use crate::artifact::ArtifactError;
use crate::command::CommandError;
use crate::host_fs::FsError;
use crate::multi_error::MultiError;
use crate::remote::RemoteError;

/// Errors raised by probes, fixes, and cleanups.
#[derive(Debug, Error)]
pub enum CheckError {
    /// The host does not satisfy the precondition; the message says why.
    #[error("{0}")]
    PreconditionNotMet(String),
    /// A host command failed.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// A host file could not be accessed.
    #[error(transparent)]
    Fs(#[from] FsError),
    /// A command inside the VM failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// A cached artifact is missing or unusable.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    /// Several independent steps failed.
    #[error(transparent)]
    Aggregate(#[from] MultiError),
}

impl CheckError {
    /// Shorthand for [`CheckError::PreconditionNotMet`].
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionNotMet(message.into())
    }
}

/// Boxed probe, fix, or cleanup.
pub type CheckFn<'a> = Box<dyn Fn() -> Result<(), CheckError> + 'a>;

/// Structural group a check belongs to. Catalogs are ordered by group.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckGroup {
    /// Who is running the tool.
    Identity,
    /// Hypervisor support and its tooling.
    Virtualization,
    /// Host daemons the hypervisor depends on.
    Services,
    /// Host network and DNS plumbing.
    Network,
    /// Cached bundles and binaries.
    Artifacts,
}

/// Execution flags of a check.
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct CheckFlags(u8);

impl CheckFlags {
    /// Participates in verification and remediation.
    pub const NONE: Self = Self(0);
    /// Failures cannot be repaired automatically; remediation only prints
    /// guidance.
    pub const NO_FIX: Self = Self(1);
    /// Only evaluated during remediation.
    pub const SETUP_ONLY: Self = Self(1 << 1);
    /// Only its cleanup runs, and only during cleanup.
    pub const CLEANUP_ONLY: Self = Self(1 << 2);

    /// Returns `true` when every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CheckFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for CheckFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::NO_FIX, "NO_FIX"),
            (Self::SETUP_ONLY, "SETUP_ONLY"),
            (Self::CLEANUP_ONLY, "CLEANUP_ONLY"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();
        if names.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&names.join(" | "))
        }
    }
}

/// A single host precondition: probe, optional fix, optional cleanup.
///
/// Checks borrow the host collaborators their closures use, so a catalog
/// cannot outlive the host it was built for.
pub struct Check<'a> {
    id: String,
    config_key_suffix: String,
    description: String,
    fix_description: String,
    cleanup_description: String,
    group: CheckGroup,
    flags: CheckFlags,
    probe: Option<CheckFn<'a>>,
    fix: Option<CheckFn<'a>>,
    cleanup: Option<CheckFn<'a>>,
}

impl<'a> Check<'a> {
    /// Creates a check identified by `config_key_suffix`, which also names
    /// its `skip-` and `warn-` settings.
    #[must_use]
    pub fn new(
        group: CheckGroup,
        config_key_suffix: &str,
        description: impl Into<String>,
        probe: impl Fn() -> Result<(), CheckError> + 'a,
    ) -> Self {
        Self {
            id: config_key_suffix.to_owned(),
            config_key_suffix: config_key_suffix.to_owned(),
            description: description.into(),
            fix_description: String::new(),
            cleanup_description: String::new(),
            group,
            flags: CheckFlags::NONE,
            probe: Some(Box::new(probe)),
            fix: None,
            cleanup: None,
        }
    }

    /// Creates a check that only participates in cleanup. It has no probe,
    /// no fix, and cannot be skipped or warned.
    #[must_use]
    pub fn cleanup_only(
        group: CheckGroup,
        id: &str,
        cleanup_description: impl Into<String>,
        cleanup: impl Fn() -> Result<(), CheckError> + 'a,
    ) -> Self {
        let description = cleanup_description.into();
        Self {
            id: id.to_owned(),
            config_key_suffix: String::new(),
            description: description.clone(),
            fix_description: String::new(),
            cleanup_description: description,
            group,
            flags: CheckFlags::CLEANUP_ONLY,
            probe: None,
            fix: None,
            cleanup: Some(Box::new(cleanup)),
        }
    }

    /// Attaches an automated fix. Ignored when the check is
    /// [`CheckFlags::NO_FIX`].
    #[must_use]
    pub fn with_fix(
        mut self,
        fix_description: impl Into<String>,
        fix: impl Fn() -> Result<(), CheckError> + 'a,
    ) -> Self {
        self.fix_description = fix_description.into();
        if !self.flags.contains(CheckFlags::NO_FIX) {
            self.fix = Some(Box::new(fix));
        }
        self
    }

    /// Marks the check as not automatically repairable; `guidance` is shown
    /// during remediation instead.
    #[must_use]
    pub fn no_fix(mut self, guidance: impl Into<String>) -> Self {
        self.flags = self.flags | CheckFlags::NO_FIX;
        self.fix_description = guidance.into();
        self.fix = None;
        self
    }

    /// Restricts the check to remediation runs.
    #[must_use]
    pub fn setup_only(mut self) -> Self {
        self.flags = self.flags | CheckFlags::SETUP_ONLY;
        self
    }

    /// Stable identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Suffix of the `skip-` and `warn-` settings; empty when the check is
    /// not configurable.
    #[must_use]
    pub fn config_key_suffix(&self) -> &str {
        &self.config_key_suffix
    }

    /// Progress message shown before the probe runs.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Message shown before the fix runs, or guidance for NO_FIX checks.
    #[must_use]
    pub fn fix_description(&self) -> &str {
        &self.fix_description
    }

    /// Message shown before the cleanup runs.
    #[must_use]
    pub fn cleanup_description(&self) -> &str {
        &self.cleanup_description
    }

    /// Structural group.
    #[must_use]
    pub const fn group(&self) -> CheckGroup {
        self.group
    }

    /// Execution flags.
    #[must_use]
    pub const fn flags(&self) -> CheckFlags {
        self.flags
    }

    /// Setting that skips the check, if the check is configurable.
    #[must_use]
    pub fn skip_key(&self) -> Option<String> {
        (!self.config_key_suffix.is_empty()).then(|| format!("skip-{}", self.config_key_suffix))
    }

    /// Setting that demotes failures to warnings, if the check is
    /// configurable.
    #[must_use]
    pub fn warn_key(&self) -> Option<String> {
        (!self.config_key_suffix.is_empty()).then(|| format!("warn-{}", self.config_key_suffix))
    }

    /// Runs the probe. Cleanup-only checks have none and always pass.
    ///
    /// # Errors
    ///
    /// Returns the probe's [`CheckError`].
    pub fn probe(&self) -> Result<(), CheckError> {
        self.probe.as_ref().map_or(Ok(()), |probe| probe())
    }

    /// Returns `true` when the check carries a fix that remediation may run.
    #[must_use]
    pub const fn has_fix(&self) -> bool {
        !self.flags.contains(CheckFlags::NO_FIX) && self.fix.is_some()
    }

    /// Runs the fix, or returns `None` when the check has no usable fix.
    #[must_use]
    pub fn fix(&self) -> Option<Result<(), CheckError>> {
        if self.flags.contains(CheckFlags::NO_FIX) {
            return None;
        }
        self.fix.as_ref().map(|fix| fix())
    }

    /// Runs the cleanup, or returns `None` when the check has none.
    #[must_use]
    pub fn cleanup(&self) -> Option<Result<(), CheckError>> {
        self.cleanup.as_ref().map(|cleanup| cleanup())
    }
}

impl fmt::Debug for Check<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Check")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("flags", &self.flags)
            .field("description", &self.description)
            .field("has_fix", &self.fix.is_some())
            .field("has_cleanup", &self.cleanup.is_some())
            .finish_non_exhaustive()
    }
}

/// Result of evaluating one check.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckOutcome {
    /// Skipped by configuration.
    Skipped,
    /// Probe passed, or cleanup succeeded.
    Passed,
    /// Probe failed, the fix ran, and the re-probe passed.
    Fixed,
    /// The fix ran but the re-probe still failed.
    FixedButUnverified,
    /// Failed, but the failure was demoted to a warning.
    WarnedFailed,
    /// Failed and stopped the run, or a cleanup failed.
    FatalFailed,
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Skipped => "skipped",
            Self::Passed => "passed",
            Self::Fixed => "fixed",
            Self::FixedButUnverified => "fixed-but-unverified",
            Self::WarnedFailed => "warned",
            Self::FatalFailed => "failed",
        })
    }
}

/// Outcome of one check, as reported to the caller.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CheckRecord {
    /// Check identifier.
    pub id: String,
    /// Check description.
    pub description: String,
    /// What happened.
    pub outcome: CheckOutcome,
    /// Failure or guidance message, when relevant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn no_fix_discards_fix_in_either_order() {
        let calls = Cell::new(0);
        let before = Check::new(CheckGroup::Identity, "check-a", "a", || Ok(()))
            .no_fix("do it by hand")
            .with_fix("fixing", || {
                calls.set(calls.get() + 1);
                Ok(())
            });
        let after = Check::new(CheckGroup::Identity, "check-b", "b", || Ok(()))
            .with_fix("fixing", || {
                calls.set(calls.get() + 1);
                Ok(())
            })
            .no_fix("do it by hand");

        assert!(before.fix().is_none());
        assert!(after.fix().is_none());
        assert_eq!(after.fix_description(), "do it by hand");
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn cleanup_only_checks_are_not_configurable() {
        let check = Check::cleanup_only(CheckGroup::Virtualization, "remove-vm", "Removing VM", || Ok(()));

        assert!(check.flags().contains(CheckFlags::CLEANUP_ONLY));
        assert_eq!(check.skip_key(), None);
        assert_eq!(check.warn_key(), None);
        assert!(check.probe().is_ok());
        assert!(matches!(check.cleanup(), Some(Ok(()))));
    }

    #[test]
    fn configurable_checks_expose_settings() {
        let check = Check::new(CheckGroup::Network, "check-vsock", "vsock", || Ok(()));

        assert_eq!(check.skip_key().as_deref(), Some("skip-check-vsock"));
        assert_eq!(check.warn_key().as_deref(), Some("warn-check-vsock"));
    }

    #[test]
    fn flags_combine() {
        let flags = CheckFlags::NO_FIX | CheckFlags::SETUP_ONLY;
        assert!(flags.contains(CheckFlags::NO_FIX));
        assert!(flags.contains(CheckFlags::SETUP_ONLY));
        assert!(!flags.contains(CheckFlags::CLEANUP_ONLY));
        assert_eq!(format!("{flags:?}"), "NO_FIX | SETUP_ONLY");
    }

    #[test]
    fn groups_are_ordered() {
        assert!(CheckGroup::Identity < CheckGroup::Virtualization);
        assert!(CheckGroup::Virtualization < CheckGroup::Services);
        assert!(CheckGroup::Services < CheckGroup::Network);
        assert!(CheckGroup::Network < CheckGroup::Artifacts);
    }
}
