//! Runs a catalog of checks in one of three modes.
//!
//! - **Verify** probes every normal check and stops at the first failure
//!   that is not demoted to a warning.
//! - **Remediate** additionally runs fixes for failing checks, re-probes
//!   once, and evaluates setup-only checks.
//! - **Cleanup** runs every cleanup-only check and reports all failures at
//!   the end.
//!
//! `skip-<suffix>` settings bypass a check entirely; `warn-<suffix>`
//! settings turn its failure into a logged warning. The engine never touches
//! the host itself: every side effect happens inside probe, fix, and cleanup
//! closures.

use std::fmt;
use std::ops::ControlFlow;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::check::{Check, CheckError, CheckFlags, CheckOutcome, CheckRecord};
use crate::config_store::ConfigSource;
use crate::multi_error::MultiError;

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum PreflightError {
    /// A probe failed and the failure could not be repaired.
    #[error("{description}: {source}")]
    CheckFailed {
        /// Check identifier.
        id: String,
        /// Check description.
        description: String,
        /// Manual steps for checks that cannot be fixed automatically.
        guidance: Option<String>,
        /// Probe error.
        source: Box<CheckError>,
    },
    /// A fix returned an error.
    #[error("{fix_description} failed: {source}")]
    RemediationFailed {
        /// Check identifier.
        id: String,
        /// Fix description.
        fix_description: String,
        /// Fix error.
        source: Box<CheckError>,
    },
    /// A fix succeeded but the re-probe still failed.
    #[error("{description} still fails after it was fixed: {source}")]
    FixUnverified {
        /// Check identifier.
        id: String,
        /// Check description.
        description: String,
        /// Re-probe error.
        source: Box<CheckError>,
    },
    /// One or more cleanups failed.
    #[error("cleanup failed:\n{0}")]
    Cleanup(MultiError),
}

impl PreflightError {
    /// Identifier of the check that ended the run, if a single check did.
    #[must_use]
    pub fn check_id(&self) -> Option<&str> {
        match self {
            Self::CheckFailed { id, .. }
            | Self::RemediationFailed { id, .. }
            | Self::FixUnverified { id, .. } => Some(id),
            Self::Cleanup(_) => None,
        }
    }

    /// Manual remediation steps, when available.
    #[must_use]
    pub fn guidance(&self) -> Option<&str> {
        match self {
            Self::CheckFailed { guidance, .. } => guidance.as_deref(),
            _ => None,
        }
    }
}

/// Which entry point a run uses.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RunMode {
    /// Probe only.
    Verify,
    /// Probe, fix, and re-probe.
    Remediate,
    /// Cleanup-only checks.
    Cleanup,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Verify => "verify",
            Self::Remediate => "remediate",
            Self::Cleanup => "cleanup",
        })
    }
}

/// Per-check records of a run and the error that ended it, if any.
#[derive(Debug, Default)]
pub struct PreflightReport {
    /// One record per evaluated check, in execution order.
    pub records: Vec<CheckRecord>,
    /// Error that aborted the run or aggregated cleanup failures.
    pub failure: Option<PreflightError>,
}

impl PreflightReport {
    /// Returns `true` when nothing failed fatally.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Outcome recorded for `id`.
    #[must_use]
    pub fn outcome_of(&self, id: &str) -> Option<CheckOutcome> {
        self.records
            .iter()
            .find(|record| record.id == id)
            .map(|record| record.outcome)
    }

    /// Converts the report into its records or the terminating error.
    ///
    /// # Errors
    ///
    /// Returns the [`PreflightError`] that ended the run.
    pub fn into_result(self) -> Result<Vec<CheckRecord>, PreflightError> {
        match self.failure {
            Some(err) => Err(err),
            None => Ok(self.records),
        }
    }

    fn push(&mut self, check: &Check<'_>, outcome: CheckOutcome, message: Option<String>) {
        self.records.push(CheckRecord {
            id: check.id().to_owned(),
            description: check.description().to_owned(),
            outcome,
            message,
        });
    }
}

/// Evaluates checks against a configuration snapshot.
#[derive(Clone, Copy)]
pub struct ExecutionEngine<'c> {
    config: &'c dyn ConfigSource,
}

impl fmt::Debug for ExecutionEngine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine").finish_non_exhaustive()
    }
}

impl<'c> ExecutionEngine<'c> {
    /// Creates an engine reading `skip-`/`warn-` settings from `config`.
    #[must_use]
    pub const fn new(config: &'c dyn ConfigSource) -> Self {
        Self { config }
    }

    /// Dispatches to [`Self::verify`], [`Self::remediate`], or
    /// [`Self::cleanup`].
    #[must_use]
    pub fn run(&self, mode: RunMode, checks: &[Check<'_>]) -> PreflightReport {
        match mode {
            RunMode::Verify => self.verify(checks),
            RunMode::Remediate => self.remediate(checks),
            RunMode::Cleanup => self.cleanup(checks),
        }
    }

    /// Probes every check that is neither setup-only nor cleanup-only.
    #[must_use]
    pub fn verify(&self, checks: &[Check<'_>]) -> PreflightReport {
        let mut report = PreflightReport::default();
        let selected = checks.iter().filter(|check| {
            !check.flags().contains(CheckFlags::SETUP_ONLY)
                && !check.flags().contains(CheckFlags::CLEANUP_ONLY)
        });
        for check in selected {
            if self.skip(&mut report, check) {
                continue;
            }
            let Err(err) = check.probe() else {
                report.push(check, CheckOutcome::Passed, None);
                continue;
            };
            let failure = PreflightError::CheckFailed {
                id: check.id().to_owned(),
                description: check.description().to_owned(),
                guidance: None,
                source: Box::new(err),
            };
            if self
                .settle(&mut report, check, failure, CheckOutcome::WarnedFailed)
                .is_break()
            {
                break;
            }
        }
        report
    }

    /// Probes every check that is not cleanup-only and runs fixes for the
    /// failing ones. A successful fix is re-probed once.
    #[must_use]
    pub fn remediate(&self, checks: &[Check<'_>]) -> PreflightReport {
        let mut report = PreflightReport::default();
        let selected = checks
            .iter()
            .filter(|check| !check.flags().contains(CheckFlags::CLEANUP_ONLY));
        for check in selected {
            if self.skip(&mut report, check) {
                continue;
            }
            let Err(err) = check.probe() else {
                report.push(check, CheckOutcome::Passed, None);
                continue;
            };
            debug!(check = check.id(), "probe failed: {err}");
            if self.remediate_one(&mut report, check, err).is_break() {
                break;
            }
        }
        report
    }

    /// Runs every cleanup-only check, regardless of earlier failures.
    #[must_use]
    pub fn cleanup(&self, checks: &[Check<'_>]) -> PreflightReport {
        let mut report = PreflightReport::default();
        let mut errors = MultiError::new();
        let selected = checks
            .iter()
            .filter(|check| check.flags().contains(CheckFlags::CLEANUP_ONLY));
        for check in selected {
            info!("{}", check.cleanup_description());
            match check.cleanup() {
                None | Some(Ok(())) => report.push(check, CheckOutcome::Passed, None),
                Some(Err(err)) => {
                    let failure = PreflightError::CheckFailed {
                        id: check.id().to_owned(),
                        description: check.cleanup_description().to_owned(),
                        guidance: None,
                        source: Box::new(err),
                    };
                    warn!("{failure}");
                    report.push(check, CheckOutcome::FatalFailed, Some(failure.to_string()));
                    errors.collect(failure);
                }
            }
        }
        if !errors.is_empty() {
            report.failure = Some(PreflightError::Cleanup(errors));
        }
        report
    }

    fn remediate_one(
        &self,
        report: &mut PreflightReport,
        check: &Check<'_>,
        probe_err: CheckError,
    ) -> ControlFlow<()> {
        if !check.has_fix() {
            let guidance = check.fix_description();
            if !guidance.is_empty() {
                info!("{guidance}");
            }
            let failure = PreflightError::CheckFailed {
                id: check.id().to_owned(),
                description: check.description().to_owned(),
                guidance: (!guidance.is_empty()).then(|| guidance.to_owned()),
                source: Box::new(probe_err),
            };
            return self.settle(report, check, failure, CheckOutcome::WarnedFailed);
        }

        info!("{}", check.fix_description());
        if let Some(Err(fix_err)) = check.fix() {
            let failure = PreflightError::RemediationFailed {
                id: check.id().to_owned(),
                fix_description: check.fix_description().to_owned(),
                source: Box::new(fix_err),
            };
            return self.settle(report, check, failure, CheckOutcome::WarnedFailed);
        }

        match check.probe() {
            Ok(()) => {
                report.push(check, CheckOutcome::Fixed, None);
                ControlFlow::Continue(())
            }
            Err(err) => {
                let failure = PreflightError::FixUnverified {
                    id: check.id().to_owned(),
                    description: check.description().to_owned(),
                    source: Box::new(err),
                };
                self.settle(report, check, failure, CheckOutcome::FixedButUnverified)
            }
        }
    }

    /// Logs the description and records `Skipped` when the skip setting is
    /// on.
    fn skip(&self, report: &mut PreflightReport, check: &Check<'_>) -> bool {
        info!("{}", check.description());
        let skipped = check
            .skip_key()
            .is_some_and(|key| self.config.get_bool(&key));
        if skipped {
            info!("Skipping above check...");
            report.push(check, CheckOutcome::Skipped, None);
        }
        skipped
    }

    /// Applies the warn/fail-fast policy to `failure`. Warned failures are
    /// recorded with `warned` and the run continues; otherwise the failure
    /// ends the run. Unverified fixes keep their outcome either way.
    fn settle(
        &self,
        report: &mut PreflightReport,
        check: &Check<'_>,
        failure: PreflightError,
        warned: CheckOutcome,
    ) -> ControlFlow<()> {
        let message = failure.to_string();
        let is_warned = check
            .warn_key()
            .is_some_and(|key| self.config.get_bool(&key));
        if is_warned {
            warn!("{message}");
            report.push(check, warned, Some(message));
            return ControlFlow::Continue(());
        }
        let outcome = if warned == CheckOutcome::FixedButUnverified {
            CheckOutcome::FixedButUnverified
        } else {
            CheckOutcome::FatalFailed
        };
        report.push(check, outcome, Some(message));
        report.failure = Some(failure);
        ControlFlow::Break(())
    }
}
