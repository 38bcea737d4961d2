//! Host readiness checks and the engine that runs them.
//!
//! [`CheckContext`] captures host facts, [`preflight_checks`] turns them into
//! an ordered catalog of [`Check`]s bound to a [`Host`], and
//! [`ExecutionEngine`] evaluates the catalog in verify, remediate, or cleanup
//! mode.

pub mod catalog;
pub mod check;
pub mod context;
pub mod engine;
pub mod host;

pub use catalog::{all_preflight_checks, preflight_checks, setting_keys};
pub use check::{Check, CheckError, CheckFlags, CheckFn, CheckGroup, CheckOutcome, CheckRecord};
pub use context::{CheckContext, HostOs, OsRelease, ResolverBackend};
pub use engine::{ExecutionEngine, PreflightError, PreflightReport, RunMode};
pub use host::{Host, HostPaths};
