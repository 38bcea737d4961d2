//! BDD scenarios for the preflight execution engine.

use rstest_bdd_macros::scenario;

use super::test_helpers::{PreflightWorld, preflight_world};

#[scenario(
    path = "tests/features/preflight.feature",
    name = "Verification stops at the first fatal failure"
)]
fn scenario_verify_fail_fast(preflight_world: PreflightWorld) {
    drop(preflight_world);
}

#[scenario(
    path = "tests/features/preflight.feature",
    name = "Remediation repairs a fixable check"
)]
fn scenario_remediate_fixes(preflight_world: PreflightWorld) {
    drop(preflight_world);
}

#[scenario(
    path = "tests/features/preflight.feature",
    name = "A fix that does not take is reported as unverified"
)]
fn scenario_fix_unverified(preflight_world: PreflightWorld) {
    drop(preflight_world);
}

#[scenario(
    path = "tests/features/preflight.feature",
    name = "A warned failure does not stop the run"
)]
fn scenario_warned_failure(preflight_world: PreflightWorld) {
    drop(preflight_world);
}

#[scenario(
    path = "tests/features/preflight.feature",
    name = "Skipped checks are never probed"
)]
fn scenario_skip(preflight_world: PreflightWorld) {
    drop(preflight_world);
}

#[scenario(
    path = "tests/features/preflight.feature",
    name = "Cleanup attempts every step and aggregates failures"
)]
fn scenario_cleanup_aggregates(preflight_world: PreflightWorld) {
    drop(preflight_world);
}
