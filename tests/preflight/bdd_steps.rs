//! BDD step definitions for the preflight execution engine.

use nodeprep::{CheckOutcome, PreflightError, RunMode};
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{Behaviour, PreflightWorld};

#[given("a healthy check \"{id}\"")]
fn healthy_check(preflight_world: &PreflightWorld, id: String) {
    preflight_world.add_check(&id, Behaviour::Healthy);
}

#[given("a fixable check \"{id}\" that is broken")]
fn fixable_check(preflight_world: &PreflightWorld, id: String) {
    preflight_world.add_check(&id, Behaviour::Fixable);
}

#[given("a check \"{id}\" whose fix has no effect")]
fn ineffective_fix_check(preflight_world: &PreflightWorld, id: String) {
    preflight_world.add_check(&id, Behaviour::IneffectiveFix);
}

#[given("a check \"{id}\" that cannot be fixed")]
fn unfixable_check(preflight_world: &PreflightWorld, id: String) {
    preflight_world.add_check(&id, Behaviour::Unfixable);
}

#[given("a cleanup step \"{id}\" that succeeds")]
fn succeeding_cleanup(preflight_world: &PreflightWorld, id: String) {
    preflight_world.add_check(&id, Behaviour::Cleanup { succeeds: true });
}

#[given("a cleanup step \"{id}\" that fails")]
fn failing_cleanup(preflight_world: &PreflightWorld, id: String) {
    preflight_world.add_check(&id, Behaviour::Cleanup { succeeds: false });
}

#[given("the setting \"{key}\" is enabled")]
fn setting_enabled(preflight_world: &PreflightWorld, key: String) {
    preflight_world.enable_setting(&key);
}

#[when("I verify the host")]
fn verify_host(preflight_world: &PreflightWorld) {
    preflight_world.run(RunMode::Verify);
}

#[when("I remediate the host")]
fn remediate_host(preflight_world: &PreflightWorld) {
    preflight_world.run(RunMode::Remediate);
}

#[when("I clean up the host")]
fn clean_up_host(preflight_world: &PreflightWorld) {
    preflight_world.run(RunMode::Cleanup);
}

#[then("check \"{id}\" reports \"{outcome}\"")]
fn check_reports(preflight_world: &PreflightWorld, id: String, outcome: String) {
    let actual = preflight_world.with_report(|report| report.outcome_of(&id));
    assert_eq!(
        actual.map(|value: CheckOutcome| value.to_string()),
        Some(outcome),
        "unexpected outcome for {id}"
    );
}

#[then("check \"{id}\" was not evaluated")]
fn check_not_evaluated(preflight_world: &PreflightWorld, id: String) {
    let recorded = preflight_world.with_report(|report| report.outcome_of(&id));
    assert_eq!(recorded, None, "{id} should have no record");
    assert_eq!(preflight_world.check(&id).probes.get(), 0, "{id} should not be probed");
}

#[then("check \"{id}\" was probed {count} times")]
fn check_probed(preflight_world: &PreflightWorld, id: String, count: usize) {
    assert_eq!(preflight_world.check(&id).probes.get(), count);
}

#[then("cleanup step \"{id}\" ran")]
fn cleanup_ran(preflight_world: &PreflightWorld, id: String) {
    assert_eq!(preflight_world.check(&id).cleanups.get(), 1);
}

#[then("the run succeeded")]
fn run_succeeded(preflight_world: &PreflightWorld) {
    preflight_world.with_report(|report| {
        assert!(report.is_success(), "unexpected failure: {:?}", report.failure);
    });
}

#[then("the run failed at \"{id}\"")]
fn run_failed_at(preflight_world: &PreflightWorld, id: String) {
    let failed = preflight_world.with_report(|report| {
        report
            .failure
            .as_ref()
            .and_then(PreflightError::check_id)
            .map(str::to_owned)
    });
    assert_eq!(failed, Some(id));
}

#[then("the run failed with {count} cleanup error")]
fn run_failed_with_cleanup_errors(preflight_world: &PreflightWorld, count: usize) {
    preflight_world.with_report(|report| match &report.failure {
        Some(PreflightError::Cleanup(errors)) => assert_eq!(errors.len(), count),
        other => panic!("expected aggregated cleanup failure, got {other:?}"),
    });
}
