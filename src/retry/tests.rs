//! Unit tests for the retry policy.

use std::cell::Cell;
use std::time::Duration;

use rstest::rstest;

use super::*;
use crate::test_support::RecordingSleeper;

#[rstest]
#[case(1)]
#[case(3)]
#[case(10)]
fn always_retriable_uses_every_attempt(#[case] attempts: u32) {
    let sleeper = RecordingSleeper::new();
    let calls = Cell::new(0_u32);
    let policy = RetryPolicy::new(attempts, Duration::from_secs(1));

    let result: Result<(), String> = policy.run_with(&sleeper, || {
        calls.set(calls.get() + 1);
        Err(RetryError::Retriable(format!("attempt {}", calls.get())))
    });

    assert_eq!(calls.get(), attempts);
    assert_eq!(sleeper.count(), (attempts - 1) as usize);
    assert_eq!(result, Err(format!("attempt {attempts}")));
}

#[test]
fn fatal_error_stops_without_sleeping() {
    let sleeper = RecordingSleeper::new();
    let calls = Cell::new(0_u32);
    let policy = RetryPolicy::new(5, Duration::from_secs(2));

    let result: Result<(), &str> = policy.run_with(&sleeper, || {
        calls.set(calls.get() + 1);
        Err(RetryError::Fatal("broken"))
    });

    assert_eq!(result, Err("broken"));
    assert_eq!(calls.get(), 1);
    assert_eq!(sleeper.count(), 0);
}

#[test]
fn success_after_transient_failures_returns_value() {
    let sleeper = RecordingSleeper::new();
    let calls = Cell::new(0_u32);
    let policy = RetryPolicy::new(5, Duration::from_millis(250));

    let result: Result<u32, &str> = policy.run_with(&sleeper, || {
        calls.set(calls.get() + 1);
        if calls.get() < 3 {
            Err(RetryError::Retriable("not yet"))
        } else {
            Ok(calls.get())
        }
    });

    assert_eq!(result, Ok(3));
    assert_eq!(
        sleeper.durations(),
        vec![Duration::from_millis(250), Duration::from_millis(250)]
    );
}

#[test]
fn zero_attempts_are_clamped_to_one() {
    let policy = RetryPolicy::new(0, Duration::ZERO);
    assert_eq!(policy.max_attempts(), 1);

    let calls = Cell::new(0_u32);
    let result: Result<(), &str> = policy.run_with(&RecordingSleeper::new(), || {
        calls.set(calls.get() + 1);
        Err(RetryError::Retriable("nope"))
    });
    assert_eq!(result, Err("nope"));
    assert_eq!(calls.get(), 1);
}

#[test]
fn retry_after_returns_immediate_success() {
    let result: Result<&str, &str> = retry_after(3, || Ok("ready"), Duration::ZERO);
    assert_eq!(result, Ok("ready"));
}

#[rstest]
#[case(RetryError::Retriable("x"), true)]
#[case(RetryError::Fatal("x"), false)]
fn classification_is_reported(#[case] err: RetryError<&str>, #[case] retriable: bool) {
    assert_eq!(err.is_retriable(), retriable);
    assert_eq!(err.into_inner(), "x");
}
