// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Resubscription tests: retry, retry_when, repeat and error recovery.

use rill_core::FlowError;
use rill_flow::Flow;
use rill_test_utils::TestSubscriber;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A cold source that emits `1` then fails, counting subscriptions.
fn flaky(attempts: &Arc<AtomicUsize>) -> Flow<i32> {
    let attempts = Arc::clone(attempts);
    Flow::defer(move || {
        attempts.fetch_add(1, Ordering::SeqCst);
        Flow::just(1).concat_with(Flow::fail(FlowError::stream("flaky")))
    })
}

#[test]
fn retry_makes_the_configured_number_of_extra_attempts() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let subscriber = TestSubscriber::unbounded();
    flaky(&attempts).retry(2).subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    // Three attempts total: the original and two retries.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(subscriber.values(), vec![1, 1, 1]);
    assert!(subscriber.error().is_some());
}

#[test]
fn retry_if_consults_the_predicate() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let subscriber = TestSubscriber::unbounded();
    flaky(&attempts)
        .retry_if(5, |error| matches!(error, FlowError::Timeout { .. }))
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    // Predicate rejects stream errors: no retries at all.
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(subscriber.values(), vec![1]);
}

#[test]
fn successful_completion_is_not_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let subscriber = TestSubscriber::unbounded();
    Flow::defer(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Flow::range(1, 3)
    })
    .retry(5)
    .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(subscriber.is_complete());
}

#[test]
fn retry_when_resubscribes_per_companion_signal() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let subscriber = TestSubscriber::unbounded();
    flaky(&attempts)
        .retry_when(|errors| errors.take(2))
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    // The companion allows two resubscriptions, then completes the chain.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(subscriber.values(), vec![1, 1, 1]);
    assert!(subscriber.is_complete());
}

#[test]
fn retry_when_companion_error_is_composited_with_the_cause() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let subscriber = TestSubscriber::unbounded();
    flaky(&attempts)
        .retry_when(|errors| {
            errors.try_map(|_| -> Result<u32, FlowError> {
                Err(FlowError::stream("companion gave up"))
            })
        })
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    match subscriber.error() {
        Some(FlowError::Composite { count, .. }) => assert_eq!(count, 2),
        other => panic!("expected composite, got {other:?}"),
    }
}

#[test]
fn repeat_reruns_after_completion() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let subscriber = TestSubscriber::unbounded();
    Flow::defer(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Flow::range(1, 2)
    })
    .repeat(2)
    .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(subscriber.values(), vec![1, 2, 1, 2, 1, 2]);
    assert!(subscriber.is_complete());
}

#[test]
fn repeat_if_stops_when_the_predicate_turns_false() {
    let budget = Arc::new(AtomicUsize::new(2));
    let gate = Arc::clone(&budget);
    let subscriber = TestSubscriber::unbounded();
    Flow::just(7)
        .repeat_if(100, move || {
            gate.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
                .is_ok()
        })
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec![7, 7, 7]);
}

#[test]
fn on_error_resume_with_switches_to_the_fallback() {
    let subscriber = TestSubscriber::unbounded();
    Flow::range(1, 2)
        .concat_with(Flow::fail(FlowError::stream("broken")))
        .on_error_resume_with(|_| Flow::range(10, 2))
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec![1, 2, 10, 11]);
    assert!(subscriber.is_complete());
}

#[test]
fn on_error_return_substitutes_one_value() {
    let subscriber = TestSubscriber::unbounded();
    Flow::fail(FlowError::stream("broken"))
        .on_error_return(42)
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec![42]);
    assert!(subscriber.is_complete());
}

#[test]
fn map_error_rewrites_the_cause() {
    let subscriber = TestSubscriber::<i32>::unbounded();
    Flow::fail(FlowError::stream("low level"))
        .map_error(|e| FlowError::stream(format!("wrapped: {e}")))
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    let message = subscriber.error().map(|e| e.to_string()).unwrap_or_default();
    assert!(message.contains("wrapped"));
}
