// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Backpressure adapter and emitter-facade tests: one policy enum, four
//! behaviors.

use parking_lot::Mutex;
use rill_core::{FlowError, OverflowPolicy};
use rill_flow::Flow;
use rill_test_utils::{TestSource, TestSubscriber};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn buffer_policy_parks_values_until_demand() {
    let source = TestSource::<i32>::new();
    let subscriber = TestSubscriber::new(0);
    Flow::wrap(source.clone())
        .on_backpressure_buffer()
        .subscribe_with(subscriber.clone());

    // The adapter drives the upstream unbounded.
    assert_eq!(source.outstanding(), u64::MAX);
    source.emit(1);
    source.emit(2);
    source.emit(3);
    assert_eq!(subscriber.value_count(), 0);

    subscriber.request(2);
    assert_eq!(subscriber.values(), vec![1, 2]);
    subscriber.request(10);
    assert_eq!(subscriber.values(), vec![1, 2, 3]);

    source.complete();
    subscriber.await_terminal(Duration::from_secs(1));
    assert!(subscriber.is_complete());
}

#[test]
fn drop_policy_discards_and_reports() {
    let dropped = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&dropped);

    let source = TestSource::<i32>::new();
    let subscriber = TestSubscriber::new(1);
    Flow::wrap(source.clone())
        .on_backpressure_drop(move |value| sink.lock().push(*value))
        .subscribe_with(subscriber.clone());

    source.emit(1); // consumed by the single grant
    source.emit(2); // dropped
    source.emit(3); // dropped
    subscriber.request(1);
    source.emit(4); // consumed

    assert_eq!(subscriber.values(), vec![1, 4]);
    assert_eq!(*dropped.lock(), vec![2, 3]);
}

#[test]
fn latest_policy_keeps_only_the_most_recent() {
    let source = TestSource::<i32>::new();
    let subscriber = TestSubscriber::new(1);
    Flow::wrap(source.clone())
        .on_backpressure_latest()
        .subscribe_with(subscriber.clone());

    source.emit(1);
    source.emit(2);
    source.emit(3);
    subscriber.request(1);
    assert_eq!(subscriber.values(), vec![1, 3]);
}

#[test]
fn error_policy_fails_on_overflow() {
    let source = TestSource::<i32>::new();
    let subscriber = TestSubscriber::new(1);
    Flow::wrap(source.clone())
        .on_backpressure_error()
        .subscribe_with(subscriber.clone());

    source.emit(1);
    source.emit(2);

    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec![1]);
    assert!(matches!(subscriber.error(), Some(FlowError::Overflow { .. })));
    assert!(source.is_cancelled());
}

#[test]
fn emitter_buffer_policy_flushes_before_completion() {
    let subscriber = TestSubscriber::new(0);
    Flow::create(
        |emitter| {
            emitter.next(1);
            emitter.next(2);
            emitter.complete();
        },
        OverflowPolicy::Buffer,
    )
    .subscribe_with(subscriber.clone());

    assert!(!subscriber.is_terminated());
    subscriber.request(10);
    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec![1, 2]);
    assert!(subscriber.is_complete());
}

#[test]
fn emitter_latest_policy_conflates() {
    let subscriber = TestSubscriber::new(0);
    Flow::create(
        |emitter| {
            emitter.next(1);
            emitter.next(2);
            emitter.next(3);
            emitter.complete();
        },
        OverflowPolicy::Latest,
    )
    .subscribe_with(subscriber.clone());

    subscriber.request(5);
    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec![3]);
}

#[test]
fn emitter_error_policy_signals_overflow() {
    let subscriber = TestSubscriber::new(1);
    Flow::create(
        |emitter| {
            emitter.next(1);
            emitter.next(2);
        },
        OverflowPolicy::Error,
    )
    .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec![1]);
    assert!(matches!(subscriber.error(), Some(FlowError::Overflow { .. })));
}

#[test]
fn emitter_runs_cancellation_callback() {
    let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let observed = Arc::clone(&cancelled);

    let subscriber = TestSubscriber::<i32>::new(0);
    Flow::create(
        move |emitter| {
            let observed = Arc::clone(&observed);
            emitter.set_cancellation(move || {
                observed.store(true, std::sync::atomic::Ordering::SeqCst);
            });
        },
        OverflowPolicy::Buffer,
    )
    .subscribe_with(subscriber.clone());

    subscriber.cancel();
    assert!(cancelled.load(std::sync::atomic::Ordering::SeqCst));
}
