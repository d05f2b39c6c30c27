// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Lockstep and latest-value combination tests.

use rill_core::FlowError;
use rill_flow::Flow;
use rill_test_utils::{TestSource, TestSubscriber};
use std::time::Duration;

#[test]
fn zip_with_pairs_in_lockstep() {
    let subscriber = TestSubscriber::unbounded();
    Flow::range(1, 4)
        .zip_with(Flow::from_iter(vec!["a", "b", "c"]), |n, s| format!("{s}{n}"))
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(
        subscriber.values(),
        vec!["a1".to_string(), "b2".to_string(), "c3".to_string()]
    );
    // The shorter leg ends the pairing.
    assert!(subscriber.is_complete());
}

#[test]
fn zip_completes_when_a_finished_leg_runs_dry() {
    let left = TestSource::<i32>::new();
    let right = TestSource::<i32>::new();

    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(left.clone())
        .zip_with(Flow::wrap(right.clone()), |a, b| a + b)
        .subscribe_with(subscriber.clone());

    left.emit(1);
    right.emit(10);
    assert_eq!(subscriber.values(), vec![11]);

    // Left completes with an empty queue: no further pair can form.
    left.complete();
    subscriber.await_terminal(Duration::from_secs(1));
    assert!(subscriber.is_complete());
    assert!(right.is_cancelled());
}

#[test]
fn zip_drains_queued_values_of_a_completed_leg() {
    let left = TestSource::<i32>::new();
    let right = TestSource::<i32>::new();

    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(left.clone())
        .zip_with(Flow::wrap(right.clone()), |a, b| a + b)
        .subscribe_with(subscriber.clone());

    left.emit(1);
    left.emit(2);
    left.complete();
    // The queued 1 and 2 still pair with late right-hand values.
    right.emit(10);
    right.emit(20);

    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec![11, 22]);
}

#[test]
fn zip_many_combines_rows() {
    let subscriber = TestSubscriber::unbounded();
    Flow::zip(
        vec![Flow::range(1, 3), Flow::range(10, 3), Flow::range(100, 3)],
        |row| row.iter().sum::<i64>(),
    )
    .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec![111, 114, 117]);
}

#[test]
fn combine_latest_waits_for_every_slot() {
    let left = TestSource::<i32>::new();
    let right = TestSource::<i32>::new();

    let subscriber = TestSubscriber::unbounded();
    Flow::combine_latest(
        vec![Flow::wrap(left.clone()), Flow::wrap(right.clone())],
        |row| (row[0], row[1]),
    )
    .subscribe_with(subscriber.clone());

    left.emit(1);
    assert_eq!(subscriber.value_count(), 0);

    right.emit(10);
    assert_eq!(subscriber.values(), vec![(1, 10)]);

    left.emit(2);
    assert_eq!(subscriber.values(), vec![(1, 10), (2, 10)]);

    left.complete();
    right.emit(20);
    assert_eq!(subscriber.values(), vec![(1, 10), (2, 10), (2, 20)]);

    right.complete();
    subscriber.await_terminal(Duration::from_secs(1));
    assert!(subscriber.is_complete());
}

#[test]
fn combine_latest_completes_early_when_an_empty_leg_finishes() {
    let left = TestSource::<i32>::new();
    let right = TestSource::<i32>::new();

    let subscriber = TestSubscriber::unbounded();
    Flow::combine_latest(
        vec![Flow::wrap(left.clone()), Flow::wrap(right.clone())],
        |row| row[0] + row[1],
    )
    .subscribe_with(subscriber.clone());

    left.emit(1);
    // Right completes without ever emitting: nothing can combine anymore.
    right.complete();

    subscriber.await_terminal(Duration::from_secs(1));
    assert!(subscriber.is_complete());
    assert_eq!(subscriber.value_count(), 0);
    assert!(left.is_cancelled());
}

#[test]
fn combine_latest_propagates_errors() {
    let subscriber = TestSubscriber::<i64>::unbounded();
    Flow::combine_latest(
        vec![Flow::range(1, 2), Flow::fail(FlowError::stream("leg failed"))],
        |row| row[0],
    )
    .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    assert!(subscriber.error().is_some());
}

#[test]
fn with_latest_from_samples_the_side_stream() {
    let main = TestSource::<i32>::new();
    let side = TestSource::<&'static str>::new();

    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(main.clone())
        .with_latest_from(Flow::wrap(side.clone()), |m, s| format!("{s}{m}"))
        .subscribe_with(subscriber.clone());

    // Main emissions before the side produced are dropped.
    main.emit(1);
    assert_eq!(subscriber.value_count(), 0);

    side.emit("a");
    main.emit(2);
    side.emit("b");
    main.emit(3);

    main.complete();
    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec!["a2".to_string(), "b3".to_string()]);
    assert!(side.is_cancelled());
}

#[test]
fn with_latest_from_completes_if_the_side_never_emits() {
    let main = TestSource::<i32>::new();
    let side = TestSource::<i32>::new();

    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(main.clone())
        .with_latest_from(Flow::wrap(side.clone()), |m, s| m + s)
        .subscribe_with(subscriber.clone());

    side.complete();
    subscriber.await_terminal(Duration::from_secs(1));
    assert!(subscriber.is_complete());
    assert!(main.is_cancelled());
}
