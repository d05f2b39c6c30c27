// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Sequential combinator tests: concat, concat_map, switch_map and the
//! error-surfacing modes.

use rill_core::FlowError;
use rill_flow::{ErrorMode, Flow};
use rill_test_utils::{TestSource, TestSubscriber};
use std::time::Duration;

#[test]
fn concat_of_scalars_round_trips_the_iterable() {
    // Arrange
    let from_scalars = Flow::concat(vec![
        Flow::just(1),
        Flow::just(2),
        Flow::just(3),
        Flow::just(4),
    ]);
    let from_iterable = Flow::from_iter(vec![1, 2, 3, 4]);

    // Act
    let left = TestSubscriber::unbounded();
    from_scalars.subscribe_with(left.clone());
    left.await_terminal(Duration::from_secs(1));

    let right = TestSubscriber::unbounded();
    from_iterable.subscribe_with(right.clone());
    right.await_terminal(Duration::from_secs(1));

    // Assert
    assert_eq!(left.signals(), right.signals());
}

#[test]
fn concat_subscribes_next_only_after_previous_completes() {
    let first = TestSource::<i32>::new();
    let second = TestSource::<i32>::new();

    let subscriber = TestSubscriber::unbounded();
    Flow::concat(vec![Flow::wrap(first.clone()), Flow::wrap(second.clone())])
        .subscribe_with(subscriber.clone());

    assert!(first.is_subscribed());
    assert!(!second.is_subscribed());

    first.emit(1);
    first.complete();
    assert!(second.is_subscribed());

    second.emit(2);
    second.complete();
    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec![1, 2]);
}

#[test]
fn concat_carries_unsatisfied_demand_across_the_boundary() {
    let first = TestSource::<i32>::new();
    let second = TestSource::<i32>::new();

    let subscriber = TestSubscriber::new(5);
    Flow::concat(vec![Flow::wrap(first.clone()), Flow::wrap(second.clone())])
        .subscribe_with(subscriber.clone());

    first.emit(1);
    first.emit(2);
    first.complete();

    // 5 granted, 2 satisfied: the successor inherits 3.
    assert_eq!(second.outstanding(), 3);
}

#[test]
fn concat_immediate_mode_short_circuits_on_error() {
    let subscriber = TestSubscriber::<i32>::unbounded();
    Flow::concat(vec![
        Flow::just(1),
        Flow::fail(FlowError::stream("middle failed")),
        Flow::just(3),
    ])
    .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec![1]);
    assert!(subscriber.error().is_some());
}

#[test]
fn concat_end_mode_collects_errors_until_all_sources_finish() {
    let subscriber = TestSubscriber::<i32>::unbounded();
    Flow::concat_mode(
        vec![
            Flow::just(1),
            Flow::fail(FlowError::stream("first failure")),
            Flow::just(3),
            Flow::fail(FlowError::stream("second failure")),
        ],
        ErrorMode::End,
    )
    .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec![1, 3]);
    match subscriber.error() {
        Some(FlowError::Composite { count, .. }) => assert_eq!(count, 2),
        other => panic!("expected composite error, got {other:?}"),
    }
}

#[test]
fn concat_map_drains_inners_in_order() {
    let subscriber = TestSubscriber::unbounded();
    Flow::range(1, 3)
        .concat_map(|x| Flow::from_iter(vec![x * 10, x * 10 + 1]))
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec![10, 11, 20, 21, 30, 31]);
}

#[test]
fn concat_map_skips_empty_inners() {
    let subscriber = TestSubscriber::unbounded();
    Flow::range(1, 5)
        .concat_map(|x| {
            if x % 2 == 0 {
                Flow::empty()
            } else {
                Flow::just(x)
            }
        })
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec![1, 3, 5]);
}

#[test]
fn switch_map_cancels_superseded_inner() {
    let outer = TestSource::<u32>::new();
    let first_inner = TestSource::<String>::new();
    let second_inner = TestSource::<String>::new();
    let first_for_mapper = first_inner.clone();
    let second_for_mapper = second_inner.clone();

    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(outer.clone())
        .switch_map(move |x| {
            if x == 1 {
                Flow::wrap(first_for_mapper.clone())
            } else {
                Flow::wrap(second_for_mapper.clone())
            }
        })
        .subscribe_with(subscriber.clone());

    outer.emit(1);
    first_inner.emit("one".to_string());

    // A new outer element retires the active inner.
    outer.emit(2);
    assert!(first_inner.is_cancelled());

    second_inner.emit("two".to_string());
    outer.complete();
    second_inner.complete();

    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec!["one".to_string(), "two".to_string()]);
}

#[test]
fn switch_map_outer_completion_waits_for_last_inner() {
    let outer = TestSource::<u32>::new();
    let inner = TestSource::<String>::new();
    let inner_for_mapper = inner.clone();

    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(outer.clone())
        .switch_map(move |_| Flow::wrap(inner_for_mapper.clone()))
        .subscribe_with(subscriber.clone());

    outer.emit(1);
    outer.complete();
    assert!(!subscriber.is_terminated());

    inner.emit("late".to_string());
    inner.complete();
    subscriber.await_terminal(Duration::from_secs(1));
    assert!(subscriber.is_complete());
    assert_eq!(subscriber.values(), vec!["late".to_string()]);
}
