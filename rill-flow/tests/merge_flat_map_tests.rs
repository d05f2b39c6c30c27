// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Interleaving combinator tests: merge pacing, flat_map concurrency and
//! the scalar short-circuit.

use parking_lot::Mutex;
use rill_core::FlowError;
use rill_flow::{FlatMapConfig, Flow};
use rill_test_utils::{TestSource, TestSubscriber};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn merge_interleaves_all_values() {
    let subscriber = TestSubscriber::unbounded();
    Flow::merge(vec![Flow::range(1, 3), Flow::range(10, 3)]).subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    let values: HashSet<i64> = subscriber.values().into_iter().collect();
    assert_eq!(values, HashSet::from([1, 2, 3, 10, 11, 12]));
    assert!(subscriber.is_complete());
}

#[test]
fn merge_respects_downstream_demand_in_batches() {
    // Arrange: downstream requests 2 at a time.
    let subscriber = TestSubscriber::new(2);
    Flow::merge(vec![Flow::range(1, 3), Flow::range(10, 3)]).subscribe_with(subscriber.clone());

    // Assert: exactly two values per grant, nothing before the grant.
    subscriber.await_values(2, Duration::from_secs(1));
    assert_eq!(subscriber.value_count(), 2);
    subscriber.assert_quiet(Duration::from_millis(50));

    subscriber.request(2);
    subscriber.await_values(4, Duration::from_secs(1));
    assert_eq!(subscriber.value_count(), 4);
    subscriber.assert_quiet(Duration::from_millis(50));

    subscriber.request(2);
    subscriber.await_values(6, Duration::from_secs(1));
    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.value_count(), 6);
}

#[test]
fn flat_map_emits_every_inner_value() {
    let subscriber = TestSubscriber::unbounded();
    Flow::from_iter(vec!["a", "b", "c"])
        .flat_map(|x| Flow::just(format!("{x}1")))
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    let values: HashSet<String> = subscriber.values().into_iter().collect();
    assert_eq!(
        values,
        HashSet::from(["a1".to_string(), "b1".to_string(), "c1".to_string()])
    );
}

#[test]
fn flat_map_concurrency_bound_limits_active_inners() {
    // Arrange: three manual inners behind concurrency 2.
    let inners: Arc<Mutex<Vec<TestSource<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let registry = Arc::clone(&inners);

    let subscriber = TestSubscriber::unbounded();
    Flow::from_iter(vec!["a", "b", "c"])
        .flat_map_with(
            move |_| {
                let source = TestSource::<String>::new();
                registry.lock().push(source.clone());
                Ok(Flow::wrap(source))
            },
            FlatMapConfig {
                concurrency: 2,
                prefetch: 8,
                delay_error: false,
            },
        )
        .subscribe_with(subscriber.clone());

    // Only the first two inners may be subscribed while both are live.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(inners.lock().len(), 2);

    // Finishing one inner frees the slot for the third.
    {
        let first = inners.lock()[0].clone();
        first.emit("a1".to_string());
        first.complete();
    }
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(inners.lock().len(), 3);

    {
        let remaining: Vec<_> = inners.lock().iter().skip(1).cloned().collect();
        for (index, source) in remaining.iter().enumerate() {
            source.emit(format!("v{index}"));
            source.complete();
        }
    }
    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.value_count(), 3);
}

#[test]
fn flat_map_scalar_inners_bypass_subscription() {
    let subscriber = TestSubscriber::unbounded();
    Flow::range(1, 4)
        .flat_map(|x| {
            if x % 2 == 0 {
                Flow::empty()
            } else {
                Flow::just(x * 100)
            }
        })
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    let values: HashSet<i64> = subscriber.values().into_iter().collect();
    assert_eq!(values, HashSet::from([100, 300]));
}

#[test]
fn flat_map_immediate_error_cancels_siblings() {
    let survivor = TestSource::<i64>::new();
    let survivor_for_mapper = survivor.clone();

    let subscriber = TestSubscriber::unbounded();
    Flow::from_iter(vec![1, 2])
        .flat_map_with(
            move |x| {
                if x == 1 {
                    Ok(Flow::wrap(survivor_for_mapper.clone()))
                } else {
                    Ok(Flow::fail(FlowError::stream("inner blew up")))
                }
            },
            FlatMapConfig::default(),
        )
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    assert!(subscriber.error().is_some());
    assert!(survivor.is_cancelled());
}

#[test]
fn flat_map_delay_error_drains_before_failing() {
    let slow = TestSource::<i64>::new();
    let slow_for_mapper = slow.clone();

    let subscriber = TestSubscriber::unbounded();
    Flow::from_iter(vec![1, 2])
        .flat_map_with(
            move |x| {
                if x == 1 {
                    Ok(Flow::wrap(slow_for_mapper.clone()))
                } else {
                    Ok(Flow::fail(FlowError::stream("deferred failure")))
                }
            },
            FlatMapConfig {
                delay_error: true,
                ..FlatMapConfig::default()
            },
        )
        .subscribe_with(subscriber.clone());

    // The healthy inner keeps delivering despite the failed sibling.
    std::thread::sleep(Duration::from_millis(30));
    slow.emit(7);
    slow.emit(8);
    slow.complete();

    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec![7, 8]);
    assert!(subscriber.error().is_some());
}

#[test]
fn amb_first_emitter_wins() {
    let fast = TestSource::<&'static str>::new();
    let slow = TestSource::<&'static str>::new();

    let subscriber = TestSubscriber::unbounded();
    Flow::amb(vec![Flow::wrap(slow.clone()), Flow::wrap(fast.clone())])
        .subscribe_with(subscriber.clone());

    fast.emit("fast");
    assert!(slow.is_cancelled());
    slow.complete();

    fast.emit("again");
    fast.complete();
    subscriber.await_terminal(Duration::from_secs(1));
    assert_eq!(subscriber.values(), vec!["fast", "again"]);
}
