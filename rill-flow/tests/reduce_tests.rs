// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Terminal-fold tests: the single-value family and its demand behavior.

use rill_core::FlowError;
use rill_flow::Flow;
use rill_test_utils::{TestSource, TestSubscriber};
use std::collections::HashMap;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(1);

#[test]
fn range_map_collect() {
    let squares = Flow::range(1, 5)
        .map(|x| x * x)
        .to_list()
        .block(TIMEOUT)
        .unwrap();
    assert_eq!(squares, Some(vec![1, 4, 9, 16, 25]));
}

#[test]
fn reduce_folds_every_element() {
    let sum = Flow::range(1, 100)
        .reduce(0i64, |acc, x| acc + x)
        .block(TIMEOUT)
        .unwrap();
    assert_eq!(sum, Some(5050));
}

#[test]
fn reduction_requests_unbounded_demand() {
    let source = TestSource::<i32>::new();
    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(source.clone())
        .count()
        .into_flow()
        .subscribe_with(subscriber.clone());

    assert_eq!(source.outstanding(), u64::MAX);
    source.emit(1);
    source.emit(2);
    source.complete();
    subscriber.await_terminal(TIMEOUT);
    assert_eq!(subscriber.values(), vec![2]);
}

#[test]
fn reduction_parks_the_result_until_demand() {
    let subscriber = TestSubscriber::new(0);
    Flow::range(1, 3).count().into_flow().subscribe_with(subscriber.clone());

    // The fold settled, but nothing was requested yet.
    assert_eq!(subscriber.value_count(), 0);
    subscriber.request(1);
    subscriber.await_terminal(TIMEOUT);
    assert_eq!(subscriber.values(), vec![3]);
}

#[test]
fn all_short_circuits_on_counterexample() {
    let source = TestSource::<i32>::new();
    let verdict = std::sync::Arc::new(parking_lot::Mutex::new(None));
    let sink = std::sync::Arc::clone(&verdict);
    let token = Flow::wrap(source.clone())
        .all(|x| *x < 10)
        .into_flow()
        .subscribe(move |v| *sink.lock() = Some(v));

    source.emit(1);
    source.emit(50);
    assert!(source.is_cancelled());
    assert_eq!(*verdict.lock(), Some(false));
    drop(token);
}

#[test]
fn any_finds_a_witness() {
    let found = Flow::range(1, 10)
        .any(|x| *x == 7)
        .block(TIMEOUT)
        .unwrap();
    assert_eq!(found, Some(true));

    let missing = Flow::range(1, 10)
        .any(|x| *x == 70)
        .block(TIMEOUT)
        .unwrap();
    assert_eq!(missing, Some(false));
}

#[test]
fn element_at_picks_by_index() {
    let third = Flow::range(10, 5).element_at(2).block(TIMEOUT).unwrap();
    assert_eq!(third, Some(12));

    let out_of_range = Flow::range(10, 2).element_at(5).block(TIMEOUT);
    assert!(out_of_range.is_err());
}

#[test]
fn single_enforces_multiplicity() {
    let one = Flow::just(5).single().block(TIMEOUT).unwrap();
    assert_eq!(one, Some(5));

    let too_many = Flow::range(1, 2).single().block(TIMEOUT);
    assert!(too_many.is_err());

    let none: Result<Option<i32>, FlowError> = Flow::empty().single().block(TIMEOUT);
    assert!(none.is_err());
}

#[test]
fn last_takes_the_final_element() {
    let last = Flow::range(1, 9).last().block(TIMEOUT).unwrap();
    assert_eq!(last, Some(9));
}

#[test]
fn to_map_keeps_the_latest_per_key() {
    let map = Flow::from_iter(vec![(1, "a"), (2, "b"), (1, "c")])
        .to_map(|(k, _)| *k, |(_, v)| v)
        .block(TIMEOUT)
        .unwrap()
        .unwrap();
    assert_eq!(map, HashMap::from([(1, "c"), (2, "b")]));
}

#[test]
fn to_multimap_collects_per_key() {
    let map = Flow::range(1, 6)
        .to_multimap(|x| x % 2, |x| x)
        .block(TIMEOUT)
        .unwrap()
        .unwrap();
    assert_eq!(map, HashMap::from([(0, vec![2, 4, 6]), (1, vec![1, 3, 5])]));
}

#[test]
fn scan_emits_the_running_accumulator() {
    let subscriber = TestSubscriber::unbounded();
    Flow::range(1, 4)
        .scan(0i64, |acc, x| acc + x)
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(TIMEOUT);
    assert_eq!(subscriber.values(), vec![0, 1, 3, 6, 10]);
}

#[test]
fn fold_error_from_callback_terminates() {
    let outcome = Flow::range(1, 5)
        .try_map(|x| {
            if x == 3 {
                Err(FlowError::stream("no threes"))
            } else {
                Ok(x)
            }
        })
        .to_list()
        .block(TIMEOUT);
    assert!(outcome.is_err());
}
