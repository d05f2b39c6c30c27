// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Batch and substream boundary tests, including the skip overlap rules.

use rill_flow::Flow;
use rill_test_utils::{TestSource, TestSubscriber};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(1);

#[test]
fn buffer_tiles_exactly_when_skip_equals_size() {
    let buffers = Flow::range(1, 7)
        .buffer(3)
        .to_list()
        .block(TIMEOUT)
        .unwrap()
        .unwrap();
    // The trailing partial buffer flushes at completion.
    assert_eq!(buffers, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
}

#[test]
fn buffer_overlaps_when_skip_is_smaller() {
    let buffers = Flow::range(1, 5)
        .buffer_with_skip(3, 1)
        .to_list()
        .block(TIMEOUT)
        .unwrap()
        .unwrap();
    assert_eq!(
        buffers,
        vec![
            vec![1, 2, 3],
            vec![2, 3, 4],
            vec![3, 4, 5],
            vec![4, 5],
            vec![5],
        ]
    );
}

#[test]
fn buffer_drops_between_batches_when_skip_is_larger() {
    let buffers = Flow::range(1, 9)
        .buffer_with_skip(2, 3)
        .to_list()
        .block(TIMEOUT)
        .unwrap()
        .unwrap();
    // Windows open at 1, 4, 7; each takes two elements; 3, 6, 9 are lost.
    assert_eq!(buffers, vec![vec![1, 2], vec![4, 5], vec![7, 8]]);
}

#[test]
fn buffer_boundary_cuts_on_companion_signals() {
    let source = TestSource::<i32>::new();
    let boundary = TestSource::<()>::new();

    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(source.clone())
        .buffer_boundary(Flow::wrap(boundary.clone()))
        .subscribe_with(subscriber.clone());

    source.emit(1);
    source.emit(2);
    boundary.emit(());
    source.emit(3);
    boundary.emit(());
    source.complete();

    subscriber.await_terminal(TIMEOUT);
    assert_eq!(subscriber.values(), vec![vec![1, 2], vec![3]]);
}

#[test]
fn buffer_when_overlaps_arbitrarily() {
    let source = TestSource::<i32>::new();
    let open = TestSource::<u8>::new();
    let close_a = TestSource::<()>::new();
    let close_b = TestSource::<()>::new();
    let close_a_for_factory = close_a.clone();
    let close_b_for_factory = close_b.clone();

    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(source.clone())
        .buffer_when(Flow::wrap(open.clone()), move |which| {
            if *which == 0 {
                Flow::wrap(close_a_for_factory.clone())
            } else {
                Flow::wrap(close_b_for_factory.clone())
            }
        })
        .subscribe_with(subscriber.clone());

    open.emit(0);
    source.emit(1);
    open.emit(1);
    source.emit(2);
    close_a.emit(());
    source.emit(3);
    close_b.emit(());
    source.complete();

    subscriber.await_terminal(TIMEOUT);
    assert_eq!(subscriber.values(), vec![vec![1, 2], vec![2, 3]]);
}

#[test]
fn window_substreams_carry_their_slice() {
    let lists = Flow::range(1, 6)
        .window(2)
        .flat_map(|window| window.to_list().into_flow())
        .to_list()
        .block(TIMEOUT)
        .unwrap()
        .unwrap();
    assert_eq!(lists, vec![vec![1, 2], vec![3, 4], vec![5, 6]]);
}

#[test]
fn window_boundary_rotates_on_companion_signals() {
    let source = TestSource::<i32>::new();
    let boundary = TestSource::<()>::new();

    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(source.clone())
        .window_boundary(Flow::wrap(boundary.clone()))
        .flat_map(|window| window.to_list().into_flow())
        .subscribe_with(subscriber.clone());

    source.emit(1);
    source.emit(2);
    boundary.emit(());
    source.emit(3);
    source.complete();

    subscriber.await_terminal(TIMEOUT);
    assert_eq!(subscriber.values(), vec![vec![1, 2], vec![3]]);
}

#[test]
fn take_stops_and_cancels_at_the_boundary() {
    let source = TestSource::<i32>::new();
    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(source.clone()).take(2).subscribe_with(subscriber.clone());

    source.emit(1);
    source.emit(2);
    assert!(source.is_cancelled());
    subscriber.await_terminal(TIMEOUT);
    assert_eq!(subscriber.values(), vec![1, 2]);
    assert!(subscriber.is_complete());
}

#[test]
fn take_while_drops_the_first_failing_element() {
    let values = Flow::range(1, 10)
        .take_while(|x| *x < 4)
        .to_list()
        .block(TIMEOUT)
        .unwrap();
    assert_eq!(values, Some(vec![1, 2, 3]));
}

#[test]
fn skip_pads_the_first_request() {
    let source = TestSource::<i32>::new();
    let subscriber = TestSubscriber::new(2);
    Flow::wrap(source.clone()).skip(3).subscribe_with(subscriber.clone());

    // 2 requested downstream + 3 skipped upstream.
    assert_eq!(source.total_requested(), 5);
    for v in 1..=5 {
        source.emit(v);
    }
    assert_eq!(subscriber.values(), vec![4, 5]);
}

#[test]
fn distinct_emits_first_occurrences() {
    let values = Flow::from_iter(vec![1, 2, 1, 3, 2, 4])
        .distinct()
        .to_list()
        .block(TIMEOUT)
        .unwrap();
    assert_eq!(values, Some(vec![1, 2, 3, 4]));
}

#[test]
fn distinct_until_changed_suppresses_adjacent_duplicates() {
    let values = Flow::from_iter(vec![1, 1, 2, 2, 2, 1, 3, 3])
        .distinct_until_changed()
        .to_list()
        .block(TIMEOUT)
        .unwrap();
    assert_eq!(values, Some(vec![1, 2, 1, 3]));
}

#[test]
fn start_with_prepends_items() {
    let values = Flow::range(3, 2)
        .start_with(vec![1, 2])
        .to_list()
        .block(TIMEOUT)
        .unwrap();
    assert_eq!(values, Some(vec![1, 2, 3, 4]));
}

#[test]
fn default_if_empty_substitutes_on_empty_upstream() {
    let fallback = Flow::<i64>::empty()
        .default_if_empty(42)
        .to_list()
        .block(TIMEOUT)
        .unwrap();
    assert_eq!(fallback, Some(vec![42]));

    let untouched = Flow::range(1, 2)
        .default_if_empty(42)
        .to_list()
        .block(TIMEOUT)
        .unwrap();
    assert_eq!(untouched, Some(vec![1, 2]));
}

#[test]
fn tap_observes_without_altering() {
    let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&seen);
    let completed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = std::sync::Arc::clone(&completed);

    let values = Flow::range(1, 3)
        .tap(
            rill_flow::Tap::new()
                .on_next(move |v: &i64| sink.lock().push(*v))
                .on_complete(move || flag.store(true, std::sync::atomic::Ordering::SeqCst)),
        )
        .to_list()
        .block(TIMEOUT)
        .unwrap();

    assert_eq!(values, Some(vec![1, 2, 3]));
    assert_eq!(*seen.lock(), vec![1, 2, 3]);
    assert!(completed.load(std::sync::atomic::Ordering::SeqCst));
}

#[test]
fn cast_converts_through_from() {
    let values: Option<Vec<i64>> = Flow::from_iter(vec![1i32, 2, 3])
        .cast::<i64>()
        .to_list()
        .block(TIMEOUT)
        .unwrap();
    assert_eq!(values, Some(vec![1i64, 2, 3]));
}
