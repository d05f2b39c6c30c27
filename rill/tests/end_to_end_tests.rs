// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Facade-level scenarios exercising whole pipelines through the prelude.

use rill::prelude::*;
use rill_test_utils::{TestSource, TestSubscriber};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(2);

#[test]
fn range_map_collect_emits_the_squares() {
    let squares = Flow::range(1, 5)
        .map(|x| x * x)
        .to_list()
        .block(TIMEOUT)
        .unwrap();
    assert_eq!(squares, Some(vec![1, 4, 9, 16, 25]));
}

#[test]
fn merge_delivers_exactly_per_request() {
    let subscriber = TestSubscriber::new(2);
    Flow::merge(vec![Flow::range(1, 3), Flow::range(10, 3)]).subscribe_with(subscriber.clone());

    subscriber.await_values(2, TIMEOUT);
    assert_eq!(subscriber.value_count(), 2);
    subscriber.assert_quiet(Duration::from_millis(40));

    subscriber.request(2);
    subscriber.request(2);
    subscriber.await_terminal(TIMEOUT);
    let all: HashSet<i64> = subscriber.values().into_iter().collect();
    assert_eq!(all, HashSet::from([1, 2, 3, 10, 11, 12]));
}

#[test]
fn flat_map_with_concurrency_two_bounds_inflight_inners() {
    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let live_in = Arc::clone(&live);
    let peak_in = Arc::clone(&peak);

    let subscriber = TestSubscriber::unbounded();
    Flow::from_iter(vec!["a", "b", "c"])
        .flat_map_with(
            move |x| {
                let live = Arc::clone(&live_in);
                let peak = Arc::clone(&peak_in);
                let label = format!("{x}1");
                Ok(Flow::defer(move || {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    live.fetch_sub(1, Ordering::SeqCst);
                    Flow::just(label.clone())
                })
                .hide())
            },
            FlatMapConfig {
                concurrency: 2,
                prefetch: 4,
                delay_error: false,
            },
        )
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(TIMEOUT);
    let outputs: HashSet<String> = subscriber.values().into_iter().collect();
    assert_eq!(
        outputs,
        HashSet::from(["a1".to_string(), "b1".to_string(), "c1".to_string()])
    );
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_with_fallback_switches_over() {
    let exec: DelayedExecutorRef = Arc::new(TokioExecutor::new());
    let source = TestSource::<i32>::new();
    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(source.clone())
        .timeout_or(Duration::from_millis(100), exec, Flow::just(99))
        .subscribe_with(subscriber.clone());

    source.emit(1);
    tokio::task::spawn_blocking(move || {
        subscriber.await_terminal(TIMEOUT);
        assert_eq!(subscriber.values(), vec![1, 99]);
        assert!(subscriber.is_complete());
    })
    .await
    .unwrap();
}

#[test]
fn retry_with_counting_predicate_makes_three_attempts() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    let subscriber = TestSubscriber::unbounded();
    Flow::defer(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Flow::just(1).concat_with(Flow::fail(FlowError::stream("transient")))
    })
    .retry_if(2, |error| matches!(error, FlowError::Stream { .. }))
    .subscribe_with(subscriber.clone());

    subscriber.await_terminal(TIMEOUT);
    assert_eq!(subscriber.values(), vec![1, 1, 1]);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(subscriber.error().is_some());
}

#[test]
fn group_by_partitions_odds_and_evens() {
    let partitions = Flow::range(1, 10)
        .group_by(|x| x % 2)
        .flat_map(|group| {
            let key = *group.key();
            group.flow().to_list().into_flow().map(move |list| (key, list))
        })
        .to_list()
        .block(TIMEOUT)
        .unwrap()
        .unwrap();

    let mut partitions = partitions;
    partitions.sort_by_key(|(key, _)| *key);
    assert_eq!(
        partitions,
        vec![(0, vec![2, 4, 6, 8, 10]), (1, vec![1, 3, 5, 7, 9])]
    );
}

#[test]
fn emitter_pipeline_with_overflow_policy() {
    let subscriber = TestSubscriber::unbounded();
    Flow::create(
        |emitter: Emitter<i32>| {
            for v in 1..=5 {
                emitter.next(v);
            }
            emitter.complete();
        },
        OverflowPolicy::Buffer,
    )
    .filter(|v| v % 2 == 1)
    .map(|v| v * 10)
    .subscribe_with(subscriber.clone());

    subscriber.await_terminal(TIMEOUT);
    assert_eq!(subscriber.values(), vec![10, 30, 50]);
}

#[test]
fn dropped_error_hook_observes_post_terminal_errors() {
    static SEEN: AtomicUsize = AtomicUsize::new(0);
    rill::hooks::set_dropped_error_hook(|_| {
        SEEN.fetch_add(1, Ordering::SeqCst);
    });

    let subscriber = TestSubscriber::<i32>::unbounded();
    Flow::create(
        |emitter: Emitter<i32>| {
            emitter.next(1);
            emitter.complete();
            // Past the terminal; this error can only reach the hook.
            emitter.error(FlowError::stream("too late"));
        },
        OverflowPolicy::Buffer,
    )
    .subscribe_with(subscriber.clone());

    subscriber.await_terminal(TIMEOUT);
    assert_eq!(subscriber.values(), vec![1]);
    assert!(subscriber.is_complete());
    assert!(SEEN.load(Ordering::SeqCst) >= 1);
    rill::hooks::reset_dropped_error_hook();
}

#[test]
fn solo_composes_back_into_flows() {
    let doubled = Flow::range(1, 4)
        .count()
        .map(|n| n * 2)
        .block(TIMEOUT)
        .unwrap();
    assert_eq!(doubled, Some(8));

    let expanded = Solo::just(3)
        .flatten_many(|n| Flow::range(1, n as usize))
        .to_list()
        .block(TIMEOUT)
        .unwrap();
    assert_eq!(expanded, Some(vec![1, 2, 3]));
}
