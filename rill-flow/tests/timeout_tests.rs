// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Watchdog tests, including the late-arrival drop rule: once the
//! watchdog has decided the race, upstream emissions are discarded.

use rill_core::FlowError;
use rill_flow::Flow;
use rill_runtime::{DelayedExecutorRef, TokioExecutor};
use rill_test_utils::{TestSource, TestSubscriber};
use std::sync::Arc;
use std::time::Duration;

fn executor() -> DelayedExecutorRef {
    Arc::new(TokioExecutor::new())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_errors_when_the_gap_is_too_long() {
    let source = TestSource::<i32>::new();
    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(source.clone())
        .timeout(Duration::from_millis(60), executor())
        .subscribe_with(subscriber.clone());

    source.emit(1);
    // Then: silence longer than the watchdog.
    tokio::task::spawn_blocking(move || {
        subscriber.await_terminal(Duration::from_secs(2));
        assert_eq!(subscriber.values(), vec![1]);
        assert!(matches!(subscriber.error(), Some(FlowError::Timeout { .. })));
    })
    .await
    .unwrap();
    assert!(source.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_with_fallback_switches_instead_of_erroring() {
    let source = TestSource::<i32>::new();
    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(source.clone())
        .timeout_or(Duration::from_millis(60), executor(), Flow::just(99))
        .subscribe_with(subscriber.clone());

    source.emit(1);
    tokio::task::spawn_blocking(move || {
        subscriber.await_terminal(Duration::from_secs(2));
        assert_eq!(subscriber.values(), vec![1, 99]);
        assert!(subscriber.is_complete());
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_arrivals_after_the_watchdog_fired_are_dropped() {
    let source = TestSource::<i32>::new();
    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(source.clone())
        .timeout_or(Duration::from_millis(50), executor(), Flow::just(99))
        .subscribe_with(subscriber.clone());

    source.emit(1);
    tokio::time::sleep(Duration::from_millis(150)).await;

    // The race is decided; this arrival must not reach downstream.
    if !source.is_cancelled() {
        source.emit(2);
    }

    let values = {
        let subscriber = subscriber.clone();
        tokio::task::spawn_blocking(move || {
            subscriber.await_terminal(Duration::from_secs(2));
            subscriber.values()
        })
        .await
        .unwrap()
    };
    assert_eq!(values, vec![1, 99]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fast_sources_never_see_the_watchdog() {
    let subscriber = TestSubscriber::unbounded();
    Flow::range(1, 5)
        .timeout(Duration::from_millis(200), executor())
        .subscribe_with(subscriber.clone());

    tokio::task::spawn_blocking(move || {
        subscriber.await_terminal(Duration::from_secs(2));
        assert_eq!(subscriber.values(), vec![1, 2, 3, 4, 5]);
        assert!(subscriber.is_complete());
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn companion_watchdog_uses_the_per_item_publisher() {
    let source = TestSource::<i32>::new();
    let exec = executor();
    let per_item_exec = exec.clone();
    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(source.clone())
        .timeout_when(
            Flow::never().map(|_: u64| 0u64),
            move |_| Flow::timer(Duration::from_millis(50), per_item_exec.clone()),
            Some(Flow::just(-1)),
        )
        .subscribe_with(subscriber.clone());

    // No first-element watchdog: silence at the head is fine.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(!subscriber.is_terminated());

    // The per-item companion arms after the first element.
    source.emit(5);
    tokio::task::spawn_blocking(move || {
        subscriber.await_terminal(Duration::from_secs(2));
        assert_eq!(subscriber.values(), vec![5, -1]);
    })
    .await
    .unwrap();
}
