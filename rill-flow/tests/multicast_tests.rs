// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Hot-source tests: connect semantics, demand coordination, replay
//! history and the lifecycle adapters.

use rill_flow::{Flow, ReplayConfig};
use rill_test_utils::{TestSource, TestSubscriber};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn subscribers_park_until_connect() {
    let upstream = TestSource::<i32>::new();
    let connectable = Flow::wrap(upstream.clone()).publish(8);

    let early = TestSubscriber::unbounded();
    connectable.subscribe_with(early.clone());
    assert!(!upstream.is_subscribed());

    connectable.connect();
    assert!(upstream.is_subscribed());

    upstream.emit(1);
    upstream.complete();
    early.await_terminal(Duration::from_secs(1));
    assert_eq!(early.values(), vec![1]);
}

#[test]
fn publish_broadcasts_to_all_subscribers() {
    let upstream = TestSource::<i32>::new();
    let connectable = Flow::wrap(upstream.clone()).publish(8);

    let first = TestSubscriber::unbounded();
    let second = TestSubscriber::unbounded();
    connectable.subscribe_with(first.clone());
    connectable.subscribe_with(second.clone());
    connectable.connect();

    upstream.emit(1);
    upstream.emit(2);
    upstream.complete();

    first.await_terminal(Duration::from_secs(1));
    second.await_terminal(Duration::from_secs(1));
    assert_eq!(first.values(), vec![1, 2]);
    assert_eq!(second.values(), vec![1, 2]);
}

#[test]
fn publish_paces_the_group_at_the_slowest_subscriber() {
    let upstream = TestSource::<i32>::new();
    let connectable = Flow::wrap(upstream.clone()).publish(4);

    let fast = TestSubscriber::unbounded();
    let slow = TestSubscriber::new(1);
    connectable.subscribe_with(fast.clone());
    connectable.subscribe_with(slow.clone());
    connectable.connect();

    upstream.emit(1);
    upstream.emit(2);
    // The second value waits for the slow subscriber's demand.
    assert_eq!(fast.values(), vec![1]);
    assert_eq!(slow.values(), vec![1]);

    slow.request(1);
    assert_eq!(fast.values(), vec![1, 2]);
    assert_eq!(slow.values(), vec![1, 2]);
}

#[test]
fn connect_is_idempotent_while_live() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&subscriptions);
    let connectable = Flow::defer(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Flow::never().map(|x: u64| x)
    })
    .publish(4);

    let a = connectable.connect();
    let b = connectable.connect();
    assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
    assert!(!a.is_cancelled());
    b.cancel();
    // Both handles refer to the same connection.
    assert!(a.is_cancelled());
}

#[test]
fn auto_connect_starts_on_the_kth_subscriber() {
    let upstream = TestSource::<i32>::new();
    let flow = Flow::wrap(upstream.clone()).publish(8).auto_connect(2);

    let first = TestSubscriber::unbounded();
    flow.subscribe_with(first.clone());
    assert!(!upstream.is_subscribed());

    let second = TestSubscriber::unbounded();
    flow.subscribe_with(second.clone());
    assert!(upstream.is_subscribed());
}

#[test]
fn ref_count_disconnects_with_the_last_subscriber() {
    let upstream = TestSource::<i32>::new();
    let flow = Flow::wrap(upstream.clone()).share(8);

    let only = TestSubscriber::unbounded();
    flow.subscribe_with(only.clone());
    assert!(upstream.is_subscribed());

    only.cancel();
    assert!(upstream.is_cancelled());
}

#[test]
fn replay_re_emits_history_to_late_subscribers() {
    let upstream = TestSource::<i32>::new();
    let connectable = Flow::wrap(upstream.clone()).replay(ReplayConfig::count(2));
    connectable.connect();

    upstream.emit(1);
    upstream.emit(2);
    upstream.emit(3);

    // Late subscriber sees only the retained window.
    let late = TestSubscriber::unbounded();
    connectable.subscribe_with(late.clone());
    assert_eq!(late.values(), vec![2, 3]);

    upstream.emit(4);
    assert_eq!(late.values(), vec![2, 3, 4]);

    upstream.complete();
    late.await_terminal(Duration::from_secs(1));
    assert!(late.is_complete());
}

#[test]
fn replay_after_terminal_delivers_history_then_terminal() {
    let connectable = Flow::range(1, 3).replay(ReplayConfig::unbounded());
    connectable.connect();

    let late = TestSubscriber::unbounded();
    connectable.subscribe_with(late.clone());
    late.await_terminal(Duration::from_secs(1));
    assert_eq!(late.values(), vec![1, 2, 3]);
    assert!(late.is_complete());
}

#[test]
fn replay_respects_subscriber_demand() {
    let connectable = Flow::range(1, 5).replay(ReplayConfig::unbounded());
    connectable.connect();

    let paced = TestSubscriber::new(2);
    connectable.subscribe_with(paced.clone());
    assert_eq!(paced.values(), vec![1, 2]);

    paced.request(10);
    paced.await_terminal(Duration::from_secs(1));
    assert_eq!(paced.values(), vec![1, 2, 3, 4, 5]);
}
