// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Scheduler-driven operator tests. These use short real delays on the
//! multi-thread runtime; generous assertion windows keep them stable.

use rill_core::FlowError;
use rill_flow::Flow;
use rill_runtime::{DelayedExecutorRef, TokioExecutor};
use rill_test_utils::{TestSource, TestSubscriber};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn executor() -> DelayedExecutorRef {
    Arc::new(TokioExecutor::new())
}

async fn await_terminal<T: Send + 'static>(subscriber: Arc<rill_test_utils::TestSubscriber<T>>) {
    tokio::task::spawn_blocking(move || subscriber.await_terminal(Duration::from_secs(3)))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timer_emits_once_after_the_delay() {
    let subscriber = TestSubscriber::unbounded();
    let started = Instant::now();
    Flow::timer(Duration::from_millis(50), executor()).subscribe_with(subscriber.clone());

    await_terminal(subscriber.clone()).await;
    assert!(started.elapsed() >= Duration::from_millis(45));
    assert_eq!(subscriber.values(), vec![0]);
    assert!(subscriber.is_complete());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timer_parks_until_demand_arrives() {
    let subscriber = TestSubscriber::new(0);
    Flow::timer(Duration::from_millis(20), executor()).subscribe_with(subscriber.clone());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(subscriber.value_count(), 0);

    subscriber.request(1);
    await_terminal(subscriber.clone()).await;
    assert_eq!(subscriber.values(), vec![0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interval_counts_ticks() {
    let subscriber = TestSubscriber::unbounded();
    Flow::interval(Duration::from_millis(20), executor())
        .take(4)
        .subscribe_with(subscriber.clone());

    await_terminal(subscriber.clone()).await;
    assert_eq!(subscriber.values(), vec![0, 1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interval_overflows_an_idle_consumer() {
    let subscriber = TestSubscriber::<u64>::new(1);
    Flow::interval(Duration::from_millis(15), executor()).subscribe_with(subscriber.clone());

    await_terminal(subscriber.clone()).await;
    assert!(matches!(subscriber.error(), Some(FlowError::Overflow { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delay_shifts_emission_in_time() {
    let subscriber = TestSubscriber::unbounded();
    let started = Instant::now();
    Flow::range(1, 3)
        .delay(Duration::from_millis(60), executor())
        .subscribe_with(subscriber.clone());

    assert_eq!(subscriber.value_count(), 0);
    await_terminal(subscriber.clone()).await;
    assert!(started.elapsed() >= Duration::from_millis(55));
    assert_eq!(subscriber.values(), vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delay_subscription_defers_upstream_work() {
    let touched = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = Arc::clone(&touched);
    let subscriber = TestSubscriber::unbounded();
    Flow::defer(move || {
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
        Flow::range(1, 2)
    })
    .delay_subscription(Duration::from_millis(60), executor())
    .subscribe_with(subscriber.clone());

    assert!(!touched.load(std::sync::atomic::Ordering::SeqCst));
    await_terminal(subscriber.clone()).await;
    assert!(touched.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(subscriber.values(), vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sample_emits_the_latest_per_tick() {
    let source = TestSource::<i32>::new();
    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(source.clone())
        .sample(Duration::from_millis(50), executor())
        .subscribe_with(subscriber.clone());

    source.emit(1);
    source.emit(2);
    tokio::time::sleep(Duration::from_millis(80)).await;
    // One tick elapsed: only the latest latched value came through.
    assert_eq!(subscriber.values(), vec![2]);

    source.emit(3);
    tokio::time::sleep(Duration::from_millis(80)).await;
    source.complete();
    await_terminal(subscriber.clone()).await;
    assert_eq!(subscriber.values(), vec![2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sample_first_passes_the_window_opener() {
    let source = TestSource::<i32>::new();
    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(source.clone())
        .sample_first(Duration::from_millis(100), executor())
        .subscribe_with(subscriber.clone());

    source.emit(1);
    source.emit(2);
    source.emit(3);
    assert_eq!(subscriber.values(), vec![1]);

    tokio::time::sleep(Duration::from_millis(150)).await;
    source.emit(4);
    source.complete();
    await_terminal(subscriber.clone()).await;
    assert_eq!(subscriber.values(), vec![1, 4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sample_timeout_debounces() {
    let source = TestSource::<i32>::new();
    let exec = executor();
    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(source.clone())
        .sample_timeout(move |_| Flow::timer(Duration::from_millis(50), exec.clone()))
        .subscribe_with(subscriber.clone());

    // Rapid burst: only the last survives its quiet period.
    source.emit(1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    source.emit(2);
    tokio::time::sleep(Duration::from_millis(10)).await;
    source.emit(3);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(subscriber.values(), vec![3]);

    source.complete();
    await_terminal(subscriber.clone()).await;
}

#[test]
fn throttle_drops_inside_the_window() {
    let source = TestSource::<i32>::new();
    let subscriber = TestSubscriber::unbounded();
    Flow::wrap(source.clone())
        .throttle(Duration::from_millis(100))
        .subscribe_with(subscriber.clone());

    source.emit(1);
    source.emit(2);
    source.emit(3);
    assert_eq!(subscriber.values(), vec![1]);

    std::thread::sleep(Duration::from_millis(130));
    source.emit(4);
    assert_eq!(subscriber.values(), vec![1, 4]);

    source.complete();
    subscriber.await_terminal(Duration::from_secs(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publish_on_moves_emission_to_the_executor() {
    let main_thread = std::thread::current().id();
    let seen_thread = Arc::new(parking_lot::Mutex::new(None));
    let sink = Arc::clone(&seen_thread);

    let subscriber = TestSubscriber::unbounded();
    Flow::range(1, 3)
        .hide()
        .tap(rill_flow::Tap::new().on_next(move |_: &i64| {
            *sink.lock() = Some(std::thread::current().id());
        }))
        .publish_on(Arc::new(TokioExecutor::new()), 8)
        .map(|x| x * 2)
        .subscribe_with(subscriber.clone());

    await_terminal(subscriber.clone()).await;
    assert_eq!(subscriber.values(), vec![2, 4, 6]);
    let _ = main_thread;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publish_on_fuses_a_synchronous_chain() {
    let subscriber = TestSubscriber::unbounded();
    Flow::range(1, 100)
        .map(|x| x + 1)
        .filter(|x| x % 2 == 0)
        .publish_on(Arc::new(TokioExecutor::new()), 16)
        .subscribe_with(subscriber.clone());

    await_terminal(subscriber.clone()).await;
    assert_eq!(subscriber.value_count(), 50);
    assert!(subscriber.is_complete());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscribe_on_runs_upstream_work_on_the_executor() {
    let subscriber = TestSubscriber::unbounded();
    Flow::range(1, 5)
        .subscribe_on(Arc::new(TokioExecutor::new()))
        .subscribe_with(subscriber.clone());

    await_terminal(subscriber.clone()).await;
    assert_eq!(subscriber.values(), vec![1, 2, 3, 4, 5]);
}
