// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Interop tests against the futures ecosystem.

use futures::StreamExt;
use rill_flow::Flow;
use rill_runtime::{ExecutorRef, TokioExecutor};
use rill_test_utils::TestSubscriber;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn into_stream_yields_all_values() {
    let mut stream = Flow::range(1, 5).map(|x| x * 2).into_stream(4);

    let mut collected = Vec::new();
    while let Some(item) = stream.next().await {
        collected.push(item.unwrap());
    }
    assert_eq!(collected, vec![2, 4, 6, 8, 10]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn into_stream_surfaces_errors_as_items() {
    let mut stream = Flow::range(1, 2)
        .concat_with(Flow::fail(rill_core::FlowError::stream("broken")))
        .into_stream(4);

    assert_eq!(stream.next().await.unwrap().unwrap(), 1);
    assert_eq!(stream.next().await.unwrap().unwrap(), 2);
    assert!(stream.next().await.unwrap().is_err());
    assert!(stream.next().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn from_stream_respects_demand() {
    let executor: ExecutorRef = Arc::new(TokioExecutor::new());
    let source = futures::stream::iter(vec![1, 2, 3, 4]);

    let subscriber = TestSubscriber::new(2);
    Flow::from_stream(source, executor).subscribe_with(subscriber.clone());

    tokio::task::spawn_blocking({
        let subscriber = subscriber.clone();
        move || subscriber.await_values(2, Duration::from_secs(2))
    })
    .await
    .unwrap();
    assert_eq!(subscriber.value_count(), 2);

    subscriber.request(10);
    tokio::task::spawn_blocking({
        let subscriber = subscriber.clone();
        move || subscriber.await_terminal(Duration::from_secs(2))
    })
    .await
    .unwrap();
    assert_eq!(subscriber.values(), vec![1, 2, 3, 4]);
    assert!(subscriber.is_complete());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn from_stream_bridges_tokio_channels() {
    let executor: ExecutorRef = Arc::new(TokioExecutor::new());
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<i32>();
    let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);

    let subscriber = TestSubscriber::unbounded();
    Flow::from_stream(stream, executor).subscribe_with(subscriber.clone());

    tx.send(7).unwrap();
    tx.send(8).unwrap();
    drop(tx);

    tokio::task::spawn_blocking({
        let subscriber = subscriber.clone();
        move || subscriber.await_terminal(Duration::from_secs(2))
    })
    .await
    .unwrap();
    assert_eq!(subscriber.values(), vec![7, 8]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn round_trip_through_both_bridges() {
    let executor: ExecutorRef = Arc::new(TokioExecutor::new());
    let original = Flow::range(1, 10);
    let stream = original.into_stream(4).map(|item| item.unwrap());

    let subscriber = TestSubscriber::unbounded();
    Flow::from_stream(stream, executor).subscribe_with(subscriber.clone());

    tokio::task::spawn_blocking({
        let subscriber = subscriber.clone();
        move || subscriber.await_terminal(Duration::from_secs(2))
    })
    .await
    .unwrap();
    assert_eq!(subscriber.values(), (1..=10).collect::<Vec<i64>>());
}
