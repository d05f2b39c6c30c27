// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Partitioning tests.

use rill_flow::Flow;
use rill_test_utils::TestSubscriber;
use std::time::Duration;

#[test]
fn group_by_partitions_by_key() {
    // range(1,10) keyed by parity, each substream collected into a list.
    let subscriber = TestSubscriber::unbounded();
    Flow::range(1, 10)
        .group_by(|x| x % 2)
        .flat_map(|group| {
            let key = *group.key();
            group.flow().to_list().into_flow().map(move |list| (key, list))
        })
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    let mut partitions = subscriber.values();
    partitions.sort_by_key(|(key, _)| *key);
    assert_eq!(
        partitions,
        vec![(0, vec![2, 4, 6, 8, 10]), (1, vec![1, 3, 5, 7, 9])]
    );
}

#[test]
fn group_by_emits_each_group_once() {
    let subscriber = TestSubscriber::unbounded();
    Flow::from_iter(vec!["ant", "bee", "asp", "bat", "auk"])
        .group_by(|word: &&str| word.as_bytes()[0])
        .flat_map(|group| group.flow().count().into_flow())
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    let mut counts = subscriber.values();
    counts.sort_unstable();
    // Two groups: 'a' with three members, 'b' with two.
    assert_eq!(counts, vec![2, 3]);
}

#[test]
fn group_by_map_projects_values() {
    let subscriber = TestSubscriber::unbounded();
    Flow::range(1, 6)
        .group_by_map(|x| x % 2, |x| Ok(x * 10))
        .flat_map(|group| group.flow().to_list().into_flow())
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    let mut lists = subscriber.values();
    lists.sort();
    assert_eq!(lists, vec![vec![10, 30, 50], vec![20, 40, 60]]);
}

#[test]
fn outer_cancellation_cancels_open_groups() {
    let groups = TestSubscriber::new(1);
    Flow::range(1, 10)
        .group_by(|x| x % 2)
        .map(|group| {
            let probe: std::sync::Arc<TestSubscriber<i64>> = TestSubscriber::new(0);
            group.flow().subscribe_with(probe.clone());
            probe
        })
        .subscribe_with(groups.clone());

    groups.await_values(1, Duration::from_secs(1));
    groups.cancel();
    let probes = groups.values();
    // Give cancellation a moment to reach the substream.
    std::thread::sleep(Duration::from_millis(50));
    for probe in probes {
        probe.request(100);
        probe.assert_quiet(Duration::from_millis(30));
    }
}
