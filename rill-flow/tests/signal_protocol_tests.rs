// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Protocol-law tests: signal grammar, demand conservation, cancellation
//! finality and the request-validation rule.

use rill_core::{FlowError, Signal};
use rill_flow::Flow;
use rill_test_utils::{TestSource, TestSubscriber};
use std::time::Duration;

fn assert_signal_law<T>(signals: &[Signal<T>]) {
    // Arrange: the grammar is Subscribe (Next)* (Error|Complete)?
    assert!(
        matches!(signals.first(), Some(Signal::Subscribe)),
        "first signal must be the handshake"
    );
    let terminals = signals.iter().filter(|s| s.is_terminal()).count();
    assert!(terminals <= 1, "at most one terminal, saw {terminals}");
    if terminals == 1 {
        assert!(
            signals.last().is_some_and(Signal::is_terminal),
            "nothing may follow the terminal"
        );
    }
    for (index, signal) in signals.iter().enumerate() {
        if index > 0 {
            assert!(
                !matches!(signal, Signal::Subscribe),
                "duplicate subscribe at position {index}"
            );
        }
    }
}

#[test]
fn completed_sequence_obeys_signal_law() {
    let subscriber = TestSubscriber::unbounded();
    Flow::range(1, 5).subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    assert_signal_law(&subscriber.signals());
    assert_eq!(subscriber.values(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn failed_sequence_obeys_signal_law() {
    let subscriber = TestSubscriber::<i64>::unbounded();
    Flow::range(1, 3)
        .concat_with(Flow::fail(FlowError::stream("boom")))
        .subscribe_with(subscriber.clone());

    subscriber.await_terminal(Duration::from_secs(1));
    assert_signal_law(&subscriber.signals());
    assert_eq!(subscriber.values(), vec![1, 2, 3]);
    assert!(subscriber.error().is_some());
    assert!(!subscriber.is_complete());
}

#[test]
fn items_delivered_never_exceed_items_requested() {
    // Arrange
    let source = TestSource::<u32>::new();
    let subscriber = TestSubscriber::new(0);
    Flow::wrap(source.clone()).subscribe_with(subscriber.clone());

    // Act: grant three, try to emit four.
    subscriber.request(3);
    source.emit(1);
    source.emit(2);
    assert_eq!(source.outstanding(), 1);
    source.emit(3);

    // Assert
    assert_eq!(source.outstanding(), 0);
    assert_eq!(subscriber.values(), vec![1, 2, 3]);
}

#[test]
fn demand_passes_through_stateless_stages_one_to_one() {
    let source = TestSource::<u32>::new();
    let subscriber = TestSubscriber::new(0);
    Flow::wrap(source.clone())
        .map(|x| x * 10)
        .subscribe_with(subscriber.clone());

    subscriber.request(2);
    assert_eq!(source.total_requested(), 2);
    source.emit(1);
    source.emit(2);
    assert_eq!(subscriber.values(), vec![10, 20]);
    source.complete();
    subscriber.await_terminal(Duration::from_secs(1));
}

#[test]
fn filter_compensates_dropped_elements_upstream() {
    let source = TestSource::<u32>::new();
    let subscriber = TestSubscriber::new(0);
    Flow::wrap(source.clone())
        .filter(|x| x % 2 == 0)
        .subscribe_with(subscriber.clone());

    subscriber.request(2);
    source.emit(1); // dropped -> stage must request one replacement
    source.emit(2);
    source.emit(3); // dropped
    source.emit(4);

    assert_eq!(subscriber.values(), vec![2, 4]);
    // 2 initial + one compensation per dropped element.
    assert_eq!(source.total_requested(), 4);
}

#[test]
fn cancellation_is_final() {
    let source = TestSource::<u32>::new();
    let subscriber = TestSubscriber::new(10);
    Flow::wrap(source.clone()).subscribe_with(subscriber.clone());

    source.emit(1);
    subscriber.cancel();
    assert!(source.is_cancelled());

    // Late signals are swallowed by the cancelled edge.
    source.emit(2);
    source.complete();
    assert_eq!(subscriber.values(), vec![1]);
    assert!(!subscriber.is_terminated());
}

#[test]
fn zero_request_surfaces_protocol_violation() {
    let subscriber = TestSubscriber::<i64>::new(0);
    Flow::range(1, 5).subscribe_with(subscriber.clone());

    subscriber.request(0);
    subscriber.await_terminal(Duration::from_secs(1));
    assert!(matches!(
        subscriber.error(),
        Some(FlowError::Protocol { .. })
    ));
}

#[test]
fn zero_request_on_never_surfaces_protocol_violation() {
    // never() has no terminal of its own, so the violation must come from
    // its subscription rather than ride on an imminent terminal.
    let subscriber = TestSubscriber::<i64>::new(0);
    Flow::never().subscribe_with(subscriber.clone());

    subscriber.request(0);
    subscriber.await_terminal(Duration::from_secs(1));
    assert!(matches!(
        subscriber.error(),
        Some(FlowError::Protocol { .. })
    ));
    // The violation is terminal; later grants change nothing.
    subscriber.request(5);
    subscriber.assert_quiet(Duration::from_millis(30));
}

#[test]
fn map_identity_is_signal_equivalent_to_source() {
    let plain = TestSubscriber::unbounded();
    Flow::range(1, 4).subscribe_with(plain.clone());
    plain.await_terminal(Duration::from_secs(1));

    let mapped = TestSubscriber::unbounded();
    Flow::range(1, 4).map(|x| x).subscribe_with(mapped.clone());
    mapped.await_terminal(Duration::from_secs(1));

    assert_eq!(plain.signals(), mapped.signals());
}

#[test]
fn filter_is_idempotent() {
    let once = TestSubscriber::unbounded();
    Flow::range(1, 10).filter(|x| x % 3 == 0).subscribe_with(once.clone());
    once.await_terminal(Duration::from_secs(1));

    let twice = TestSubscriber::unbounded();
    Flow::range(1, 10)
        .filter(|x| x % 3 == 0)
        .filter(|x| x % 3 == 0)
        .subscribe_with(twice.clone());
    twice.await_terminal(Duration::from_secs(1));

    assert_eq!(once.values(), twice.values());
    assert_eq!(once.values(), vec![3, 6, 9]);
}

#[test]
fn cold_source_replays_per_subscriber() {
    let flow = Flow::range(1, 4).map(|x| x * 2);
    for _ in 0..3 {
        let subscriber = TestSubscriber::unbounded();
        flow.clone().subscribe_with(subscriber.clone());
        subscriber.await_terminal(Duration::from_secs(1));
        assert_eq!(subscriber.values(), vec![2, 4, 6, 8]);
    }
}
