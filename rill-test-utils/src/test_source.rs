// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Hand-driven producer that records consumer-side control traffic.

use parking_lot::Mutex;
use rill_core::{Demand, FlowError, Source, SubscriberRef, Subscription, Upstream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Single-subscriber producer under test control.
///
/// `emit`/`complete`/`fail` push signals directly; the double records all
/// `request` amounts and whether `cancel` arrived, so tests can check
/// demand conservation and cancellation propagation. Emitting more than
/// the granted demand panics the test, not the stage under test.
pub struct TestSource<T: Send + 'static> {
    inner: Arc<TestSourceInner<T>>,
}

struct TestSourceInner<T: Send + 'static> {
    downstream: Mutex<Option<SubscriberRef<T>>>,
    requests: Mutex<Vec<u64>>,
    demand: Demand,
    cancelled: AtomicBool,
    terminated: AtomicBool,
}

impl<T: Send + 'static> Default for TestSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> TestSource<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TestSourceInner {
                downstream: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
                demand: Demand::new(),
                cancelled: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
            }),
        }
    }

    /// Emits one value, consuming one unit of granted demand.
    ///
    /// # Panics
    /// If no subscriber is attached, the demand is exhausted, or the
    /// source already terminated.
    pub fn emit(&self, value: T) {
        assert!(
            !self.inner.terminated.load(Ordering::Acquire),
            "emit after terminal"
        );
        if self.inner.cancelled.load(Ordering::Acquire) {
            return;
        }
        assert!(
            self.inner.demand.get() > 0,
            "emit without outstanding demand"
        );
        let downstream = self
            .inner
            .downstream
            .lock()
            .clone()
            .expect("no subscriber attached");
        self.inner.demand.produce(1);
        downstream.on_next(value);
    }

    /// Completes the sequence.
    pub fn complete(&self) {
        if self.inner.terminated.swap(true, Ordering::AcqRel)
            || self.inner.cancelled.load(Ordering::Acquire)
        {
            return;
        }
        if let Some(downstream) = self.inner.downstream.lock().clone() {
            downstream.on_complete();
        }
    }

    /// Fails the sequence.
    pub fn fail(&self, error: FlowError) {
        if self.inner.terminated.swap(true, Ordering::AcqRel)
            || self.inner.cancelled.load(Ordering::Acquire)
        {
            return;
        }
        if let Some(downstream) = self.inner.downstream.lock().clone() {
            downstream.on_error(error);
        }
    }

    /// Every `request` amount observed, in order.
    pub fn requests(&self) -> Vec<u64> {
        self.inner.requests.lock().clone()
    }

    /// Total demand granted so far.
    pub fn total_requested(&self) -> u64 {
        self.requests().iter().fold(0, |a, b| a.saturating_add(*b))
    }

    /// Currently outstanding (granted minus produced) demand.
    pub fn outstanding(&self) -> u64 {
        self.inner.demand.get()
    }

    /// `true` once the consumer cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// `true` once a subscriber completed the handshake.
    pub fn is_subscribed(&self) -> bool {
        self.inner.downstream.lock().is_some()
    }
}

impl<T: Send + 'static> Source<T> for TestSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        {
            let mut downstream = self.inner.downstream.lock();
            assert!(downstream.is_none(), "TestSource supports one subscriber");
            *downstream = Some(SubscriberRef::clone(&subscriber));
        }
        let subscription: rill_core::SubscriptionRef = Arc::new(TestSubscription {
            inner: Arc::clone(&self.inner),
        });
        subscriber.on_subscribe(Upstream::Relay(subscription));
    }
}

impl<T: Send + 'static> Clone for TestSource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct TestSubscription<T: Send + 'static> {
    inner: Arc<TestSourceInner<T>>,
}

impl<T: Send + 'static> Subscription for TestSubscription<T> {
    fn request(&self, n: u64) {
        self.inner.requests.lock().push(n);
        self.inner.demand.add(n);
    }

    fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::Subscriber;

    struct Probe;

    impl Subscriber<u32> for Probe {
        fn on_subscribe(&self, upstream: Upstream<u32>) {
            upstream.request(2);
        }

        fn on_next(&self, _value: u32) {}

        fn on_error(&self, _error: FlowError) {}

        fn on_complete(&self) {}
    }

    #[test]
    fn records_requests_and_demand() {
        let source = TestSource::<u32>::new();
        source.subscribe(Arc::new(Probe));
        assert_eq!(source.requests(), vec![2]);
        assert_eq!(source.outstanding(), 2);
        source.emit(7);
        assert_eq!(source.outstanding(), 1);
    }
}
