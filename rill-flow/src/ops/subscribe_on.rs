// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Executor hand-off for the producer side.
//!
//! The `subscribe` call, and with it the upstream's setup and (for
//! synchronous sources) its emission loop, runs on the configured
//! executor. Demand arriving before the upstream is live parks in an
//! [`Arbiter`]; later `request` calls are themselves re-dispatched so the
//! upstream's request-driven work stays on the executor.

use rill_core::{Arbiter, FlowError, Source, SourceRef, SubscriberRef, Subscription, Upstream};
use rill_runtime::ExecutorRef;
use std::sync::Arc;

pub(crate) struct SubscribeOnSource<T> {
    upstream: SourceRef<T>,
    executor: ExecutorRef,
}

impl<T: Send + 'static> SubscribeOnSource<T> {
    pub(crate) fn new(upstream: SourceRef<T>, executor: ExecutorRef) -> Self {
        Self { upstream, executor }
    }
}

impl<T: Send + 'static> Source<T> for SubscribeOnSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let arbiter = Arc::new(Arbiter::new());
        let control: rill_core::SubscriptionRef = Arc::new(WorkerSubscription {
            arbiter: Arc::clone(&arbiter),
            executor: ExecutorRef::clone(&self.executor),
        });
        subscriber.on_subscribe(Upstream::Relay(control));

        let upstream = SourceRef::clone(&self.upstream);
        self.executor.execute(Box::new(move || {
            if arbiter.is_cancelled() {
                return;
            }
            let relay: SubscriberRef<T> = Arc::new(WorkerSubscriber {
                downstream: subscriber,
                arbiter,
            });
            upstream.subscribe(relay);
        }));
    }
}

struct WorkerSubscription {
    arbiter: Arc<Arbiter>,
    executor: ExecutorRef,
}

impl Subscription for WorkerSubscription {
    fn request(&self, n: u64) {
        let arbiter = Arc::clone(&self.arbiter);
        self.executor.execute(Box::new(move || {
            arbiter.request(n);
        }));
    }

    fn cancel(&self) {
        self.arbiter.cancel();
    }
}

struct WorkerSubscriber<T: Send + 'static> {
    downstream: SubscriberRef<T>,
    arbiter: Arc<Arbiter>,
}

impl<T: Send + 'static> rill_core::Subscriber<T> for WorkerSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.arbiter.set_subscription(upstream.subscription());
    }

    fn on_next(&self, value: T) {
        self.arbiter.produced(1);
        self.downstream.on_next(value);
    }

    fn on_error(&self, error: FlowError) {
        self.arbiter.cancel();
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        self.arbiter.cancel();
        self.downstream.on_complete();
    }
}
