// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Time-shifting stages.
//!
//! `delay` shifts every signal by a fixed duration: values park in a FIFO
//! and each scheduled release emits the head, so equal delays preserve
//! upstream order even if timer callbacks race. `delay_subscription` shifts
//! the subscription itself; demand arriving early is parked in an
//! [`Arbiter`] and transfers once the upstream is live.

use crate::ops::Terminal;
use rill_core::{
    Arbiter, FlowError, QueueFactory, QueueRef, Source, SourceRef, SubscriberRef, Subscription,
    SubscriptionCell, Upstream,
};
use rill_runtime::DelayedExecutorRef;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub(crate) struct DelaySource<T> {
    upstream: SourceRef<T>,
    delay: Duration,
    executor: DelayedExecutorRef,
}

impl<T: Send + 'static> DelaySource<T> {
    pub(crate) fn new(upstream: SourceRef<T>, delay: Duration, executor: DelayedExecutorRef) -> Self {
        Self {
            upstream,
            delay,
            executor,
        }
    }
}

impl<T: Send + 'static> Source<T> for DelaySource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let stage = Arc::new_cyclic(|me: &Weak<DelayStage<T>>| DelayStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            upstream: SubscriptionCell::new(),
            executor: DelayedExecutorRef::clone(&self.executor),
            delay: self.delay,
            pending: QueueFactory::unbounded().create(),
            cancelled: AtomicBool::new(false),
            done: Terminal::new(),
        });
        self.upstream.subscribe(stage);
    }
}

enum Delayed<T> {
    Value(T),
    Error(FlowError),
    Complete,
}

struct DelayStage<T: Send + 'static> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    upstream: SubscriptionCell,
    executor: DelayedExecutorRef,
    delay: Duration,
    pending: QueueRef<Delayed<T>>,
    cancelled: AtomicBool,
    done: Terminal,
}

impl<T: Send + 'static> DelayStage<T> {
    fn schedule_release(&self) {
        let Some(me) = self.me.upgrade() else { return };
        self.executor.schedule(
            Box::new(move || me.release()),
            self.delay,
        );
    }

    fn release(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            self.pending.clear();
            return;
        }
        match self.pending.poll() {
            Some(Delayed::Value(value)) => self.downstream.on_next(value),
            Some(Delayed::Error(error)) => {
                if self.done.enter() {
                    self.upstream.cancel();
                    self.downstream.on_error(error);
                } else {
                    Terminal::drop_error(error);
                }
            }
            Some(Delayed::Complete) => {
                if self.done.enter() {
                    self.upstream.cancel();
                    self.downstream.on_complete();
                }
            }
            None => {}
        }
    }
}

impl<T: Send + 'static> rill_core::Subscriber<T> for DelayStage<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if !self.upstream.set(rill_core::SubscriptionRef::clone(&subscription)) {
            return;
        }
        // Demand passes through undelayed; only emission shifts in time.
        self.downstream.on_subscribe(Upstream::Relay(Arc::new(DelayControl {
            upstream: subscription,
            stage_cancelled: self.me.clone(),
        })));
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let _ = self.pending.offer(Delayed::Value(value));
        self.schedule_release();
    }

    fn on_error(&self, error: FlowError) {
        // Terminals are delayed behind the values so ordering survives.
        let _ = self.pending.offer(Delayed::Error(error));
        self.schedule_release();
    }

    fn on_complete(&self) {
        let _ = self.pending.offer(Delayed::Complete);
        self.schedule_release();
    }
}

struct DelayControl<T: Send + 'static> {
    upstream: rill_core::SubscriptionRef,
    stage_cancelled: Weak<DelayStage<T>>,
}

impl<T: Send + 'static> rill_core::Subscription for DelayControl<T> {
    fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        if let Some(stage) = self.stage_cancelled.upgrade() {
            stage.cancelled.store(true, Ordering::Release);
            stage.pending.clear();
        }
        self.upstream.cancel();
    }
}

pub(crate) struct DelaySubscriptionSource<T> {
    upstream: SourceRef<T>,
    delay: Duration,
    executor: DelayedExecutorRef,
}

impl<T: Send + 'static> DelaySubscriptionSource<T> {
    pub(crate) fn new(upstream: SourceRef<T>, delay: Duration, executor: DelayedExecutorRef) -> Self {
        Self {
            upstream,
            delay,
            executor,
        }
    }
}

impl<T: Send + 'static> Source<T> for DelaySubscriptionSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let arbiter = Arc::new(Arbiter::new());
        let subscription: rill_core::SubscriptionRef = Arc::clone(&arbiter) as rill_core::SubscriptionRef;
        subscriber.on_subscribe(Upstream::Relay(subscription));

        let upstream = SourceRef::clone(&self.upstream);
        self.executor.schedule(
            Box::new(move || {
                if arbiter.is_cancelled() {
                    return;
                }
                let relay: SubscriberRef<T> = Arc::new(LateSubscriber {
                    downstream: subscriber,
                    arbiter,
                });
                upstream.subscribe(relay);
            }),
            self.delay,
        );
    }
}

struct LateSubscriber<T: Send + 'static> {
    downstream: SubscriberRef<T>,
    arbiter: Arc<Arbiter>,
}

impl<T: Send + 'static> rill_core::Subscriber<T> for LateSubscriber<T> {
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
