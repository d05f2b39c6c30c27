// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Backpressure adapters.
//!
//! One stage, four policies: the upstream is driven at unbounded demand
//! and downstream demand selects what happens to elements that arrive with
//! nothing requested: buffer them, drop them (with an optional callback),
//! keep only the latest, or fail with overflow. The facade exposes one
//! wrapper per policy.

use crate::logging::trace_drop;
use crate::ops::Terminal;
use parking_lot::Mutex;
use rill_core::{
    Demand, FlowError, OverflowPolicy, QueueFactory, QueueRef, Source, SourceRef, SubscriberRef,
    Subscription, SubscriptionCell, Upstream, Wip, UNBOUNDED,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type DropHook<T> = dyn Fn(&T) + Send + Sync;

pub(crate) struct BackpressureSource<T> {
    upstream: SourceRef<T>,
    policy: OverflowPolicy,
    on_drop: Option<Arc<DropHook<T>>>,
}

impl<T: Send + 'static> BackpressureSource<T> {
    pub(crate) fn new(
        upstream: SourceRef<T>,
        policy: OverflowPolicy,
        on_drop: Option<Arc<DropHook<T>>>,
    ) -> Self {
        Self {
            upstream,
            policy,
            on_drop,
        }
    }
}

impl<T: Send + 'static> Source<T> for BackpressureSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let stage = Arc::new_cyclic(|me: &Weak<BackpressureStage<T>>| BackpressureStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            upstream: SubscriptionCell::new(),
            policy: self.policy,
            on_drop: self.on_drop.clone(),
            queue: QueueFactory::unbounded().create(),
            latest: Mutex::new(None),
            demand: Demand::new(),
            wip: Wip::new(),
            input_done: AtomicBool::new(false),
            error: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            done: Terminal::new(),
        });
        self.upstream.subscribe(stage);
    }
}

struct BackpressureStage<T: Send + 'static> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    upstream: SubscriptionCell,
    policy: OverflowPolicy,
    on_drop: Option<Arc<DropHook<T>>>,
    queue: QueueRef<T>,
    latest: Mutex<Option<T>>,
    demand: Demand,
    wip: Wip,
    input_done: AtomicBool,
    error: Mutex<Option<FlowError>>,
    cancelled: AtomicBool,
    done: Terminal,
}

impl<T: Send + 'static> BackpressureStage<T> {
    fn halt(&self, error: FlowError) {
        if self.done.enter() {
            self.cancelled.store(true, Ordering::Release);
            self.upstream.cancel();
            self.queue.clear();
            self.latest.lock().take();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.queue.clear();
                self.latest.lock().take();
            } else {
                let mut emitted = 0u64;
                while self.demand.get() > emitted {
                    let value = match self.policy {
                        OverflowPolicy::Buffer => self.queue.poll(),
                        OverflowPolicy::Latest => self.latest.lock().take(),
                        _ => None,
                    };
                    match value {
                        Some(value) => {
                            self.downstream.on_next(value);
                            emitted += 1;
                        }
                        None => break,
                    }
                }
                if emitted > 0 {
                    self.demand.produce(emitted);
                }
                let drained = match self.policy {
                    OverflowPolicy::Buffer => self.queue.is_empty(),
                    OverflowPolicy::Latest => self.latest.lock().is_none(),
                    _ => true,
                };
                if drained && self.input_done.load(Ordering::Acquire) && self.done.enter() {
                    self.upstream.cancel();
                    match self.error.lock().take() {
                        Some(error) => self.downstream.on_error(error),
                        None => self.downstream.on_complete(),
                    }
                }
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Send + 'static> rill_core::Subscriber<T> for BackpressureStage<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if !self.upstream.set(rill_core::SubscriptionRef::clone(&subscription)) {
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        let downstream_subscription: rill_core::SubscriptionRef = me;
        self.downstream
            .on_subscribe(Upstream::Relay(downstream_subscription));
        subscription.request(UNBOUNDED);
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        match self.policy {
            OverflowPolicy::Buffer => {
                let _ = self.queue.offer(value);
                self.drain();
            }
            OverflowPolicy::Latest => {
                *self.latest.lock() = Some(value);
                self.drain();
            }
            OverflowPolicy::Drop => {
                if self.demand.get() > 0 {
                    self.demand.produce(1);
                    self.downstream.on_next(value);
                } else {
                    if let Some(hook) = &self.on_drop {
                        hook(&value);
                    }
                    trace_drop!("on_backpressure_drop: discarding element, demand is zero");
                }
            }
            OverflowPolicy::Error => {
                if self.demand.get() > 0 {
                    self.demand.produce(1);
                    self.downstream.on_next(value);
                } else {
                    self.halt(FlowError::overflow(
                        "element arrived with zero downstream demand",
                    ));
                }
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        match self.policy {
            OverflowPolicy::Buffer | OverflowPolicy::Latest => {
                self.input_done.store(true, Ordering::Release);
                *self.error.lock() = Some(error);
                self.drain();
            }
            _ => self.halt(error),
        }
    }

    fn on_complete(&self) {
        match self.policy {
            OverflowPolicy::Buffer | OverflowPolicy::Latest => {
                self.input_done.store(true, Ordering::Release);
                self.drain();
            }
            _ => {
                if self.done.enter() {
                    self.upstream.cancel();
                    self.downstream.on_complete();
                }
            }
        }
    }
}

impl<T: Send + 'static> Subscription for BackpressureStage<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            self.halt(FlowError::bad_request());
            return;
        }
        self.demand.add(n);
        match self.policy {
            OverflowPolicy::Buffer | OverflowPolicy::Latest => self.drain(),
            _ => {}
        }
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.upstream.cancel();
            self.drain();
        }
    }
}
