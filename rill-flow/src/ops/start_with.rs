// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Empty-sequence fallback.
//!
//! `default_if_empty` tracks whether anything went through; a completion
//! with nothing delivered parks the fallback value until demand allows it
//! out. (`start_with` itself is assembled in the facade as a concat of an
//! iterator source and the upstream; it needs no stage of its own.)

use crate::ops::Terminal;
use parking_lot::Mutex;
use rill_core::{
    Demand, FlowError, Source, SourceRef, SubscriberRef, Subscription, SubscriptionCell, Upstream,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub(crate) struct DefaultIfEmptySource<T> {
    upstream: SourceRef<T>,
    fallback: T,
}

impl<T: Clone + Send + Sync + 'static> DefaultIfEmptySource<T> {
    pub(crate) fn new(upstream: SourceRef<T>, fallback: T) -> Self {
        Self { upstream, fallback }
    }
}

impl<T: Clone + Send + Sync + 'static> Source<T> for DefaultIfEmptySource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let stage = Arc::new_cyclic(|me: &Weak<DefaultIfEmptyStage<T>>| DefaultIfEmptyStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            upstream: SubscriptionCell::new(),
            fallback: Mutex::new(Some(self.fallback.clone())),
            saw_value: AtomicBool::new(false),
            parked: AtomicBool::new(false),
            demand: Demand::new(),
            done: Terminal::new(),
        });
        self.upstream.subscribe(stage);
    }
}

struct DefaultIfEmptyStage<T: Send + 'static> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    upstream: SubscriptionCell,
    fallback: Mutex<Option<T>>,
    saw_value: AtomicBool,
    parked: AtomicBool,
    demand: Demand,
    done: Terminal,
}

impl<T: Send + 'static> DefaultIfEmptyStage<T> {
    fn emit_fallback(&self) {
        if self.done.enter() {
            self.upstream.cancel();
            if let Some(value) = self.fallback.lock().take() {
                self.downstream.on_next(value);
            }
            self.downstream.on_complete();
        }
    }
}

impl<T: Send + 'static> rill_core::Subscriber<T> for DefaultIfEmptyStage<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if !self.upstream.set(upstream.subscription()) {
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        let subscription: rill_core::SubscriptionRef = me;
        self.downstream.on_subscribe(Upstream::Relay(subscription));
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() {
            return;
        }
        self.saw_value.store(true, Ordering::Release);
        self.demand.produce(1);
        self.downstream.on_next(value);
    }

    fn on_error(&self, error: FlowError) {
        if self.done.enter() {
            self.upstream.cancel();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn on_complete(&self) {
        if self.saw_value.load(Ordering::Acquire) {
            if self.done.enter() {
                self.upstream.cancel();
                self.downstream.on_complete();
            }
            return;
        }
        if self.demand.get() > 0 {
            self.emit_fallback();
        } else {
            // No demand yet: the fallback waits for the next request.
            self.parked.store(true, Ordering::Release);
        }
    }
}

impl<T: Send + 'static> Subscription for DefaultIfEmptyStage<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            if self.done.enter() {
                self.upstream.cancel();
                self.downstream.on_error(FlowError::bad_request());
            }
            return;
        }
        self.demand.add(n);
        if self.parked.load(Ordering::Acquire) {
            self.emit_fallback();
            return;
        }
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.fallback.lock().take();
        self.upstream.cancel();
    }
}
