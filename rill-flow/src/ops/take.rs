// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Prefix slicing: `take(n)` and `take_while`.
//!
//! Both cancel upstream at the boundary; the element that trips the
//! boundary is the last one delivered (`take`) or the first one dropped
//! (`take_while`).

use crate::ops::Terminal;
use rill_core::{
    FlowError, Source, SourceRef, SubscriberRef, Subscription, SubscriptionCell, Upstream,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub(crate) struct TakeSource<T> {
    upstream: SourceRef<T>,
    limit: u64,
}

impl<T: Send + 'static> TakeSource<T> {
    pub(crate) fn new(upstream: SourceRef<T>, limit: u64) -> Self {
        Self { upstream, limit }
    }
}

impl<T: Send + 'static> Source<T> for TakeSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let stage = Arc::new_cyclic(|me: &Weak<TakeStage<T>>| TakeStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            upstream: SubscriptionCell::new(),
            remaining: AtomicU64::new(self.limit),
            done: Terminal::new(),
        });
        self.upstream.subscribe(stage);
    }
}

struct TakeStage<T: Send + 'static> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    upstream: SubscriptionCell,
    remaining: AtomicU64,
    done: Terminal,
}

impl<T: Send + 'static> rill_core::Subscriber<T> for TakeStage<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if !self.upstream.set(upstream.subscription()) {
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        let subscription: rill_core::SubscriptionRef = me;
        self.downstream.on_subscribe(Upstream::Relay(subscription));
        if self.remaining.load(Ordering::Acquire) == 0 && self.done.enter() {
            self.upstream.cancel();
            self.downstream.on_complete();
        }
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() {
            return;
        }
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
            .unwrap_or(0);
        match previous {
            0 => {}
            1 => {
                if self.done.enter() {
                    self.upstream.cancel();
                    self.downstream.on_next(value);
                    self.downstream.on_complete();
                }
            }
            _ => self.downstream.on_next(value),
        }
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
        if self.done.enter() {
            self.upstream.cancel();
            self.downstream.on_complete();
        }
    }
}

impl<T: Send + 'static> Subscription for TakeStage<T> {
    fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.upstream.cancel();
    }
}

pub(crate) struct TakeWhileSource<T, P> {
    upstream: SourceRef<T>,
    predicate: Arc<P>,
}

impl<T, P> TakeWhileSource<T, P>
where
    T: Send + 'static,
    P: Fn(&T) -> Result<bool, FlowError> + Send + Sync + 'static,
{
    pub(crate) fn new(upstream: SourceRef<T>, predicate: P) -> Self {
        Self {
            upstream,
            predicate: Arc::new(predicate),
        }
    }
}

impl<T, P> Source<T> for TakeWhileSource<T, P>
where
    T: Send + 'static,
    P: Fn(&T) -> Result<bool, FlowError> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let stage = Arc::new(TakeWhileStage {
            downstream: subscriber,
            upstream: SubscriptionCell::new(),
            predicate: Arc::clone(&self.predicate),
            done: Terminal::new(),
        });
        self.upstream.subscribe(stage);
    }
}

struct TakeWhileStage<T: Send + 'static, P> {
    downstream: SubscriberRef<T>,
    upstream: SubscriptionCell,
    predicate: Arc<P>,
    done: Terminal,
}

impl<T, P> rill_core::Subscriber<T> for TakeWhileStage<T, P>
where
    T: Send + 'static,
    P: Fn(&T) -> Result<bool, FlowError> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if !self.upstream.set(rill_core::SubscriptionRef::clone(&subscription)) {
            return;
        }
        self.downstream.on_subscribe(Upstream::Relay(subscription));
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() {
            return;
        }
        match (self.predicate)(&value) {
            Ok(true) => self.downstream.on_next(value),
            Ok(false) => {
                if self.done.enter() {
                    self.upstream.cancel();
                    self.downstream.on_complete();
                }
            }
            Err(error) => {
                if self.done.enter() {
                    self.upstream.cancel();
                    self.downstream.on_error(error);
                } else {
                    Terminal::drop_error(error);
                }
            }
        }
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
        if self.done.enter() {
            self.upstream.cancel();
            self.downstream.on_complete();
        }
    }
}
