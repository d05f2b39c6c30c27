// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Switch to the newest inner source.
//!
//! Every outer element cancels the active inner subscription and starts a
//! new one; stale inner signals are identified by a generation counter and
//! dropped. Outer completion defers to the last live inner. The inner
//! demand chain rides an [`Arbiter`], so the unsatisfied remainder of the
//! downstream demand transfers to each replacement inner.

use crate::ops::Terminal;
use crate::Flow;
use rill_core::{
    Arbiter, FlowError, Source, SourceRef, SubscriberRef, Subscription, SubscriptionCell,
    Upstream, UNBOUNDED,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub(crate) struct SwitchMapSource<T, U, F> {
    upstream: SourceRef<T>,
    mapper: Arc<F>,
    _marker: std::marker::PhantomData<fn(T) -> U>,
}

impl<T, U, F> SwitchMapSource<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    pub(crate) fn new(upstream: SourceRef<T>, mapper: F) -> Self {
        Self {
            upstream,
            mapper: Arc::new(mapper),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, U, F> Source<U> for SwitchMapSource<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<U>) {
        let stage = Arc::new_cyclic(|me: &Weak<SwitchMapStage<T, U, F>>| SwitchMapStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            mapper: Arc::clone(&self.mapper),
            outer: SubscriptionCell::new(),
            inner_arbiter: Arc::new(Arbiter::new()),
            generation: AtomicU64::new(0),
            inner_active: AtomicBool::new(false),
            outer_done: AtomicBool::new(false),
            done: Terminal::new(),
            _marker: std::marker::PhantomData,
        });
        self.upstream.subscribe(stage);
    }
}

struct SwitchMapStage<T: Send + 'static, U: Send + 'static, F> {
    me: Weak<Self>,
    downstream: SubscriberRef<U>,
    mapper: Arc<F>,
    outer: SubscriptionCell,
    inner_arbiter: Arc<Arbiter>,
    generation: AtomicU64,
    inner_active: AtomicBool,
    outer_done: AtomicBool,
    done: Terminal,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, U, F> SwitchMapStage<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    fn halt(&self, error: FlowError) {
        if self.done.enter() {
            self.outer.cancel();
            self.inner_arbiter.cancel();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn maybe_complete(&self) {
        if self.outer_done.load(Ordering::Acquire)
            && !self.inner_active.load(Ordering::Acquire)
            && self.done.enter()
        {
            self.outer.cancel();
            self.inner_arbiter.cancel();
            self.downstream.on_complete();
        }
    }
}

impl<T, U, F> rill_core::Subscriber<T> for SwitchMapStage<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if !self.outer.set(rill_core::SubscriptionRef::clone(&subscription)) {
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        let downstream_subscription: rill_core::SubscriptionRef = me;
        self.downstream
            .on_subscribe(Upstream::Relay(downstream_subscription));
        // Outer elements are consumed eagerly; only inner emission is
        // governed by downstream demand.
        subscription.request(UNBOUNDED);
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() {
            return;
        }
        let inner = match (self.mapper)(value) {
            Ok(flow) => flow,
            Err(error) => {
                self.halt(error);
                return;
            }
        };
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner_active.store(true, Ordering::Release);
        let Some(me) = self.me.upgrade() else { return };
        let subscriber: SubscriberRef<U> = Arc::new(SwitchInner {
            parent: me,
            generation,
        });
        inner.subscribe_with(subscriber);
    }

    fn on_error(&self, error: FlowError) {
        self.halt(error);
    }

    fn on_complete(&self) {
        self.outer_done.store(true, Ordering::Release);
        self.maybe_complete();
    }
}

impl<T, U, F> Subscription for SwitchMapStage<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        self.inner_arbiter.request(n);
    }

    fn cancel(&self) {
        self.outer.cancel();
        self.inner_arbiter.cancel();
    }
}

struct SwitchInner<T: Send + 'static, U: Send + 'static, F> {
    parent: Arc<SwitchMapStage<T, U, F>>,
    generation: u64,
}

impl<T, U, F> SwitchInner<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    fn is_current(&self) -> bool {
        self.parent.generation.load(Ordering::Acquire) == self.generation
    }
}

impl<T, U, F> rill_core::Subscriber<U> for SwitchInner<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<U>) {
        let subscription = upstream.subscription();
        if self.is_current() {
            // Cancel-on-replace inside the arbiter retires the superseded
            // inner; the unsatisfied demand transfers to this one.
            self.parent.inner_arbiter.set_subscription(subscription);
        } else {
            subscription.cancel();
        }
    }

    fn on_next(&self, value: U) {
        if self.is_current() && !self.parent.done.is_done() {
            self.parent.inner_arbiter.produced(1);
            self.parent.downstream.on_next(value);
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.is_current() {
            self.parent.halt(error);
        } else {
            rill_core::hooks::on_error_dropped(error);
        }
    }

    fn on_complete(&self) {
        if self.is_current() {
            self.parent.inner_active.store(false, Ordering::Release);
            self.parent.maybe_complete();
        }
    }
}
