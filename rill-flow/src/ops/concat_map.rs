// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Sequential per-element mapping.
//!
//! One outer element is in flight at a time: the stage requests the next
//! outer element only once the inner source it produced has terminated.
//! Inner demand rides the same [`Arbiter`] across inner boundaries, and the
//! outer hand-off is trampolined so synchronous inners do not recurse into
//! the outer request path.

use crate::ops::concat::ErrorMode;
use crate::ops::Terminal;
use crate::Flow;
use parking_lot::Mutex;
use rill_core::{
    Arbiter, FlowError, Scalar, Source, SourceRef, SubscriberRef, Subscription, SubscriptionCell,
    Upstream, Wip,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub(crate) struct ConcatMapSource<T, U, F> {
    upstream: SourceRef<T>,
    mapper: Arc<F>,
    mode: ErrorMode,
    _marker: std::marker::PhantomData<fn(T) -> U>,
}

impl<T, U, F> ConcatMapSource<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    pub(crate) fn new(upstream: SourceRef<T>, mapper: F, mode: ErrorMode) -> Self {
        Self {
            upstream,
            mapper: Arc::new(mapper),
            mode,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, U, F> Source<U> for ConcatMapSource<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<U>) {
        let stage = Arc::new_cyclic(|me: &Weak<ConcatMapStage<T, U, F>>| ConcatMapStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            mapper: Arc::clone(&self.mapper),
            mode: self.mode,
            outer: SubscriptionCell::new(),
            arbiter: Arc::new(Arbiter::new()),
            pending: Mutex::new(None),
            hop: Wip::new(),
            inner_active: AtomicBool::new(false),
            outer_done: AtomicBool::new(false),
            collected: Mutex::new(Vec::new()),
            done: Terminal::new(),
        });
        self.upstream.subscribe(stage);
    }
}

struct ConcatMapStage<T: Send + 'static, U: Send + 'static, F> {
    me: Weak<Self>,
    downstream: SubscriberRef<U>,
    mapper: Arc<F>,
    mode: ErrorMode,
    outer: SubscriptionCell,
    arbiter: Arc<Arbiter>,
    pending: Mutex<Option<T>>,
    hop: Wip,
    inner_active: AtomicBool,
    outer_done: AtomicBool,
    collected: Mutex<Vec<FlowError>>,
    done: Terminal,
}

impl<T, U, F> ConcatMapStage<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    fn halt(&self, error: FlowError) {
        if self.done.enter() {
            self.outer.cancel();
            self.arbiter.cancel();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    /// Error path honoring the configured mode. Inner errors arrive at an
    /// inner boundary, so `Immediate` and `Boundary` coincide here.
    fn boundary_error(&self, error: FlowError) {
        match self.mode {
            ErrorMode::Immediate | ErrorMode::Boundary => self.halt(error),
            ErrorMode::End => {
                self.collected.lock().push(error);
                self.inner_done();
            }
        }
    }

    fn inner_done(&self) {
        self.inner_active.store(false, Ordering::Release);
        if self.outer_done.load(Ordering::Acquire) {
            self.maybe_finish();
        } else {
            self.outer.request(1);
        }
        self.drive();
    }

    fn maybe_finish(&self) {
        if self.outer_done.load(Ordering::Acquire)
            && !self.inner_active.load(Ordering::Acquire)
            && self.pending.lock().is_none()
            && self.done.enter()
        {
            self.outer.cancel();
            self.arbiter.cancel();
            let collected = std::mem::take(&mut *self.collected.lock());
            if collected.is_empty() {
                self.downstream.on_complete();
            } else {
                self.downstream.on_error(FlowError::composite(collected));
            }
        }
    }

    fn drive(&self) {
        if !self.hop.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if !self.done.is_done() && !self.inner_active.load(Ordering::Acquire) {
                let element = self.pending.lock().take();
                match element {
                    Some(element) => self.start_inner(element),
                    None => self.maybe_finish(),
                }
            }
            missed = self.hop.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn start_inner(&self, element: T) {
        let flow = match (self.mapper)(element) {
            Ok(flow) => flow,
            Err(error) => {
                self.boundary_error(error);
                return;
            }
        };
        if let Some(Scalar::Empty) = flow.as_source().scalar() {
            self.inner_done();
            return;
        }
        self.inner_active.store(true, Ordering::Release);
        let Some(me) = self.me.upgrade() else { return };
        let subscriber: SubscriberRef<U> = Arc::new(ConcatMapInner { parent: me });
        flow.subscribe_with(subscriber);
    }
}

impl<T, U, F> rill_core::Subscriber<T> for ConcatMapStage<T, U, F>
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
        let downstream_subscription: rill_core::SubscriptionRef = Arc::clone(&me.arbiter) as rill_core::SubscriptionRef;
        self.downstream
            .on_subscribe(Upstream::Relay(downstream_subscription));
        subscription.request(1);
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() {
            return;
        }
        *self.pending.lock() = Some(value);
        self.drive();
    }

    fn on_error(&self, error: FlowError) {
        self.outer_done.store(true, Ordering::Release);
        match self.mode {
            ErrorMode::Immediate => self.halt(error),
            ErrorMode::Boundary | ErrorMode::End => {
                self.collected.lock().push(error);
                self.drive();
            }
        }
    }

    fn on_complete(&self) {
        self.outer_done.store(true, Ordering::Release);
        self.drive();
    }
}

struct ConcatMapInner<T: Send + 'static, U: Send + 'static, F> {
    parent: Arc<ConcatMapStage<T, U, F>>,
}

impl<T, U, F> rill_core::Subscriber<U> for ConcatMapInner<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<U>) {
        self.parent.arbiter.set_subscription(upstream.subscription());
    }

    fn on_next(&self, value: U) {
        if self.parent.done.is_done() {
            return;
        }
        self.parent.arbiter.produced(1);
        self.parent.downstream.on_next(value);
    }

    fn on_error(&self, error: FlowError) {
        self.parent.boundary_error(error);
    }

    fn on_complete(&self) {
        self.parent.inner_done();
    }
}
