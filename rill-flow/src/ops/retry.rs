// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Resubscription on error.
//!
//! `retry` resubscribes the original source on a matching error, up to a
//! bounded number of attempts, carrying the unsatisfied demand across
//! attempts through the [`Arbiter`]. The resubscribe hop is trampolined:
//! a source that fails synchronously drains its attempts in a loop rather
//! than recursing. `retry_when` externalizes the decision: errors are
//! pushed into a companion flow, whose `next` triggers the resubscription
//! and whose terminal ends the chain.

use crate::ops::processor::UnicastProcessor;
use crate::ops::Terminal;
use crate::Flow;
use parking_lot::Mutex;
use rill_core::{
    Arbiter, FlowError, QueueFactory, Source, SourceRef, SubscriberRef, Subscription, Upstream,
    Wip, UNBOUNDED,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub(crate) struct RetrySource<T, P> {
    upstream: SourceRef<T>,
    max_retries: u64,
    predicate: Arc<P>,
}

impl<T, P> RetrySource<T, P>
where
    T: Send + 'static,
    P: Fn(&FlowError) -> bool + Send + Sync + 'static,
{
    pub(crate) fn new(upstream: SourceRef<T>, max_retries: u64, predicate: P) -> Self {
        Self {
            upstream,
            max_retries,
            predicate: Arc::new(predicate),
        }
    }
}

impl<T, P> Source<T> for RetrySource<T, P>
where
    T: Send + 'static,
    P: Fn(&FlowError) -> bool + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let stage = Arc::new_cyclic(|me: &Weak<RetryStage<T, P>>| RetryStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            source: SourceRef::clone(&self.upstream),
            max_retries: self.max_retries,
            predicate: Arc::clone(&self.predicate),
            arbiter: Arc::new(Arbiter::new()),
            attempts: AtomicU64::new(0),
            handshaken: AtomicBool::new(false),
            hop: Wip::new(),
            done: Terminal::new(),
        });
        stage.resubscribe();
    }
}

struct RetryStage<T: Send + 'static, P> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    source: SourceRef<T>,
    max_retries: u64,
    predicate: Arc<P>,
    arbiter: Arc<Arbiter>,
    attempts: AtomicU64,
    handshaken: AtomicBool,
    hop: Wip,
    done: Terminal,
}

impl<T, P> RetryStage<T, P>
where
    T: Send + 'static,
    P: Fn(&FlowError) -> bool + Send + Sync + 'static,
{
    fn resubscribe(&self) {
        if !self.hop.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if !self.arbiter.is_cancelled() && !self.done.is_done() {
                if let Some(me) = self.me.upgrade() {
                    let subscriber: SubscriberRef<T> = me;
                    self.source.subscribe(subscriber);
                }
            }
            missed = self.hop.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T, P> rill_core::Subscriber<T> for RetryStage<T, P>
where
    T: Send + 'static,
    P: Fn(&FlowError) -> bool + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.arbiter.set_subscription(upstream.subscription());
        if !self.handshaken.swap(true, Ordering::AcqRel) {
            let subscription: rill_core::SubscriptionRef = Arc::clone(&self.arbiter) as rill_core::SubscriptionRef;
            self.downstream.on_subscribe(Upstream::Relay(subscription));
        }
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() {
            return;
        }
        self.arbiter.produced(1);
        self.downstream.on_next(value);
    }

    fn on_error(&self, error: FlowError) {
        if self.done.is_done() {
            Terminal::drop_error(error);
            return;
        }
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel);
        if attempt < self.max_retries && (self.predicate)(&error) {
            self.resubscribe();
            return;
        }
        if self.done.enter() {
            self.arbiter.cancel();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn on_complete(&self) {
        if self.done.enter() {
            self.arbiter.cancel();
            self.downstream.on_complete();
        }
    }
}

type CompanionFactory<S> = dyn Fn(Flow<FlowError>) -> Flow<S> + Send + Sync;

pub(crate) struct RetryWhenSource<T, S: Send + 'static> {
    upstream: SourceRef<T>,
    companion: Arc<CompanionFactory<S>>,
}

impl<T, S> RetryWhenSource<T, S>
where
    T: Send + 'static,
    S: Send + 'static,
{
    pub(crate) fn new(
        upstream: SourceRef<T>,
        companion: impl Fn(Flow<FlowError>) -> Flow<S> + Send + Sync + 'static,
    ) -> Self {
        Self {
            upstream,
            companion: Arc::new(companion),
        }
    }
}

impl<T, S> Source<T> for RetryWhenSource<T, S>
where
    T: Send + 'static,
    S: Send + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let errors = UnicastProcessor::new(QueueFactory::unbounded());
        let stage = Arc::new_cyclic(|me: &Weak<RetryWhenStage<T>>| RetryWhenStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            source: SourceRef::clone(&self.upstream),
            arbiter: Arc::new(Arbiter::new()),
            errors: Arc::clone(&errors),
            last_error: Mutex::new(None),
            companion: rill_core::SubscriptionCell::new(),
            handshaken: AtomicBool::new(false),
            hop: Wip::new(),
            done: Terminal::new(),
        });
        let companion_in = Flow::from_arc_source(Arc::clone(&errors) as Arc<dyn Source<FlowError>>);
        let companion_out = (self.companion)(companion_in);
        let leg: SubscriberRef<S> = Arc::new(RetryCompanionLeg {
            parent: Arc::downgrade(&stage),
            _marker: std::marker::PhantomData,
        });
        companion_out.subscribe_with(leg);
        stage.resubscribe();
    }
}

struct RetryWhenStage<T: Send + 'static> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    source: SourceRef<T>,
    arbiter: Arc<Arbiter>,
    errors: Arc<UnicastProcessor<FlowError>>,
    last_error: Mutex<Option<FlowError>>,
    companion: rill_core::SubscriptionCell,
    handshaken: AtomicBool,
    hop: Wip,
    done: Terminal,
}

impl<T: Send + 'static> RetryWhenStage<T> {
    fn resubscribe(&self) {
        if !self.hop.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if !self.arbiter.is_cancelled() && !self.done.is_done() {
                if let Some(me) = self.me.upgrade() {
                    let subscriber: SubscriberRef<T> = me;
                    self.source.subscribe(subscriber);
                }
            }
            missed = self.hop.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn finish_error(&self, error: FlowError) {
        if self.done.enter() {
            self.arbiter.cancel();
            self.companion.cancel();
            self.errors.cancel();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn finish_complete(&self) {
        if self.done.enter() {
            self.arbiter.cancel();
            self.companion.cancel();
            self.errors.cancel();
            self.downstream.on_complete();
        }
    }
}

impl<T: Send + 'static> rill_core::Subscriber<T> for RetryWhenStage<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.arbiter.set_subscription(upstream.subscription());
        if !self.handshaken.swap(true, Ordering::AcqRel) {
            let subscription: rill_core::SubscriptionRef = Arc::clone(&self.arbiter) as rill_core::SubscriptionRef;
            self.downstream.on_subscribe(Upstream::Relay(subscription));
        }
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() {
            return;
        }
        self.arbiter.produced(1);
        self.downstream.on_next(value);
    }

    fn on_error(&self, error: FlowError) {
        if self.done.is_done() {
            Terminal::drop_error(error);
            return;
        }
        *self.last_error.lock() = Some(error.clone());
        // The companion decides: its next resubscribes, its terminal ends
        // the chain.
        if self.errors.emit(error).is_err() {
            self.finish_error(FlowError::overflow("retry companion conduit rejected an error"));
        }
    }

    fn on_complete(&self) {
        self.finish_complete();
    }
}

struct RetryCompanionLeg<T: Send + 'static, S: Send + 'static> {
    parent: Weak<RetryWhenStage<T>>,
    _marker: std::marker::PhantomData<fn() -> S>,
}

impl<T: Send + 'static, S: Send + 'static> rill_core::Subscriber<S> for RetryCompanionLeg<T, S> {
    fn on_subscribe(&self, upstream: Upstream<S>) {
        let subscription = upstream.subscription();
        match self.parent.upgrade() {
            Some(parent) if !parent.done.is_done() => {
                if parent
                    .companion
                    .set(rill_core::SubscriptionRef::clone(&subscription))
                {
                    subscription.request(UNBOUNDED);
                }
            }
            _ => subscription.cancel(),
        }
    }

    fn on_next(&self, _go: S) {
        if let Some(parent) = self.parent.upgrade() {
            parent.resubscribe();
        }
    }

    fn on_error(&self, error: FlowError) {
        match self.parent.upgrade() {
            Some(parent) => {
                // A companion that fails during recovery compounds the
                // pending cause.
                let pending = parent.last_error.lock().take();
                let error = match pending {
                    Some(pending) => FlowError::composite(vec![pending, error]),
                    None => error,
                };
                parent.finish_error(error);
            }
            None => rill_core::hooks::on_error_dropped(error),
        }
    }

    fn on_complete(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.finish_complete();
        }
    }
}
