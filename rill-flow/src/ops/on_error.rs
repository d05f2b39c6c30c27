// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Local error recovery.
//!
//! `on_error_resume_with` swaps the failed upstream for a fallback flow
//! built from the cause; the demand still unsatisfied transfers through
//! the [`Arbiter`]. `on_error_return` is the same stage with a scalar
//! fallback, and `map_error` rewrites the cause without recovering.

use crate::ops::Terminal;
use crate::Flow;
use rill_core::{Arbiter, FlowError, Source, SourceRef, SubscriberRef, Subscription, Upstream};
use std::sync::{Arc, Weak};

pub(crate) struct OnErrorResumeSource<T, F> {
    upstream: SourceRef<T>,
    fallback: Arc<F>,
}

impl<T, F> OnErrorResumeSource<T, F>
where
    T: Send + 'static,
    F: Fn(FlowError) -> Flow<T> + Send + Sync + 'static,
{
    pub(crate) fn new(upstream: SourceRef<T>, fallback: F) -> Self {
        Self {
            upstream,
            fallback: Arc::new(fallback),
        }
    }
}

impl<T, F> Source<T> for OnErrorResumeSource<T, F>
where
    T: Send + 'static,
    F: Fn(FlowError) -> Flow<T> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let stage = Arc::new_cyclic(|me: &Weak<ResumeStage<T, F>>| ResumeStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            fallback: Arc::clone(&self.fallback),
            arbiter: Arc::new(Arbiter::new()),
            recovered: std::sync::atomic::AtomicBool::new(false),
            handshaken: std::sync::atomic::AtomicBool::new(false),
            done: Terminal::new(),
        });
        self.upstream.subscribe(stage);
    }
}

struct ResumeStage<T: Send + 'static, F> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    fallback: Arc<F>,
    arbiter: Arc<Arbiter>,
    /// Only one recovery hop; an error in the fallback is terminal.
    recovered: std::sync::atomic::AtomicBool,
    handshaken: std::sync::atomic::AtomicBool,
    done: Terminal,
}

impl<T, F> rill_core::Subscriber<T> for ResumeStage<T, F>
where
    T: Send + 'static,
    F: Fn(FlowError) -> Flow<T> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.arbiter.set_subscription(upstream.subscription());
        if !self
            .handshaken
            .swap(true, std::sync::atomic::Ordering::AcqRel)
        {
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
        if self.recovered.swap(true, std::sync::atomic::Ordering::AcqRel) {
            if self.done.enter() {
                self.arbiter.cancel();
                self.downstream.on_error(error);
            } else {
                Terminal::drop_error(error);
            }
            return;
        }
        let fallback = (self.fallback)(error);
        let Some(me) = self.me.upgrade() else { return };
        let subscriber: SubscriberRef<T> = me;
        fallback.subscribe_with(subscriber);
    }

    fn on_complete(&self) {
        if self.done.enter() {
            self.arbiter.cancel();
            self.downstream.on_complete();
        }
    }
}

pub(crate) struct MapErrorSource<T, F> {
    upstream: SourceRef<T>,
    mapper: Arc<F>,
}

impl<T, F> MapErrorSource<T, F>
where
    T: Send + 'static,
    F: Fn(FlowError) -> FlowError + Send + Sync + 'static,
{
    pub(crate) fn new(upstream: SourceRef<T>, mapper: F) -> Self {
        Self {
            upstream,
            mapper: Arc::new(mapper),
        }
    }
}

impl<T, F> Source<T> for MapErrorSource<T, F>
where
    T: Send + 'static,
    F: Fn(FlowError) -> FlowError + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        self.upstream.subscribe(Arc::new(MapErrorStage {
            downstream: subscriber,
            mapper: Arc::clone(&self.mapper),
            done: Terminal::new(),
        }));
    }
}

struct MapErrorStage<T: Send + 'static, F> {
    downstream: SubscriberRef<T>,
    mapper: Arc<F>,
    done: Terminal,
}

impl<T, F> rill_core::Subscriber<T> for MapErrorStage<T, F>
where
    T: Send + 'static,
    F: Fn(FlowError) -> FlowError + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.downstream
            .on_subscribe(Upstream::Relay(upstream.subscription()));
    }

    fn on_next(&self, value: T) {
        self.downstream.on_next(value);
    }

    fn on_error(&self, error: FlowError) {
        if self.done.enter() {
            self.downstream.on_error((self.mapper)(error));
        } else {
            Terminal::drop_error(error);
        }
    }

    fn on_complete(&self) {
        if self.done.enter() {
            self.downstream.on_complete();
        }
    }
}
