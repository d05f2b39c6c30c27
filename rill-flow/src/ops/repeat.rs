// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Resubscription on completion: the dual of retry.
//!
//! `repeat` resubscribes after a normal completion, up to a bound and
//! while the predicate holds; errors always pass through. `repeat_when`
//! pushes a unit signal into a companion per completion and resubscribes
//! on the companion's next.

use crate::ops::processor::UnicastProcessor;
use crate::ops::Terminal;
use crate::Flow;
use rill_core::{
    Arbiter, FlowError, QueueFactory, Source, SourceRef, SubscriberRef, Subscription, Upstream,
    Wip, UNBOUNDED,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub(crate) struct RepeatSource<T, P> {
    upstream: SourceRef<T>,
    max_repeats: u64,
    predicate: Arc<P>,
}

impl<T, P> RepeatSource<T, P>
where
    T: Send + 'static,
    P: Fn() -> bool + Send + Sync + 'static,
{
    pub(crate) fn new(upstream: SourceRef<T>, max_repeats: u64, predicate: P) -> Self {
        Self {
            upstream,
            max_repeats,
            predicate: Arc::new(predicate),
        }
    }
}

impl<T, P> Source<T> for RepeatSource<T, P>
where
    T: Send + 'static,
    P: Fn() -> bool + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let stage = Arc::new_cyclic(|me: &Weak<RepeatStage<T, P>>| RepeatStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            source: SourceRef::clone(&self.upstream),
            max_repeats: self.max_repeats,
            predicate: Arc::clone(&self.predicate),
            arbiter: Arc::new(Arbiter::new()),
            completions: AtomicU64::new(0),
            handshaken: AtomicBool::new(false),
            hop: Wip::new(),
            done: Terminal::new(),
        });
        stage.resubscribe();
    }
}

struct RepeatStage<T: Send + 'static, P> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    source: SourceRef<T>,
    max_repeats: u64,
    predicate: Arc<P>,
    arbiter: Arc<Arbiter>,
    completions: AtomicU64,
    handshaken: AtomicBool,
    hop: Wip,
    done: Terminal,
}

impl<T, P> RepeatStage<T, P>
where
    T: Send + 'static,
    P: Fn() -> bool + Send + Sync + 'static,
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

impl<T, P> rill_core::Subscriber<T> for RepeatStage<T, P>
where
    T: Send + 'static,
    P: Fn() -> bool + Send + Sync + 'static,
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
        if self.done.enter() {
            self.arbiter.cancel();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn on_complete(&self) {
        if self.done.is_done() {
            return;
        }
        let completion = self.completions.fetch_add(1, Ordering::AcqRel);
        if completion < self.max_repeats && (self.predicate)() {
            self.resubscribe();
            return;
        }
        if self.done.enter() {
            self.arbiter.cancel();
            self.downstream.on_complete();
        }
    }
}

type CompanionFactory<S> = dyn Fn(Flow<()>) -> Flow<S> + Send + Sync;

pub(crate) struct RepeatWhenSource<T, S: Send + 'static> {
    upstream: SourceRef<T>,
    companion: Arc<CompanionFactory<S>>,
}

impl<T, S> RepeatWhenSource<T, S>
where
    T: Send + 'static,
    S: Send + 'static,
{
    pub(crate) fn new(
        upstream: SourceRef<T>,
        companion: impl Fn(Flow<()>) -> Flow<S> + Send + Sync + 'static,
    ) -> Self {
        Self {
            upstream,
            companion: Arc::new(companion),
        }
    }
}

impl<T, S> Source<T> for RepeatWhenSource<T, S>
where
    T: Send + 'static,
    S: Send + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let completions = UnicastProcessor::new(QueueFactory::unbounded());
        let stage = Arc::new_cyclic(|me: &Weak<RepeatWhenStage<T>>| RepeatWhenStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            source: SourceRef::clone(&self.upstream),
            arbiter: Arc::new(Arbiter::new()),
            completions: Arc::clone(&completions),
            companion: rill_core::SubscriptionCell::new(),
            handshaken: AtomicBool::new(false),
            hop: Wip::new(),
            done: Terminal::new(),
        });
        let companion_in = Flow::from_arc_source(Arc::clone(&completions) as Arc<dyn Source<()>>);
        let companion_out = (self.companion)(companion_in);
        let leg: SubscriberRef<S> = Arc::new(RepeatCompanionLeg {
            parent: Arc::downgrade(&stage),
            _marker: std::marker::PhantomData,
        });
        companion_out.subscribe_with(leg);
        stage.resubscribe();
    }
}

struct RepeatWhenStage<T: Send + 'static> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    source: SourceRef<T>,
    arbiter: Arc<Arbiter>,
    completions: Arc<UnicastProcessor<()>>,
    companion: rill_core::SubscriptionCell,
    handshaken: AtomicBool,
    hop: Wip,
    done: Terminal,
}

impl<T: Send + 'static> RepeatWhenStage<T> {
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
            self.completions.cancel();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn finish_complete(&self) {
        if self.done.enter() {
            self.arbiter.cancel();
            self.companion.cancel();
            self.completions.cancel();
            self.downstream.on_complete();
        }
    }
}

impl<T: Send + 'static> rill_core::Subscriber<T> for RepeatWhenStage<T> {
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
        self.finish_error(error);
    }

    fn on_complete(&self) {
        if self.done.is_done() {
            return;
        }
        let _ = self.completions.emit(());
    }
}

struct RepeatCompanionLeg<T: Send + 'static, S: Send + 'static> {
    parent: Weak<RepeatWhenStage<T>>,
    _marker: std::marker::PhantomData<fn() -> S>,
}

impl<T: Send + 'static, S: Send + 'static> rill_core::Subscriber<S> for RepeatCompanionLeg<T, S> {
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
            Some(parent) => parent.finish_error(error),
            None => rill_core::hooks::on_error_dropped(error),
        }
    }

    fn on_complete(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.finish_complete();
        }
    }
}
