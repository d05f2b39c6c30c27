// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Latch-and-emit sampling.
//!
//! - `sample(period)`: a periodic tick emits the value latched since the
//!   previous tick; ticks with nothing latched (or no demand) emit nothing.
//! - `sample_first(period)`: the first value of each window opens a gate
//!   that a timer closes `period` later; everything behind the gate drops.
//! - `sample_timeout(companion)`: each element starts its own companion
//!   flow; the element is emitted when its companion fires first, and is
//!   superseded when a newer element arrives before that.

use crate::ops::Terminal;
use crate::Flow;
use parking_lot::Mutex;
use rill_core::{
    Demand, FlowError, Source, SourceRef, SubscriberRef, Subscription, SubscriptionCell,
    Upstream, UNBOUNDED,
};
use rill_runtime::DelayedExecutorRef;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub(crate) struct SampleSource<T> {
    upstream: SourceRef<T>,
    period: Duration,
    executor: DelayedExecutorRef,
}

impl<T: Send + 'static> SampleSource<T> {
    pub(crate) fn new(upstream: SourceRef<T>, period: Duration, executor: DelayedExecutorRef) -> Self {
        Self {
            upstream,
            period,
            executor,
        }
    }
}

impl<T: Send + 'static> Source<T> for SampleSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let stage = Arc::new_cyclic(|me: &Weak<SampleStage<T>>| SampleStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            upstream: SubscriptionCell::new(),
            latched: Mutex::new(None),
            demand: Demand::new(),
            timer: Mutex::new(None),
            done: Terminal::new(),
        });
        self.upstream.subscribe(Arc::clone(&stage) as SubscriberRef<T>);
        let weak = Arc::downgrade(&stage);
        let token = self.executor.schedule_periodic(
            Box::new(move || {
                if let Some(stage) = weak.upgrade() {
                    stage.tick();
                }
            }),
            self.period,
            self.period,
        );
        stage.install_timer(token);
    }
}

struct SampleStage<T: Send + 'static> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    upstream: SubscriptionCell,
    latched: Mutex<Option<T>>,
    demand: Demand,
    timer: Mutex<Option<rill_core::CancellationToken>>,
    done: Terminal,
}

impl<T: Send + 'static> SampleStage<T> {
    fn install_timer(&self, token: rill_core::CancellationToken) {
        if self.done.is_done() {
            token.cancel();
        } else {
            *self.timer.lock() = Some(token);
        }
    }

    fn stop_timer(&self) {
        if let Some(token) = self.timer.lock().take() {
            token.cancel();
        }
    }

    fn tick(&self) {
        if self.done.is_done() {
            return;
        }
        if self.demand.get() == 0 {
            // Consumer is not keeping up; this sample is lost, the latch
            // keeps conflating.
            return;
        }
        if let Some(value) = self.latched.lock().take() {
            self.demand.produce(1);
            self.downstream.on_next(value);
        }
    }
}

impl<T: Send + 'static> rill_core::Subscriber<T> for SampleStage<T> {
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
        if self.done.is_done() {
            return;
        }
        *self.latched.lock() = Some(value);
    }

    fn on_error(&self, error: FlowError) {
        self.stop_timer();
        if self.done.enter() {
            self.upstream.cancel();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn on_complete(&self) {
        self.stop_timer();
        if self.done.enter() {
            self.upstream.cancel();
            self.downstream.on_complete();
        }
    }
}

impl<T: Send + 'static> Subscription for SampleStage<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            self.stop_timer();
            if self.done.enter() {
                self.upstream.cancel();
                self.downstream.on_error(FlowError::bad_request());
            }
            return;
        }
        self.demand.add(n);
    }

    fn cancel(&self) {
        self.stop_timer();
        self.latched.lock().take();
        self.upstream.cancel();
    }
}

pub(crate) struct SampleFirstSource<T> {
    upstream: SourceRef<T>,
    period: Duration,
    executor: DelayedExecutorRef,
}

impl<T: Send + 'static> SampleFirstSource<T> {
    pub(crate) fn new(upstream: SourceRef<T>, period: Duration, executor: DelayedExecutorRef) -> Self {
        Self {
            upstream,
            period,
            executor,
        }
    }
}

impl<T: Send + 'static> Source<T> for SampleFirstSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let stage = Arc::new_cyclic(|me: &Weak<SampleFirstStage<T>>| SampleFirstStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            upstream: SubscriptionCell::new(),
            executor: DelayedExecutorRef::clone(&self.executor),
            period: self.period,
            gated: AtomicBool::new(false),
            done: Terminal::new(),
        });
        self.upstream.subscribe(stage);
    }
}

struct SampleFirstStage<T: Send + 'static> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    upstream: SubscriptionCell,
    executor: DelayedExecutorRef,
    period: Duration,
    gated: AtomicBool,
    done: Terminal,
}

impl<T: Send + 'static> rill_core::Subscriber<T> for SampleFirstStage<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if !self.upstream.set(rill_core::SubscriptionRef::clone(&subscription)) {
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        let downstream_subscription: rill_core::SubscriptionRef = me;
        self.downstream
            .on_subscribe(Upstream::Relay(downstream_subscription));
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() {
            return;
        }
        if self.gated.swap(true, Ordering::AcqRel) {
            self.upstream.request(1);
            return;
        }
        self.downstream.on_next(value);
        let Some(me) = self.me.upgrade() else { return };
        self.executor.schedule(
            Box::new(move || {
                me.gated.store(false, Ordering::Release);
            }),
            self.period,
        );
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

impl<T: Send + 'static> Subscription for SampleFirstStage<T> {
    fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.upstream.cancel();
    }
}

pub(crate) struct SampleTimeoutSource<T, C, CF> {
    upstream: SourceRef<T>,
    companion: Arc<CF>,
    _marker: std::marker::PhantomData<fn(T) -> C>,
}

impl<T, C, CF> SampleTimeoutSource<T, C, CF>
where
    T: Clone + Send + 'static,
    C: Send + 'static,
    CF: Fn(&T) -> Flow<C> + Send + Sync + 'static,
{
    pub(crate) fn new(upstream: SourceRef<T>, companion: CF) -> Self {
        Self {
            upstream,
            companion: Arc::new(companion),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, C, CF> Source<T> for SampleTimeoutSource<T, C, CF>
where
    T: Clone + Send + 'static,
    C: Send + 'static,
    CF: Fn(&T) -> Flow<C> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let stage = Arc::new_cyclic(|me: &Weak<SampleTimeoutStage<T>>| SampleTimeoutStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            upstream: SubscriptionCell::new(),
            watchdog: SubscriptionCell::new(),
            start_companion: Mutex::new(None),
            candidate: Mutex::new(None),
            generation: AtomicU64::new(0),
            demand: Demand::new(),
            done: Terminal::new(),
        });
        let companion = Arc::clone(&self.companion);
        let weak = Arc::downgrade(&stage);
        *stage.start_companion.lock() = Some(Box::new(move |value: &T| {
            let Some(stage) = weak.upgrade() else { return };
            let generation = stage.generation.load(Ordering::Acquire);
            let leg: SubscriberRef<C> = Arc::new(CompanionLeg {
                parent: Arc::downgrade(&stage),
                generation,
                _marker: std::marker::PhantomData,
            });
            companion(value).subscribe_with(leg);
        }));
        self.upstream.subscribe(stage);
    }
}

type CompanionStarter<T> = Box<dyn Fn(&T) + Send + Sync>;

struct SampleTimeoutStage<T: Send + 'static> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    upstream: SubscriptionCell,
    watchdog: SubscriptionCell,
    start_companion: Mutex<Option<CompanionStarter<T>>>,
    candidate: Mutex<Option<T>>,
    generation: AtomicU64,
    demand: Demand,
    done: Terminal,
}

impl<T: Send + 'static> SampleTimeoutStage<T> {
    fn fire(&self, generation: u64) {
        if self.done.is_done() || self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        if self.demand.get() == 0 {
            // The settled element is lost to missing demand; conflation is
            // this operator's contract.
            self.candidate.lock().take();
            return;
        }
        if let Some(value) = self.candidate.lock().take() {
            self.demand.produce(1);
            self.downstream.on_next(value);
        }
    }

    fn halt(&self, error: FlowError) {
        if self.done.enter() {
            self.upstream.cancel();
            self.watchdog.cancel();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }
}

impl<T: Clone + Send + 'static> rill_core::Subscriber<T> for SampleTimeoutStage<T> {
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
        if self.done.is_done() {
            return;
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.candidate.lock() = Some(value.clone());
        let starter = self.start_companion.lock();
        if let Some(start) = starter.as_ref() {
            start(&value);
        }
    }

    fn on_error(&self, error: FlowError) {
        self.halt(error);
    }

    fn on_complete(&self) {
        if self.done.enter() {
            self.watchdog.cancel();
            // The pending candidate flushes on completion when demand
            // permits.
            if self.demand.get() > 0 {
                if let Some(value) = self.candidate.lock().take() {
                    self.downstream.on_next(value);
                }
            }
            self.downstream.on_complete();
        }
    }
}

impl<T: Send + 'static> Subscription for SampleTimeoutStage<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            self.halt(FlowError::bad_request());
            return;
        }
        self.demand.add(n);
    }

    fn cancel(&self) {
        self.upstream.cancel();
        self.watchdog.cancel();
        self.candidate.lock().take();
    }
}

struct CompanionLeg<T: Send + 'static, C: Send + 'static> {
    parent: Weak<SampleTimeoutStage<T>>,
    generation: u64,
    _marker: std::marker::PhantomData<fn() -> C>,
}

impl<T: Send + 'static, C: Send + 'static> rill_core::Subscriber<C> for CompanionLeg<T, C> {
    fn on_subscribe(&self, upstream: Upstream<C>) {
        let subscription = upstream.subscription();
        match self.parent.upgrade() {
            Some(parent) if parent.generation.load(Ordering::Acquire) == self.generation => {
                // Superseding the previous companion cancels it.
                parent
                    .watchdog
                    .replace(rill_core::SubscriptionRef::clone(&subscription));
                subscription.request(1);
            }
            _ => subscription.cancel(),
        }
    }

    fn on_next(&self, _signal: C) {
        if let Some(parent) = self.parent.upgrade() {
            parent.fire(self.generation);
        }
    }

    fn on_error(&self, error: FlowError) {
        match self.parent.upgrade() {
            Some(parent) => parent.halt(error),
            None => rill_core::hooks::on_error_dropped(error),
        }
    }

    fn on_complete(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.fire(self.generation);
        }
    }
}
