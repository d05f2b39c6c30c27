// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Per-item watchdogs.
//!
//! Each awaited element has a companion flow racing it: the first-element
//! watchdog starts at subscription, and every delivered element starts a
//! fresh per-item companion. If a companion signals before the next element
//! arrives, the stage either terminates with a timeout error or switches to
//! the fallback flow; the unsatisfied demand transfers to the fallback
//! through the stage [`Arbiter`]. Upstream elements arriving after the
//! watchdog has fired are dropped; the race has been decided.

use crate::ops::Terminal;
use crate::Flow;
use rill_core::{
    Arbiter, FlowError, Source, SourceRef, SubscriberRef, Subscription, SubscriptionCell,
    Upstream,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

type FirstCompanion<C> = Box<dyn Fn() -> Flow<C> + Send + Sync>;
type ItemCompanion<T, C> = Box<dyn Fn(&T) -> Flow<C> + Send + Sync>;

pub(crate) struct TimeoutSource<T: Send + 'static, C: Send + 'static> {
    upstream: SourceRef<T>,
    first: Arc<FirstCompanion<C>>,
    per_item: Arc<ItemCompanion<T, C>>,
    fallback: Option<Flow<T>>,
    /// Reported in the timeout error; `None` for companion-driven
    /// watchdogs with no single duration.
    duration_hint: Option<Duration>,
}

impl<T, C> TimeoutSource<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    pub(crate) fn new(
        upstream: SourceRef<T>,
        first: FirstCompanion<C>,
        per_item: ItemCompanion<T, C>,
        fallback: Option<Flow<T>>,
        duration_hint: Option<Duration>,
    ) -> Self {
        Self {
            upstream,
            first: Arc::new(first),
            per_item: Arc::new(per_item),
            fallback,
            duration_hint,
        }
    }
}

impl<T, C> Source<T> for TimeoutSource<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let stage = Arc::new_cyclic(|me: &Weak<TimeoutStage<T, C>>| TimeoutStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            upstream: SubscriptionCell::new(),
            watchdog: SubscriptionCell::new(),
            arbiter: Arc::new(Arbiter::new()),
            per_item: Arc::clone(&self.per_item),
            fallback: parking_lot::Mutex::new(self.fallback.clone()),
            duration_hint: self.duration_hint,
            generation: AtomicU64::new(0),
            switched: AtomicBool::new(false),
            done: Terminal::new(),
        });
        let first = Arc::clone(&self.first);
        let stage_for_watchdog = Arc::clone(&stage);
        self.upstream.subscribe(Arc::clone(&stage) as SubscriberRef<T>);
        // The first-element watchdog races the data path from the start.
        stage_for_watchdog.arm(first());
    }
}

struct TimeoutStage<T: Send + 'static, C: Send + 'static> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    upstream: SubscriptionCell,
    watchdog: SubscriptionCell,
    arbiter: Arc<Arbiter>,
    per_item: Arc<ItemCompanion<T, C>>,
    fallback: parking_lot::Mutex<Option<Flow<T>>>,
    duration_hint: Option<Duration>,
    generation: AtomicU64,
    switched: AtomicBool,
    done: Terminal,
}

impl<T, C> TimeoutStage<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    fn arm(&self, companion: Flow<C>) {
        if self.done.is_done() || self.switched.load(Ordering::Acquire) {
            return;
        }
        let generation = self.generation.load(Ordering::Acquire);
        let Some(me) = self.me.upgrade() else { return };
        let leg: SubscriberRef<C> = Arc::new(WatchdogLeg {
            parent: Arc::downgrade(&me),
            generation,
        });
        companion.subscribe_with(leg);
    }

    fn fired(&self, generation: u64) {
        if self.generation.load(Ordering::Acquire) != generation
            || self.switched.load(Ordering::Acquire)
            || self.done.is_done()
        {
            return;
        }
        let fallback = self.fallback.lock().take();
        match fallback {
            Some(fallback) => {
                if self.switched.swap(true, Ordering::AcqRel) {
                    return;
                }
                self.upstream.cancel();
                self.watchdog.cancel();
                let Some(me) = self.me.upgrade() else { return };
                let relay: SubscriberRef<T> = Arc::new(FallbackRelay {
                    parent: Arc::downgrade(&me),
                });
                fallback.subscribe_with(relay);
            }
            None => {
                if self.done.enter() {
                    self.upstream.cancel();
                    self.watchdog.cancel();
                    let error = match self.duration_hint {
                        Some(after) => FlowError::timeout(after),
                        None => FlowError::stream("companion watchdog fired before the next element"),
                    };
                    self.downstream.on_error(error);
                }
            }
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

impl<T, C> rill_core::Subscriber<T> for TimeoutStage<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if !self.upstream.set(rill_core::SubscriptionRef::clone(&subscription)) {
            return;
        }
        self.arbiter.set_subscription(subscription);
        let Some(me) = self.me.upgrade() else { return };
        let downstream_subscription: rill_core::SubscriptionRef = Arc::clone(&me.arbiter) as rill_core::SubscriptionRef;
        self.downstream
            .on_subscribe(Upstream::Relay(downstream_subscription));
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() || self.switched.load(Ordering::Acquire) {
            // The watchdog decided the race; late arrivals are dropped.
            return;
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.watchdog.cancel_current();
        self.arbiter.produced(1);
        let companion = (self.per_item)(&value);
        self.downstream.on_next(value);
        self.arm(companion);
    }

    fn on_error(&self, error: FlowError) {
        if self.switched.load(Ordering::Acquire) {
            Terminal::drop_error(error);
            return;
        }
        self.halt(error);
    }

    fn on_complete(&self) {
        if self.switched.load(Ordering::Acquire) {
            return;
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        if self.done.enter() {
            self.upstream.cancel();
            self.watchdog.cancel();
            self.downstream.on_complete();
        }
    }
}

struct WatchdogLeg<T: Send + 'static, C: Send + 'static> {
    parent: Weak<TimeoutStage<T, C>>,
    generation: u64,
}

impl<T, C> rill_core::Subscriber<C> for WatchdogLeg<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<C>) {
        let subscription = upstream.subscription();
        match self.parent.upgrade() {
            Some(parent)
                if parent.generation.load(Ordering::Acquire) == self.generation
                    && !parent.done.is_done() =>
            {
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
            parent.fired(self.generation);
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
            parent.fired(self.generation);
        }
    }
}

struct FallbackRelay<T: Send + 'static, C: Send + 'static> {
    parent: Weak<TimeoutStage<T, C>>,
}

impl<T, C> rill_core::Subscriber<T> for FallbackRelay<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        match self.parent.upgrade() {
            Some(parent) => parent.arbiter.set_subscription(upstream.subscription()),
            None => upstream.cancel(),
        }
    }

    fn on_next(&self, value: T) {
        if let Some(parent) = self.parent.upgrade() {
            if !parent.done.is_done() {
                parent.arbiter.produced(1);
                parent.downstream.on_next(value);
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        match self.parent.upgrade() {
            Some(parent) => {
                if parent.done.enter() {
                    parent.downstream.on_error(error);
                } else {
                    Terminal::drop_error(error);
                }
            }
            None => rill_core::hooks::on_error_dropped(error),
        }
    }

    fn on_complete(&self) {
        if let Some(parent) = self.parent.upgrade() {
            if parent.done.enter() {
                parent.downstream.on_complete();
            }
        }
    }
}
