// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Scheduler-driven sources: one-shot `timer` and periodic `interval`.

use parking_lot::Mutex;
use rill_core::{
    CancellationToken, Demand, FlowError, Source, SubscriberRef, Subscription, Upstream,
};
use rill_runtime::DelayedExecutorRef;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Emits `0` after `delay`, then completes.
///
/// If the timer fires before any demand arrived, the emission is parked and
/// delivered by the first `request`.
pub(crate) struct TimerSource {
    delay: Duration,
    executor: DelayedExecutorRef,
}

impl TimerSource {
    pub(crate) fn new(delay: Duration, executor: DelayedExecutorRef) -> Self {
        Self { delay, executor }
    }
}

impl Source<u64> for TimerSource {
    fn subscribe(&self, subscriber: SubscriberRef<u64>) {
        let stage = Arc::new(TimerSubscription {
            downstream: SubscriberRef::clone(&subscriber),
            requested: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            emitted: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            timer: Mutex::new(None),
        });
        let subscription: rill_core::SubscriptionRef = stage.clone();
        subscriber.on_subscribe(Upstream::Relay(subscription));
        let weak = Arc::downgrade(&stage);
        let token = self.executor.schedule(
            Box::new(move || {
                if let Some(stage) = weak.upgrade() {
                    stage.fire();
                }
            }),
            self.delay,
        );
        stage.install_timer(token);
    }
}

struct TimerSubscription {
    downstream: SubscriberRef<u64>,
    requested: AtomicBool,
    fired: AtomicBool,
    emitted: AtomicBool,
    cancelled: AtomicBool,
    timer: Mutex<Option<CancellationToken>>,
}

impl TimerSubscription {
    fn install_timer(&self, token: CancellationToken) {
        if self.cancelled.load(Ordering::Acquire) {
            token.cancel();
        } else {
            *self.timer.lock() = Some(token);
        }
    }

    fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        if self.requested.load(Ordering::Acquire) {
            self.emit();
        }
    }

    fn emit(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if !self.emitted.swap(true, Ordering::AcqRel) {
            self.downstream.on_next(0);
            self.downstream.on_complete();
        }
    }
}

impl Subscription for TimerSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            if !self.cancelled.swap(true, Ordering::AcqRel) {
                self.downstream.on_error(FlowError::bad_request());
            }
            return;
        }
        self.requested.store(true, Ordering::Release);
        if self.fired.load(Ordering::Acquire) {
            self.emit();
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(token) = self.timer.lock().take() {
            token.cancel();
        }
    }
}

/// Emits `0, 1, 2, ...` on a fixed cadence.
///
/// A tick that finds zero outstanding demand terminates the flow with an
/// overflow error: a consumer that cannot keep pace with wall-clock ticks
/// has lost data no matter what, and the failure should be visible.
pub(crate) struct IntervalSource {
    initial_delay: Duration,
    period: Duration,
    executor: DelayedExecutorRef,
}

impl IntervalSource {
    pub(crate) fn new(
        initial_delay: Duration,
        period: Duration,
        executor: DelayedExecutorRef,
    ) -> Self {
        Self {
            initial_delay,
            period,
            executor,
        }
    }
}

impl Source<u64> for IntervalSource {
    fn subscribe(&self, subscriber: SubscriberRef<u64>) {
        let stage = Arc::new(IntervalSubscription {
            downstream: SubscriberRef::clone(&subscriber),
            demand: Demand::new(),
            counter: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            timer: Mutex::new(None),
        });
        let subscription: rill_core::SubscriptionRef = stage.clone();
        subscriber.on_subscribe(Upstream::Relay(subscription));
        let weak = Arc::downgrade(&stage);
        let token = self.executor.schedule_periodic(
            Box::new(move || {
                if let Some(stage) = weak.upgrade() {
                    stage.tick();
                }
            }),
            self.initial_delay,
            self.period,
        );
        stage.install_timer(token);
    }
}

struct IntervalSubscription {
    downstream: SubscriberRef<u64>,
    demand: Demand,
    counter: AtomicU64,
    cancelled: AtomicBool,
    timer: Mutex<Option<CancellationToken>>,
}

impl IntervalSubscription {
    fn install_timer(&self, token: CancellationToken) {
        if self.cancelled.load(Ordering::Acquire) {
            token.cancel();
        } else {
            *self.timer.lock() = Some(token);
        }
    }

    fn tick(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let tick = self.counter.fetch_add(1, Ordering::AcqRel);
        if self.demand.get() == 0 {
            self.halt(FlowError::overflow(format!(
                "interval tick {tick} arrived with no outstanding demand"
            )));
            return;
        }
        self.demand.produce(1);
        self.downstream.on_next(tick);
    }

    fn halt(&self, error: FlowError) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            if let Some(token) = self.timer.lock().take() {
                token.cancel();
            }
            self.downstream.on_error(error);
        }
    }
}

impl Subscription for IntervalSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            self.halt(FlowError::bad_request());
            return;
        }
        self.demand.add(n);
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            if let Some(token) = self.timer.lock().take() {
                token.cancel();
            }
        }
    }
}
