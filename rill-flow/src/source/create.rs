// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The imperative emitter facade.
//!
//! `Flow::create` hands user code an [`Emitter`] it can push into from
//! outside the protocol: callbacks, channel pumps, hardware interrupts.
//! The configured [`OverflowPolicy`] decides what happens when values
//! arrive faster than downstream demand.
//!
//! Emitter calls must come from one producer at a time (clone the handle
//! freely, but serialize `next`). Consumer-side `request`/`cancel` may
//! race the producer; the parking policies reconcile through a drain loop.

use crate::logging::trace_drop;
use parking_lot::Mutex;
use rill_core::{
    Demand, FlowError, OverflowPolicy, QueueFactory, QueueRef, Source, SubscriberRef,
    Subscription, Upstream, Wip,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) struct CreateSource<T: Send + 'static, F> {
    setup: F,
    policy: OverflowPolicy,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, F> CreateSource<T, F>
where
    T: Send + 'static,
    F: Fn(Emitter<T>) + Send + Sync + 'static,
{
    pub(crate) fn new(setup: F, policy: OverflowPolicy) -> Self {
        Self {
            setup,
            policy,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, F> Source<T> for CreateSource<T, F>
where
    T: Send + 'static,
    F: Fn(Emitter<T>) + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let inner = Arc::new(EmitterInner {
            downstream: SubscriberRef::clone(&subscriber),
            policy: self.policy,
            queue: QueueFactory::unbounded().create(),
            latest: Mutex::new(None),
            demand: Demand::new(),
            wip: Wip::new(),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            on_cancel: Mutex::new(None),
        });
        let subscription: rill_core::SubscriptionRef = inner.clone();
        subscriber.on_subscribe(Upstream::Relay(subscription));
        (self.setup)(Emitter {
            inner: Arc::clone(&inner),
        });
    }
}

/// Push-side handle of a `create` flow.
pub struct Emitter<T: Send + 'static> {
    inner: Arc<EmitterInner<T>>,
}

impl<T: Send + 'static> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Emitter<T> {
    /// Pushes a value. Behavior under zero demand follows the configured
    /// overflow policy.
    pub fn next(&self, value: T) {
        self.inner.next(value);
    }

    /// Terminates the flow with an error. Parked values drain first under
    /// the buffering policies.
    pub fn error(&self, error: FlowError) {
        self.inner.terminal(Some(error));
    }

    /// Completes the flow. Parked values drain first under the buffering
    /// policies.
    pub fn complete(&self) {
        self.inner.terminal(None);
    }

    /// Registers teardown to run when the consumer cancels. Runs at most
    /// once; replaced callbacks never run.
    pub fn set_cancellation(&self, callback: impl FnOnce() + Send + 'static) {
        if self.inner.cancelled.load(Ordering::Acquire) {
            callback();
            return;
        }
        *self.inner.on_cancel.lock() = Some(Box::new(callback));
        // Late installation vs. racing cancel: re-check and run immediately.
        if self.inner.cancelled.load(Ordering::Acquire) {
            self.inner.run_cancellation();
        }
    }

    /// Current outstanding downstream demand.
    pub fn requested(&self) -> u64 {
        self.inner.demand.get()
    }

    /// `true` once the consumer cancelled; producers should stop.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

struct EmitterInner<T: Send + 'static> {
    downstream: SubscriberRef<T>,
    policy: OverflowPolicy,
    queue: QueueRef<T>,
    latest: Mutex<Option<T>>,
    demand: Demand,
    wip: Wip,
    done: AtomicBool,
    error: Mutex<Option<FlowError>>,
    cancelled: AtomicBool,
    terminated: AtomicBool,
    on_cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl<T: Send + 'static> EmitterInner<T> {
    fn next(&self, value: T) {
        if self.done.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        match self.policy {
            OverflowPolicy::Buffer => {
                let _ = self.queue.offer(value);
                self.drain();
            }
            OverflowPolicy::Latest => {
                *self.latest.lock() = Some(value);
                self.drain();
            }
            OverflowPolicy::Drop => {
                if self.demand.get() > 0 {
                    self.demand.produce(1);
                    self.downstream.on_next(value);
                } else {
                    trace_drop!("emitter: dropping value, no outstanding demand");
                }
            }
            OverflowPolicy::Error => {
                if self.demand.get() > 0 {
                    self.demand.produce(1);
                    self.downstream.on_next(value);
                } else {
                    self.done.store(true, Ordering::Release);
                    self.deliver_terminal(Some(FlowError::overflow(
                        "emitter received a value with no outstanding demand",
                    )));
                }
            }
        }
    }

    fn terminal(&self, error: Option<FlowError>) {
        if self.done.swap(true, Ordering::AcqRel) || self.cancelled.load(Ordering::Acquire) {
            if let Some(error) = error {
                rill_core::hooks::on_error_dropped(error);
            }
            return;
        }
        if let Some(error) = error {
            *self.error.lock() = Some(error);
        }
        match self.policy {
            OverflowPolicy::Buffer | OverflowPolicy::Latest => self.drain(),
            OverflowPolicy::Drop | OverflowPolicy::Error => {
                let error = self.error.lock().take();
                self.deliver_terminal(error);
            }
        }
    }

    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.queue.clear();
                self.latest.lock().take();
            } else {
                while self.demand.get() > 0 {
                    let value = match self.policy {
                        OverflowPolicy::Buffer => self.queue.poll(),
                        _ => self.latest.lock().take(),
                    };
                    match value {
                        Some(value) => {
                            self.demand.produce(1);
                            self.downstream.on_next(value);
                        }
                        None => break,
                    }
                }
                let drained = match self.policy {
                    OverflowPolicy::Buffer => self.queue.is_empty(),
                    _ => self.latest.lock().is_none(),
                };
                if drained && self.done.load(Ordering::Acquire) {
                    let error = self.error.lock().take();
                    self.deliver_terminal(error);
                }
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn deliver_terminal(&self, error: Option<FlowError>) {
        if self.terminated.swap(true, Ordering::AcqRel) || self.cancelled.load(Ordering::Acquire) {
            if let Some(error) = error {
                rill_core::hooks::on_error_dropped(error);
            }
            return;
        }
        match error {
            Some(error) => self.downstream.on_error(error),
            None => self.downstream.on_complete(),
        }
    }

    fn run_cancellation(&self) {
        if let Some(callback) = self.on_cancel.lock().take() {
            callback();
        }
    }
}

impl<T: Send + 'static> Subscription for EmitterInner<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            self.done.store(true, Ordering::Release);
            self.deliver_terminal(Some(FlowError::bad_request()));
            return;
        }
        self.demand.add(n);
        match self.policy {
            OverflowPolicy::Buffer | OverflowPolicy::Latest => self.drain(),
            _ => {}
        }
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.run_cancellation();
            self.queue.clear();
            self.latest.lock().take();
        }
    }
}
