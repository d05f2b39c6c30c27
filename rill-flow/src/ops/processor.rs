// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Queue-backed single-subscriber processor.
//!
//! The hot building block behind grouped substreams, windows and the
//! retry/repeat companion conduits: a producer side pushes values and a
//! terminal into a queue, and exactly one subscriber drains them under its
//! own demand. The subscription it hands out supports ASYNC fusion, so a
//! merging consumer can poll the queue directly and be poked through
//! `on_poll_ready`.

use crate::ops::Terminal;
use parking_lot::Mutex;
use rill_core::{
    Demand, FlowError, FusedSubscription, FusionMode, FusionRequest, QueueFactory, QueueRef,
    Source, SubscriberRef, Subscription, Upstream, Wip,
};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

const MODE_RELAY: u8 = 0;
const MODE_ASYNC: u8 = 1;

type ConsumedHook = Box<dyn Fn(u64) + Send + Sync>;
type FinishHook = Box<dyn FnOnce() + Send>;

pub(crate) struct UnicastProcessor<T: Send + 'static> {
    me: Weak<Self>,
    queue: QueueRef<T>,
    downstream: Mutex<Option<SubscriberRef<T>>>,
    claimed: AtomicBool,
    demand: Demand,
    wip: Wip,
    mode: AtomicU8,
    input_done: AtomicBool,
    error: Mutex<Option<FlowError>>,
    cancelled: AtomicBool,
    terminated: Terminal,
    /// Called once per value handed to the subscriber; parents use it to
    /// replenish their upstream.
    on_consumed: Mutex<Option<ConsumedHook>>,
    /// Called once when the subscriber goes away (terminal or cancel).
    on_finish: Mutex<Option<FinishHook>>,
}

impl<T: Send + 'static> UnicastProcessor<T> {
    pub(crate) fn new(queue_factory: QueueFactory) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            queue: queue_factory.create(),
            downstream: Mutex::new(None),
            claimed: AtomicBool::new(false),
            demand: Demand::new(),
            wip: Wip::new(),
            mode: AtomicU8::new(MODE_RELAY),
            input_done: AtomicBool::new(false),
            error: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            terminated: Terminal::new(),
            on_consumed: Mutex::new(None),
            on_finish: Mutex::new(None),
        })
    }

    pub(crate) fn set_on_consumed(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.on_consumed.lock() = Some(Box::new(hook));
    }

    pub(crate) fn set_on_finish(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_finish.lock() = Some(Box::new(hook));
    }

    /// Producer side: pushes one value. `Err` hands the value back when the
    /// queue is bounded and full.
    pub(crate) fn emit(&self, value: T) -> Result<(), T> {
        if self.input_done.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            return Ok(());
        }
        self.queue.offer(value)?;
        self.drain();
        Ok(())
    }

    /// Producer side: terminal error.
    pub(crate) fn fail(&self, error: FlowError) {
        if self.input_done.swap(true, Ordering::AcqRel) {
            rill_core::hooks::on_error_dropped(error);
            return;
        }
        *self.error.lock() = Some(error);
        self.drain();
    }

    /// Producer side: terminal completion.
    pub(crate) fn finish(&self) {
        if !self.input_done.swap(true, Ordering::AcqRel) {
            self.drain();
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn notify_consumed(&self, n: u64) {
        if n == 0 {
            return;
        }
        let hook = self.on_consumed.lock();
        if let Some(hook) = hook.as_ref() {
            hook(n);
        }
    }

    fn run_finish(&self) {
        let hook = self.on_finish.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            let downstream = self.downstream.lock().clone();
            if let Some(downstream) = downstream {
                if self.cancelled.load(Ordering::Acquire) {
                    self.queue.clear();
                } else if self.mode.load(Ordering::Acquire) == MODE_ASYNC {
                    self.drain_fused(&downstream);
                } else {
                    self.drain_relay(&downstream);
                }
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn drain_fused(&self, downstream: &SubscriberRef<T>) {
        if !self.queue.is_empty() {
            downstream.on_poll_ready();
        }
        if self.input_done.load(Ordering::Acquire) && self.terminated.enter() {
            match self.error.lock().take() {
                Some(error) => downstream.on_error(error),
                None => downstream.on_complete(),
            }
            self.run_finish();
        }
    }

    fn drain_relay(&self, downstream: &SubscriberRef<T>) {
        let mut emitted = 0u64;
        while self.demand.get() > emitted {
            if self.cancelled.load(Ordering::Acquire) {
                return;
            }
            match self.queue.poll() {
                Some(value) => {
                    downstream.on_next(value);
                    emitted += 1;
                }
                None => break,
            }
        }
        if emitted > 0 {
            self.demand.produce(emitted);
            self.notify_consumed(emitted);
        }
        if self.input_done.load(Ordering::Acquire)
            && self.queue.is_empty()
            && self.terminated.enter()
        {
            match self.error.lock().take() {
                Some(error) => downstream.on_error(error),
                None => downstream.on_complete(),
            }
            self.run_finish();
        }
    }
}

impl<T: Send + 'static> Source<T> for UnicastProcessor<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        if self.claimed.swap(true, Ordering::AcqRel) {
            subscriber.on_subscribe(rill_core::NoopSubscription::upstream());
            subscriber.on_error(FlowError::protocol(
                "unicast substream supports exactly one subscriber",
            ));
            return;
        }
        *self.downstream.lock() = Some(SubscriberRef::clone(&subscriber));
        let Some(me) = self.me.upgrade() else { return };
        subscriber.on_subscribe(Upstream::Fusable(me));
        self.drain();
    }
}

impl<T: Send + 'static> Subscription for UnicastProcessor<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            self.fail(FlowError::bad_request());
            return;
        }
        self.demand.add(n);
        self.drain();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.queue.clear();
            self.terminated.enter();
            self.run_finish();
        }
    }
}

impl<T: Send + 'static> FusedSubscription<T> for UnicastProcessor<T> {
    fn request_fusion(&self, requested: FusionRequest) -> FusionMode {
        if requested.r#async {
            self.mode.store(MODE_ASYNC, Ordering::Release);
            FusionMode::Async
        } else {
            FusionMode::None
        }
    }

    fn poll(&self) -> Result<Option<T>, FlowError> {
        let value = self.queue.poll();
        if value.is_some() {
            self.notify_consumed(1);
        }
        Ok(value)
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn clear(&self) {
        self.queue.clear();
    }
}
