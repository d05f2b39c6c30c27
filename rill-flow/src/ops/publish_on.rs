// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Executor hand-off for the consumer side.
//!
//! Values, terminals and drain passes re-dispatch onto the configured
//! executor; a bounded prefetch queue decouples the upstream from the
//! worker. The first caller to take the drain token schedules a worker;
//! callers that find the token taken only bump it, and the running worker
//! observes the bump and loops again before retiring. Consumed elements
//! are re-requested from the upstream in batches.
//!
//! The stage also negotiates fusion with its upstream: a SYNC upstream
//! collapses into the worker's poll loop with no queue at all, an ASYNC
//! upstream donates its queue.

use crate::ops::Terminal;
use parking_lot::Mutex;
use rill_core::{
    Demand, FlowError, FusedSubscription, FusionMode, FusionRequest, QueueFactory, QueueRef,
    Source, SourceRef, SubscriberRef, Subscription, SubscriptionCell, Upstream, Wip,
};
use rill_runtime::ExecutorRef;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

const INPUT_RELAY: u8 = 0;
const INPUT_SYNC: u8 = 1;
const INPUT_ASYNC: u8 = 2;

pub(crate) struct PublishOnSource<T> {
    upstream: SourceRef<T>,
    executor: ExecutorRef,
    prefetch: usize,
}

impl<T: Send + 'static> PublishOnSource<T> {
    pub(crate) fn new(upstream: SourceRef<T>, executor: ExecutorRef, prefetch: usize) -> Self {
        Self {
            upstream,
            executor,
            prefetch: prefetch.max(1),
        }
    }
}

impl<T: Send + 'static> Source<T> for PublishOnSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let stage = Arc::new_cyclic(|me: &Weak<PublishOnStage<T>>| PublishOnStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            executor: ExecutorRef::clone(&self.executor),
            prefetch: self.prefetch,
            upstream: SubscriptionCell::new(),
            queue: QueueFactory::bounded(self.prefetch).create(),
            fused: Mutex::new(None),
            input: AtomicU8::new(INPUT_RELAY),
            demand: Demand::new(),
            wip: Wip::new(),
            input_done: AtomicBool::new(false),
            error: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            done: Terminal::new(),
        });
        self.upstream.subscribe(stage);
    }
}

struct PublishOnStage<T: Send + 'static> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    executor: ExecutorRef,
    prefetch: usize,
    upstream: SubscriptionCell,
    queue: QueueRef<T>,
    fused: Mutex<Option<Arc<dyn FusedSubscription<T>>>>,
    input: AtomicU8,
    demand: Demand,
    wip: Wip,
    input_done: AtomicBool,
    error: Mutex<Option<FlowError>>,
    cancelled: AtomicBool,
    done: Terminal,
}

impl<T: Send + 'static> PublishOnStage<T> {
    fn schedule_drain(&self) {
        if self.wip.enter() {
            let Some(me) = self.me.upgrade() else { return };
            self.executor.execute(Box::new(move || me.drain_loop()));
        }
    }

    fn drain_loop(&self) {
        let mut missed = 1;
        loop {
            self.drain_pass();
            missed = self.wip.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn drain_pass(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            self.queue.clear();
            if let Some(fused) = self.fused.lock().as_ref() {
                fused.clear();
            }
            return;
        }
        let input = self.input.load(Ordering::Acquire);
        let mut emitted = 0u64;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return;
            }
            if self.demand.get() <= emitted {
                break;
            }
            let polled: Result<Option<T>, FlowError> = match input {
                INPUT_RELAY => Ok(self.queue.poll()),
                _ => {
                    let fused = self.fused.lock().clone();
                    match fused {
                        Some(fused) => fused.poll(),
                        None => Ok(None),
                    }
                }
            };
            match polled {
                Ok(Some(value)) => {
                    self.downstream.on_next(value);
                    emitted += 1;
                }
                Ok(None) => {
                    // A drained SYNC chain is complete by contract.
                    if input == INPUT_SYNC && self.done.enter() {
                        self.upstream.cancel();
                        self.downstream.on_complete();
                        return;
                    }
                    break;
                }
                Err(error) => {
                    if self.done.enter() {
                        self.upstream.cancel();
                        self.downstream.on_error(error);
                    } else {
                        Terminal::drop_error(error);
                    }
                    return;
                }
            }
        }
        if emitted > 0 {
            self.demand.produce(emitted);
            if input == INPUT_RELAY {
                self.upstream.request(emitted);
            }
        }
        let empty = match input {
            INPUT_RELAY => self.queue.is_empty(),
            _ => self.fused.lock().as_ref().is_none_or(|f| f.is_empty()),
        };
        if input != INPUT_SYNC && empty && self.input_done.load(Ordering::Acquire) && self.done.enter()
        {
            self.upstream.cancel();
            match self.error.lock().take() {
                Some(error) => self.downstream.on_error(error),
                None => self.downstream.on_complete(),
            }
        }
    }
}

impl<T: Send + 'static> rill_core::Subscriber<T> for PublishOnStage<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if !self.upstream.set(rill_core::SubscriptionRef::clone(&subscription)) {
            return;
        }
        if let Some(fused) = upstream.fusable() {
            match fused.request_fusion(FusionRequest::ANY) {
                FusionMode::Sync => {
                    *self.fused.lock() = Some(Arc::clone(fused));
                    self.input.store(INPUT_SYNC, Ordering::Release);
                }
                FusionMode::Async => {
                    *self.fused.lock() = Some(Arc::clone(fused));
                    self.input.store(INPUT_ASYNC, Ordering::Release);
                }
                FusionMode::None => {}
            }
        }
        let Some(me) = self.me.upgrade() else { return };
        let downstream_subscription: rill_core::SubscriptionRef = me;
        self.downstream
            .on_subscribe(Upstream::Relay(downstream_subscription));
        match self.input.load(Ordering::Acquire) {
            INPUT_SYNC => {}
            _ => subscription.request(self.prefetch as u64),
        }
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if self.queue.offer(value).is_err() {
            self.upstream.cancel();
            self.input_done.store(true, Ordering::Release);
            *self.error.lock() = Some(FlowError::overflow(
                "publish_on queue outran its prefetch grant",
            ));
        }
        self.schedule_drain();
    }

    fn on_error(&self, error: FlowError) {
        self.input_done.store(true, Ordering::Release);
        *self.error.lock() = Some(error);
        self.schedule_drain();
    }

    fn on_complete(&self) {
        self.input_done.store(true, Ordering::Release);
        self.schedule_drain();
    }

    fn on_poll_ready(&self) {
        self.schedule_drain();
    }
}

impl<T: Send + 'static> Subscription for PublishOnStage<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            self.input_done.store(true, Ordering::Release);
            *self.error.lock() = Some(FlowError::bad_request());
            self.upstream.cancel();
            self.schedule_drain();
            return;
        }
        self.demand.add(n);
        self.schedule_drain();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.upstream.cancel();
            self.schedule_drain();
        }
    }
}
