// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Interop with the `futures` ecosystem.
//!
//! `Flow::into_stream` turns a flow into a pull-based `futures::Stream`
//! whose poll demand maps to `request`, so the backpressure contract
//! survives the crossing. `Flow::from_stream` drives any `Stream` as a
//! demand-aware source: the pump polls only while downstream demand is
//! outstanding, and the stream's waker re-dispatches the pump onto the
//! engine's executor.

use crate::ops::Terminal;
use crate::Flow;
use futures::task::ArcWake;
use futures::Stream;
use parking_lot::Mutex;
use rill_core::{
    Demand, FlowError, QueueFactory, QueueRef, Source, SubscriberRef, Subscription,
    SubscriptionCell, Upstream, Wip,
};
use rill_runtime::ExecutorRef;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

/// `futures::Stream` view of a flow. Produced by
/// [`Flow::into_stream`](crate::Flow::into_stream).
pub struct FlowStream<T: Send + 'static> {
    shared: Arc<BridgeShared<T>>,
}

struct BridgeShared<T: Send + 'static> {
    queue: QueueRef<T>,
    waker: Mutex<Option<Waker>>,
    upstream: SubscriptionCell,
    input_done: AtomicBool,
    error: Mutex<Option<FlowError>>,
    prefetch: usize,
}

impl<T: Send + 'static> BridgeShared<T> {
    fn wake(&self) {
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

pub(crate) fn into_stream<T: Send + 'static>(flow: &Flow<T>, prefetch: usize) -> FlowStream<T> {
    let prefetch = prefetch.max(1);
    let shared = Arc::new(BridgeShared {
        queue: QueueFactory::bounded(prefetch).create(),
        waker: Mutex::new(None),
        upstream: SubscriptionCell::new(),
        input_done: AtomicBool::new(false),
        error: Mutex::new(None),
        prefetch,
    });
    let tap: SubscriberRef<T> = Arc::new(BridgeSubscriber {
        shared: Arc::clone(&shared),
    });
    flow.subscribe_with(tap);
    FlowStream { shared }
}

struct BridgeSubscriber<T: Send + 'static> {
    shared: Arc<BridgeShared<T>>,
}

impl<T: Send + 'static> rill_core::Subscriber<T> for BridgeSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if self
            .shared
            .upstream
            .set(rill_core::SubscriptionRef::clone(&subscription))
        {
            subscription.request(self.shared.prefetch as u64);
        }
    }

    fn on_next(&self, value: T) {
        let _ = self.shared.queue.offer(value);
        self.shared.wake();
    }

    fn on_error(&self, error: FlowError) {
        *self.shared.error.lock() = Some(error);
        self.shared.input_done.store(true, Ordering::Release);
        self.shared.wake();
    }

    fn on_complete(&self) {
        self.shared.input_done.store(true, Ordering::Release);
        self.shared.wake();
    }
}

impl<T: Send + 'static> Stream for FlowStream<T> {
    type Item = Result<T, FlowError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(value) = self.shared.queue.poll() {
            self.shared.upstream.request(1);
            return Poll::Ready(Some(Ok(value)));
        }
        if self.shared.input_done.load(Ordering::Acquire) {
            // Re-check the queue: a value may have landed between the poll
            // and the flag read.
            if let Some(value) = self.shared.queue.poll() {
                return Poll::Ready(Some(Ok(value)));
            }
            return match self.shared.error.lock().take() {
                Some(error) => Poll::Ready(Some(Err(error))),
                None => Poll::Ready(None),
            };
        }
        *self.shared.waker.lock() = Some(cx.waker().clone());
        // Same race the other way: wake() may have fired before the waker
        // was stored.
        if !self.shared.queue.is_empty() || self.shared.input_done.load(Ordering::Acquire) {
            self.shared.wake();
        }
        Poll::Pending
    }
}

impl<T: Send + 'static> Drop for FlowStream<T> {
    fn drop(&mut self) {
        self.shared.upstream.cancel();
    }
}

/// Demand-aware pump driving a `futures::Stream` as a source.
pub(crate) struct FromStreamSource<S> {
    stream: Mutex<Option<S>>,
    executor: ExecutorRef,
}

impl<S> FromStreamSource<S> {
    pub(crate) fn new(stream: S, executor: ExecutorRef) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            executor,
        }
    }
}

impl<T, S> Source<T> for FromStreamSource<S>
where
    T: Send + 'static,
    S: Stream<Item = T> + Send + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let Some(stream) = self.stream.lock().take() else {
            // A stream is a one-shot pull sequence; it cannot replay.
            subscriber.on_subscribe(rill_core::NoopSubscription::upstream());
            subscriber.on_error(FlowError::protocol(
                "from_stream supports exactly one subscriber",
            ));
            return;
        };
        let pump = Arc::new_cyclic(|me: &Weak<StreamPump<T, S>>| StreamPump {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            stream: Mutex::new(Box::pin(stream)),
            executor: ExecutorRef::clone(&self.executor),
            demand: Demand::new(),
            wip: Wip::new(),
            cancelled: AtomicBool::new(false),
            done: Terminal::new(),
        });
        let subscription: rill_core::SubscriptionRef = Arc::clone(&pump) as rill_core::SubscriptionRef;
        subscriber.on_subscribe(Upstream::Relay(subscription));
    }
}

struct StreamPump<T: Send + 'static, S: Stream<Item = T> + Send + 'static> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    stream: Mutex<Pin<Box<S>>>,
    executor: ExecutorRef,
    demand: Demand,
    wip: Wip,
    cancelled: AtomicBool,
    done: Terminal,
}

impl<T, S> StreamPump<T, S>
where
    T: Send + 'static,
    S: Stream<Item = T> + Send + 'static,
{
    fn pump(&self) {
        if !self.wip.enter() {
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        let waker = futures::task::waker(Arc::new(PumpWaker { pump: me }));
        let mut cx = Context::from_waker(&waker);
        let mut missed = 1;
        loop {
            let mut emitted = 0u64;
            while !self.cancelled.load(Ordering::Acquire)
                && !self.done.is_done()
                && self.demand.get() > emitted
            {
                let polled = self.stream.lock().as_mut().poll_next(&mut cx);
                match polled {
                    Poll::Ready(Some(value)) => {
                        self.downstream.on_next(value);
                        emitted += 1;
                    }
                    Poll::Ready(None) => {
                        if self.done.enter() {
                            self.downstream.on_complete();
                        }
                        break;
                    }
                    Poll::Pending => break,
                }
            }
            if emitted > 0 {
                self.demand.produce(emitted);
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn schedule_pump(&self) {
        let Some(me) = self.me.upgrade() else { return };
        self.executor.execute(Box::new(move || me.pump()));
    }
}

impl<T, S> Subscription for StreamPump<T, S>
where
    T: Send + 'static,
    S: Stream<Item = T> + Send + 'static,
{
    fn request(&self, n: u64) {
        if n == 0 {
            if self.done.enter() {
                self.cancelled.store(true, Ordering::Release);
                self.downstream.on_error(FlowError::bad_request());
            }
            return;
        }
        self.demand.add(n);
        self.schedule_pump();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.done.enter();
    }
}

struct PumpWaker<T: Send + 'static, S: Stream<Item = T> + Send + 'static> {
    pump: Arc<StreamPump<T, S>>,
}

impl<T, S> ArcWake for PumpWaker<T, S>
where
    T: Send + 'static,
    S: Stream<Item = T> + Send + 'static,
{
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.pump.schedule_pump();
    }
}
