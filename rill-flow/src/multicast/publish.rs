// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Min-demand broadcast hub.
//!
//! One upstream subscription feeds every attached subscriber; upstream
//! demand is coordinated as the minimum outstanding across them, so the
//! slowest consumer paces the group. Values move through a bounded
//! prefetch queue; consumed batches are re-requested.

use crate::multicast::connectable::Connect;
use crate::ops::Terminal;
use parking_lot::Mutex;
use rill_core::{
    CancellationToken, Demand, FlowError, QueueFactory, QueueRef, Source, SourceRef,
    SubscriberRef, Subscription, SubscriptionCell, Upstream, Wip,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub(crate) struct PublishHub<T: Clone + Send + 'static> {
    me: Weak<Self>,
    upstream_source: SourceRef<T>,
    prefetch: usize,
    upstream: SubscriptionCell,
    connection: Mutex<Option<CancellationToken>>,
    connected: AtomicBool,
    queue: QueueRef<T>,
    slots: Mutex<Vec<Arc<PublishSlot<T>>>>,
    wip: Wip,
    input_done: AtomicBool,
    error: Mutex<Option<FlowError>>,
    done: Terminal,
}

struct PublishSlot<T: Send + 'static> {
    subscriber: SubscriberRef<T>,
    demand: Demand,
    cancelled: AtomicBool,
}

impl<T: Clone + Send + 'static> PublishHub<T> {
    pub(crate) fn new(upstream_source: SourceRef<T>, prefetch: usize) -> Arc<Self> {
        let prefetch = prefetch.max(1);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            upstream_source,
            prefetch,
            upstream: SubscriptionCell::new(),
            connection: Mutex::new(None),
            connected: AtomicBool::new(false),
            queue: QueueFactory::bounded(prefetch).create(),
            slots: Mutex::new(Vec::new()),
            wip: Wip::new(),
            input_done: AtomicBool::new(false),
            error: Mutex::new(None),
            done: Terminal::new(),
        })
    }

    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
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
        let mut consumed = 0u64;
        loop {
            let slots: Vec<_> = {
                let mut slots = self.slots.lock();
                slots.retain(|slot| !slot.cancelled.load(Ordering::Acquire));
                slots.clone()
            };
            if slots.is_empty() {
                break;
            }
            let allowed = slots
                .iter()
                .map(|slot| slot.demand.get())
                .min()
                .unwrap_or(0);
            if allowed == 0 || self.queue.is_empty() {
                break;
            }
            let mut emitted = 0u64;
            while emitted < allowed {
                match self.queue.poll() {
                    Some(value) => {
                        for slot in &slots {
                            if !slot.cancelled.load(Ordering::Acquire) {
                                slot.demand.produce(1);
                                slot.subscriber.on_next(value.clone());
                            }
                        }
                        emitted += 1;
                    }
                    None => break,
                }
            }
            consumed += emitted;
            if emitted == 0 {
                break;
            }
        }
        if consumed > 0 {
            self.upstream.request(consumed);
        }
        if self.input_done.load(Ordering::Acquire) && self.queue.is_empty() && self.done.enter() {
            self.upstream.cancel_current();
            // Keep the cause for late subscribers.
            let error = self.error.lock().clone();
            let slots: Vec<_> = std::mem::take(&mut *self.slots.lock());
            for slot in slots {
                if slot.cancelled.load(Ordering::Acquire) {
                    continue;
                }
                match &error {
                    Some(error) => slot.subscriber.on_error(error.clone()),
                    None => slot.subscriber.on_complete(),
                }
            }
        }
    }
}

impl<T: Clone + Send + 'static> Source<T> for PublishHub<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        if self.done.is_done() {
            // The shared signal is over; late subscribers learn the outcome
            // immediately.
            subscriber.on_subscribe(rill_core::NoopSubscription::upstream());
            match self.error.lock().clone() {
                Some(error) => subscriber.on_error(error),
                None => subscriber.on_complete(),
            }
            return;
        }
        let slot = Arc::new(PublishSlot {
            subscriber: SubscriberRef::clone(&subscriber),
            demand: Demand::new(),
            cancelled: AtomicBool::new(false),
        });
        self.slots.lock().push(Arc::clone(&slot));
        let Some(me) = self.me.upgrade() else { return };
        let subscription: rill_core::SubscriptionRef = Arc::new(PublishSubscription {
            hub: me,
            slot,
        });
        subscriber.on_subscribe(Upstream::Relay(subscription));
    }
}

impl<T: Clone + Send + 'static> PublishHub<T> {
    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.upstream.cancel_current();
        self.queue.clear();
    }
}

impl<T: Clone + Send + 'static> Connect for PublishHub<T> {
    fn connect(&self) -> CancellationToken {
        {
            let connection = self.connection.lock();
            if let Some(existing) = connection.as_ref() {
                if !existing.is_cancelled() {
                    return existing.clone();
                }
            }
        }
        let token = CancellationToken::new();
        *self.connection.lock() = Some(token.clone());
        if let Some(me) = self.me.upgrade() {
            let hub = Arc::downgrade(&me);
            token.on_cancel(move || {
                if let Some(hub) = hub.upgrade() {
                    hub.disconnect();
                }
            });
            if !self.connected.swap(true, Ordering::AcqRel) {
                let tap: SubscriberRef<T> = Arc::new(PublishUpstream { hub: me });
                self.upstream_source.subscribe(tap);
            }
        }
        token
    }
}

struct PublishUpstream<T: Clone + Send + 'static> {
    hub: Arc<PublishHub<T>>,
}

impl<T: Clone + Send + 'static> rill_core::Subscriber<T> for PublishUpstream<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if self
            .hub
            .upstream
            .set(rill_core::SubscriptionRef::clone(&subscription))
        {
            subscription.request(self.hub.prefetch as u64);
        }
    }

    fn on_next(&self, value: T) {
        if self.hub.done.is_done() {
            return;
        }
        let _ = self.hub.queue.offer(value);
        self.hub.drain();
    }

    fn on_error(&self, error: FlowError) {
        self.hub.input_done.store(true, Ordering::Release);
        *self.hub.error.lock() = Some(error);
        self.hub.drain();
    }

    fn on_complete(&self) {
        self.hub.input_done.store(true, Ordering::Release);
        self.hub.drain();
    }
}

struct PublishSubscription<T: Clone + Send + 'static> {
    hub: Arc<PublishHub<T>>,
    slot: Arc<PublishSlot<T>>,
}

impl<T: Clone + Send + 'static> Subscription for PublishSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            if !self.slot.cancelled.swap(true, Ordering::AcqRel) {
                self.slot.subscriber.on_error(FlowError::bad_request());
            }
            return;
        }
        self.slot.demand.add(n);
        self.hub.drain();
    }

    fn cancel(&self) {
        self.slot.cancelled.store(true, Ordering::Release);
        self.hub.drain();
    }
}
