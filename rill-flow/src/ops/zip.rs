// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Lockstep combination.
//!
//! Each leg sits behind its own bounded prefetch queue; a combined value
//! goes out whenever every queue has a head. The flow completes as soon as
//! a completed leg's queue runs empty; remaining legs are cancelled, since
//! no further pair can ever form.

use crate::ops::Terminal;
use rill_core::{
    Demand, FlowError, QueueFactory, QueueRef, Source, SourceRef, SubscriberRef, Subscription,
    SubscriptionCell, Upstream, Wip,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

const ZIP_PREFETCH: usize = 32;

/// Drain-side callbacks a leg can reach without knowing the hub's element
/// types.
pub(crate) trait ZipHub: Send + Sync + 'static {
    fn drain(&self);
    fn leg_error(&self, error: FlowError);
}

/// One upstream of a zip, behind its own queue.
pub(crate) struct ZipLeg<A: Send + 'static> {
    hub: Weak<dyn ZipHub>,
    queue: QueueRef<A>,
    upstream: SubscriptionCell,
    done: AtomicBool,
}

impl<A: Send + 'static> ZipLeg<A> {
    pub(crate) fn new(hub: Weak<dyn ZipHub>) -> Self {
        Self {
            hub,
            queue: QueueFactory::bounded(ZIP_PREFETCH).create(),
            upstream: SubscriptionCell::new(),
            done: AtomicBool::new(false),
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// `true` when no pair containing this leg can ever form again.
    fn is_exhausted(&self) -> bool {
        self.is_done() && self.queue.is_empty()
    }

    fn cancel(&self) {
        self.upstream.cancel();
        self.queue.clear();
    }
}

impl<A: Send + 'static> rill_core::Subscriber<A> for ZipLeg<A> {
    fn on_subscribe(&self, upstream: Upstream<A>) {
        let subscription = upstream.subscription();
        if !self.upstream.set(rill_core::SubscriptionRef::clone(&subscription)) {
            return;
        }
        subscription.request(ZIP_PREFETCH as u64);
    }

    fn on_next(&self, value: A) {
        if self.queue.offer(value).is_err() {
            self.upstream.cancel();
            if let Some(hub) = self.hub.upgrade() {
                hub.leg_error(FlowError::overflow("zip leg produced beyond its prefetch"));
            }
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.drain();
        }
    }

    fn on_error(&self, error: FlowError) {
        self.done.store(true, Ordering::Release);
        match self.hub.upgrade() {
            Some(hub) => hub.leg_error(error),
            None => rill_core::hooks::on_error_dropped(error),
        }
    }

    fn on_complete(&self) {
        self.done.store(true, Ordering::Release);
        if let Some(hub) = self.hub.upgrade() {
            hub.drain();
        }
    }
}

/// Binary zip with heterogeneous element types.
pub(crate) struct ZipWithSource<A, B, R, F> {
    left: SourceRef<A>,
    right: SourceRef<B>,
    combiner: Arc<F>,
    _marker: std::marker::PhantomData<fn(A, B) -> R>,
}

impl<A, B, R, F> ZipWithSource<A, B, R, F>
where
    A: Send + 'static,
    B: Send + 'static,
    R: Send + 'static,
    F: Fn(A, B) -> Result<R, FlowError> + Send + Sync + 'static,
{
    pub(crate) fn new(left: SourceRef<A>, right: SourceRef<B>, combiner: F) -> Self {
        Self {
            left,
            right,
            combiner: Arc::new(combiner),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<A, B, R, F> Source<R> for ZipWithSource<A, B, R, F>
where
    A: Send + 'static,
    B: Send + 'static,
    R: Send + 'static,
    F: Fn(A, B) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<R>) {
        let stage = Arc::new_cyclic(|me: &Weak<ZipWithStage<A, B, R, F>>| {
            let hub: Weak<dyn ZipHub> = me.clone();
            ZipWithStage {
                downstream: SubscriberRef::clone(&subscriber),
                combiner: Arc::clone(&self.combiner),
                left: Arc::new(ZipLeg::new(hub.clone())),
                right: Arc::new(ZipLeg::new(hub)),
                demand: Demand::new(),
                wip: Wip::new(),
                cancelled: AtomicBool::new(false),
                done: Terminal::new(),
            }
        });
        let subscription: rill_core::SubscriptionRef = Arc::clone(&stage) as rill_core::SubscriptionRef;
        subscriber.on_subscribe(Upstream::Relay(subscription));
        self.left
            .subscribe(Arc::clone(&stage.left) as SubscriberRef<A>);
        self.right
            .subscribe(Arc::clone(&stage.right) as SubscriberRef<B>);
    }
}

struct ZipWithStage<A: Send + 'static, B: Send + 'static, R: Send + 'static, F> {
    downstream: SubscriberRef<R>,
    combiner: Arc<F>,
    left: Arc<ZipLeg<A>>,
    right: Arc<ZipLeg<B>>,
    demand: Demand,
    wip: Wip,
    cancelled: AtomicBool,
    done: Terminal,
}

impl<A, B, R, F> ZipWithStage<A, B, R, F>
where
    A: Send + 'static,
    B: Send + 'static,
    R: Send + 'static,
    F: Fn(A, B) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn finish_complete(&self) {
        if self.done.enter() {
            self.left.cancel();
            self.right.cancel();
            self.downstream.on_complete();
        }
    }
}

impl<A, B, R, F> ZipHub for ZipWithStage<A, B, R, F>
where
    A: Send + 'static,
    B: Send + 'static,
    R: Send + 'static,
    F: Fn(A, B) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.left.queue.clear();
                self.right.queue.clear();
            } else {
                let mut emitted = 0u64;
                while self.demand.get() > emitted
                    && !self.left.queue.is_empty()
                    && !self.right.queue.is_empty()
                {
                    let (Some(a), Some(b)) = (self.left.queue.poll(), self.right.queue.poll())
                    else {
                        break;
                    };
                    match (self.combiner)(a, b) {
                        Ok(value) => {
                            self.downstream.on_next(value);
                            emitted += 1;
                            self.left.upstream.request(1);
                            self.right.upstream.request(1);
                        }
                        Err(error) => {
                            self.leg_error(error);
                            break;
                        }
                    }
                }
                if emitted > 0 {
                    self.demand.produce(emitted);
                }
                if self.left.is_exhausted() || self.right.is_exhausted() {
                    self.finish_complete();
                }
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn leg_error(&self, error: FlowError) {
        if self.done.enter() {
            self.cancelled.store(true, Ordering::Release);
            self.left.cancel();
            self.right.cancel();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }
}

impl<A, B, R, F> Subscription for ZipWithStage<A, B, R, F>
where
    A: Send + 'static,
    B: Send + 'static,
    R: Send + 'static,
    F: Fn(A, B) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        if n == 0 {
            self.leg_error(FlowError::bad_request());
            return;
        }
        self.demand.add(n);
        self.drain();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.left.cancel();
            self.right.cancel();
            self.drain();
        }
    }
}

/// N-ary zip over same-typed legs.
pub(crate) struct ZipManySource<T, R, F> {
    sources: Vec<SourceRef<T>>,
    combiner: Arc<F>,
    _marker: std::marker::PhantomData<fn(Vec<T>) -> R>,
}

impl<T, R, F> ZipManySource<T, R, F>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<T>) -> Result<R, FlowError> + Send + Sync + 'static,
{
    pub(crate) fn new(sources: Vec<SourceRef<T>>, combiner: F) -> Self {
        Self {
            sources,
            combiner: Arc::new(combiner),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, R, F> Source<R> for ZipManySource<T, R, F>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<T>) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<R>) {
        if self.sources.is_empty() {
            subscriber.on_subscribe(rill_core::NoopSubscription::upstream());
            subscriber.on_complete();
            return;
        }
        let leg_count = self.sources.len();
        let stage = Arc::new_cyclic(|me: &Weak<ZipManyStage<T, R, F>>| {
            let hub: Weak<dyn ZipHub> = me.clone();
            ZipManyStage {
                downstream: SubscriberRef::clone(&subscriber),
                combiner: Arc::clone(&self.combiner),
                legs: (0..leg_count)
                    .map(|_| Arc::new(ZipLeg::new(hub.clone())))
                    .collect(),
                demand: Demand::new(),
                wip: Wip::new(),
                cancelled: AtomicBool::new(false),
                done: Terminal::new(),
            }
        });
        let subscription: rill_core::SubscriptionRef = Arc::clone(&stage) as rill_core::SubscriptionRef;
        subscriber.on_subscribe(Upstream::Relay(subscription));
        for (source, leg) in self.sources.iter().zip(&stage.legs) {
            source.subscribe(Arc::clone(leg) as SubscriberRef<T>);
        }
    }
}

struct ZipManyStage<T: Send + 'static, R: Send + 'static, F> {
    downstream: SubscriberRef<R>,
    combiner: Arc<F>,
    legs: Vec<Arc<ZipLeg<T>>>,
    demand: Demand,
    wip: Wip,
    cancelled: AtomicBool,
    done: Terminal,
}

impl<T, R, F> ZipManyStage<T, R, F>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<T>) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn cancel_legs(&self) {
        for leg in &self.legs {
            leg.cancel();
        }
    }
}

impl<T, R, F> ZipHub for ZipManyStage<T, R, F>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<T>) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                for leg in &self.legs {
                    leg.queue.clear();
                }
            } else {
                let mut emitted = 0u64;
                while self.demand.get() > emitted
                    && self.legs.iter().all(|leg| !leg.queue.is_empty())
                {
                    let row: Vec<T> = self.legs.iter().filter_map(|leg| leg.queue.poll()).collect();
                    if row.len() != self.legs.len() {
                        break;
                    }
                    match (self.combiner)(row) {
                        Ok(value) => {
                            self.downstream.on_next(value);
                            emitted += 1;
                            for leg in &self.legs {
                                leg.upstream.request(1);
                            }
                        }
                        Err(error) => {
                            self.leg_error(error);
                            break;
                        }
                    }
                }
                if emitted > 0 {
                    self.demand.produce(emitted);
                }
                if self.legs.iter().any(|leg| leg.is_exhausted()) && self.done.enter() {
                    self.cancel_legs();
                    self.downstream.on_complete();
                }
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn leg_error(&self, error: FlowError) {
        if self.done.enter() {
            self.cancelled.store(true, Ordering::Release);
            self.cancel_legs();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }
}

impl<T, R, F> Subscription for ZipManyStage<T, R, F>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<T>) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        if n == 0 {
            self.leg_error(FlowError::bad_request());
            return;
        }
        self.demand.add(n);
        self.drain();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.cancel_legs();
            self.drain();
        }
    }
}
