// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Latest-value combination.
//!
//! One slot per upstream holds the most recent value. Every slot update
//! after all slots are populated produces a combined output; outputs queue
//! until downstream demand lets them go, and the leg that triggered an
//! output is replenished when the output is consumed. A leg that completes
//! without ever populating its slot completes the whole flow, since no
//! combination can ever be emitted again.

use crate::ops::Terminal;
use parking_lot::Mutex;
use rill_core::{
    Demand, FlowError, QueueFactory, QueueRef, Source, SourceRef, SubscriberRef, Subscription,
    SubscriptionCell, Upstream, Wip,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) struct CombineLatestSource<T, R, F> {
    sources: Vec<SourceRef<T>>,
    combiner: Arc<F>,
    _marker: std::marker::PhantomData<fn(Vec<T>) -> R>,
}

impl<T, R, F> CombineLatestSource<T, R, F>
where
    T: Clone + Send + 'static,
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

impl<T, R, F> Source<R> for CombineLatestSource<T, R, F>
where
    T: Clone + Send + 'static,
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
        let stage = Arc::new(CombineLatestStage {
            downstream: SubscriberRef::clone(&subscriber),
            combiner: Arc::clone(&self.combiner),
            slots: Mutex::new(vec![None; leg_count]),
            populated: AtomicUsize::new(0),
            legs: (0..leg_count)
                .map(|_| LegHandle {
                    upstream: SubscriptionCell::new(),
                    done: AtomicBool::new(false),
                })
                .collect(),
            finished_legs: AtomicUsize::new(0),
            outputs: QueueFactory::unbounded().create(),
            demand: Demand::new(),
            wip: Wip::new(),
            cancelled: AtomicBool::new(false),
            done: Terminal::new(),
        });
        let subscription: rill_core::SubscriptionRef = Arc::clone(&stage) as rill_core::SubscriptionRef;
        subscriber.on_subscribe(Upstream::Relay(subscription));
        for (index, source) in self.sources.iter().enumerate() {
            let leg: SubscriberRef<T> = Arc::new(CombineLeg {
                parent: Arc::clone(&stage),
                index,
            });
            source.subscribe(leg);
        }
    }
}

struct LegHandle {
    upstream: SubscriptionCell,
    done: AtomicBool,
}

struct CombineLatestStage<T: Send + 'static, R: Send + 'static, F> {
    downstream: SubscriberRef<R>,
    combiner: Arc<F>,
    slots: Mutex<Vec<Option<T>>>,
    populated: AtomicUsize,
    legs: Vec<LegHandle>,
    finished_legs: AtomicUsize,
    outputs: QueueRef<(R, usize)>,
    demand: Demand,
    wip: Wip,
    cancelled: AtomicBool,
    done: Terminal,
}

impl<T, R, F> CombineLatestStage<T, R, F>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<T>) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn halt(&self, error: FlowError) {
        if self.done.enter() {
            self.cancelled.store(true, Ordering::Release);
            self.cancel_legs();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn cancel_legs(&self) {
        for leg in &self.legs {
            leg.upstream.cancel();
        }
        self.outputs.clear();
    }

    fn update(&self, index: usize, value: T) {
        let combined = {
            let mut slots = self.slots.lock();
            let fresh = slots[index].is_none();
            slots[index] = Some(value);
            if fresh {
                self.populated.fetch_add(1, Ordering::AcqRel);
            }
            if self.populated.load(Ordering::Acquire) == self.legs.len() {
                let row: Vec<T> = slots.iter().filter_map(Clone::clone).collect();
                (row.len() == self.legs.len()).then_some(row)
            } else {
                None
            }
        };
        match combined {
            Some(row) => match (self.combiner)(row) {
                Ok(output) => {
                    let _ = self.outputs.offer((output, index));
                    self.drain();
                }
                Err(error) => self.halt(error),
            },
            None => {
                // Slot not yet complete: the update cost nothing downstream,
                // replenish the leg right away.
                self.legs[index].upstream.request(1);
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
                self.outputs.clear();
            } else {
                let mut emitted = 0u64;
                while self.demand.get() > emitted {
                    match self.outputs.poll() {
                        Some((output, trigger)) => {
                            self.downstream.on_next(output);
                            emitted += 1;
                            self.legs[trigger].upstream.request(1);
                        }
                        None => break,
                    }
                }
                if emitted > 0 {
                    self.demand.produce(emitted);
                }
                if self.finished_legs.load(Ordering::Acquire) == self.legs.len()
                    && self.outputs.is_empty()
                    && self.done.enter()
                {
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

    fn leg_complete(&self, index: usize) {
        if self.legs[index].done.swap(true, Ordering::AcqRel) {
            return;
        }
        let slot_empty = self.slots.lock()[index].is_none();
        if slot_empty {
            // This leg can never contribute; no combination will ever form.
            if self.done.enter() {
                self.cancelled.store(true, Ordering::Release);
                self.cancel_legs();
                self.downstream.on_complete();
            }
            return;
        }
        self.finished_legs.fetch_add(1, Ordering::AcqRel);
        self.drain();
    }
}

impl<T, R, F> Subscription for CombineLatestStage<T, R, F>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<T>) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        if n == 0 {
            self.halt(FlowError::bad_request());
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

struct CombineLeg<T: Send + 'static, R: Send + 'static, F> {
    parent: Arc<CombineLatestStage<T, R, F>>,
    index: usize,
}

impl<T, R, F> rill_core::Subscriber<T> for CombineLeg<T, R, F>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<T>) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if !self.parent.legs[self.index]
            .upstream
            .set(rill_core::SubscriptionRef::clone(&subscription))
        {
            return;
        }
        subscription.request(1);
    }

    fn on_next(&self, value: T) {
        if self.parent.done.is_done() {
            return;
        }
        self.parent.update(self.index, value);
    }

    fn on_error(&self, error: FlowError) {
        self.parent.halt(error);
    }

    fn on_complete(&self) {
        self.parent.leg_complete(self.index);
    }
}
