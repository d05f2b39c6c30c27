// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Cold iterator source: the backbone of `from_iter` and `range`.
//!
//! Each subscriber gets an independent iterator, so the sequence replays
//! per subscription. The subscription supports SYNC fusion; in relay mode
//! it runs the standard demand-elected emission loop: the thread whose
//! `request` lifts demand off zero drives, everyone else only accumulates.

use parking_lot::Mutex;
use rill_core::{
    Demand, FlowError, FusedSubscription, FusionMode, FusionRequest, Source, SubscriberRef,
    Subscription, Upstream,
};
use std::iter::Peekable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) struct IterSource<I> {
    iterable: I,
}

impl<I> IterSource<I> {
    pub(crate) fn new(iterable: I) -> Self {
        Self { iterable }
    }
}

impl<T, I> Source<T> for IterSource<I>
where
    T: Send + 'static,
    I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let subscription = Arc::new(IterSubscription {
            downstream: SubscriberRef::clone(&subscriber),
            iter: Mutex::new(self.iterable.clone().into_iter().peekable()),
            demand: Demand::new(),
            cancelled: AtomicBool::new(false),
            fused: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Upstream::Fusable(subscription));
    }
}

struct IterSubscription<T: Send + 'static, I: Iterator<Item = T> + Send + 'static> {
    downstream: SubscriberRef<T>,
    iter: Mutex<Peekable<I>>,
    demand: Demand,
    cancelled: AtomicBool,
    fused: AtomicBool,
}

impl<T: Send + 'static, I: Iterator<Item = T> + Send + 'static> IterSubscription<T, I> {
    fn drain(&self) {
        let mut emitted: u64 = 0;
        loop {
            let authorized = self.demand.get();
            while emitted != authorized {
                if self.cancelled.load(Ordering::Acquire) {
                    return;
                }
                let next = self.iter.lock().next();
                match next {
                    Some(value) => self.downstream.on_next(value),
                    None => {
                        if !self.cancelled.load(Ordering::Acquire) {
                            self.downstream.on_complete();
                        }
                        return;
                    }
                }
                emitted += 1;
            }
            if self.iter.lock().peek().is_none() {
                if !self.cancelled.load(Ordering::Acquire) {
                    self.downstream.on_complete();
                }
                return;
            }
            if self.demand.produce(emitted) == 0 {
                return;
            }
            emitted = 0;
        }
    }
}

impl<T: Send + 'static, I: Iterator<Item = T> + Send + 'static> Subscription
    for IterSubscription<T, I>
{
    fn request(&self, n: u64) {
        if n == 0 {
            if !self.cancelled.swap(true, Ordering::AcqRel) {
                self.downstream.on_error(FlowError::bad_request());
            }
            return;
        }
        if self.fused.load(Ordering::Acquire) {
            return;
        }
        if self.demand.add(n) == 0 {
            self.drain();
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl<T: Send + 'static, I: Iterator<Item = T> + Send + 'static> FusedSubscription<T>
    for IterSubscription<T, I>
{
    fn request_fusion(&self, requested: FusionRequest) -> FusionMode {
        if requested.sync {
            self.fused.store(true, Ordering::Release);
            FusionMode::Sync
        } else {
            FusionMode::None
        }
    }

    fn poll(&self) -> Result<Option<T>, FlowError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(self.iter.lock().next())
    }

    fn is_empty(&self) -> bool {
        self.iter.lock().peek().is_none()
    }

    fn len(&self) -> usize {
        // Computed source; elements are not materialized.
        0
    }

    fn clear(&self) {
        self.cancelled.store(true, Ordering::Release);
        // Drop remaining elements by exhausting the iterator lazily on the
        // next poll; nothing is buffered.
    }
}
