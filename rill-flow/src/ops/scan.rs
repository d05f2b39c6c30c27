// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Running accumulation.
//!
//! Emits the accumulator after folding in each upstream element. The
//! leading seed emission is assembled in the facade as a concatenation
//! (`just(seed)` ahead of this stage), which reuses the concat demand
//! plumbing instead of duplicating it here.

use crate::ops::Terminal;
use parking_lot::Mutex;
use rill_core::{FlowError, Source, SourceRef, SubscriberRef, SubscriptionCell, Upstream};
use std::sync::Arc;

pub(crate) struct ScanSource<T, A, F> {
    upstream: SourceRef<T>,
    seed: A,
    folder: Arc<F>,
}

impl<T, A, F> ScanSource<T, A, F>
where
    T: Send + 'static,
    A: Clone + Send + Sync + 'static,
    F: Fn(A, T) -> Result<A, FlowError> + Send + Sync + 'static,
{
    pub(crate) fn new(upstream: SourceRef<T>, seed: A, folder: F) -> Self {
        Self {
            upstream,
            seed,
            folder: Arc::new(folder),
        }
    }
}

impl<T, A, F> Source<A> for ScanSource<T, A, F>
where
    T: Send + 'static,
    A: Clone + Send + Sync + 'static,
    F: Fn(A, T) -> Result<A, FlowError> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<A>) {
        self.upstream.subscribe(Arc::new(ScanStage {
            downstream: subscriber,
            upstream: SubscriptionCell::new(),
            accumulator: Mutex::new(self.seed.clone()),
            folder: Arc::clone(&self.folder),
            done: Terminal::new(),
            _marker: std::marker::PhantomData,
        }));
    }
}

struct ScanStage<T: Send + 'static, A: Send + 'static, F> {
    downstream: SubscriberRef<A>,
    upstream: SubscriptionCell,
    accumulator: Mutex<A>,
    folder: Arc<F>,
    done: Terminal,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, A, F> rill_core::Subscriber<T> for ScanStage<T, A, F>
where
    T: Send + 'static,
    A: Clone + Send + Sync + 'static,
    F: Fn(A, T) -> Result<A, FlowError> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if !self.upstream.set(rill_core::SubscriptionRef::clone(&subscription)) {
            return;
        }
        self.downstream.on_subscribe(Upstream::Relay(subscription));
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() {
            return;
        }
        let next = {
            let mut accumulator = self.accumulator.lock();
            match (self.folder)(accumulator.clone(), value) {
                Ok(next) => {
                    *accumulator = next.clone();
                    Ok(next)
                }
                Err(error) => Err(error),
            }
        };
        match next {
            Ok(next) => self.downstream.on_next(next),
            Err(error) => {
                if self.done.enter() {
                    self.upstream.cancel();
                    self.downstream.on_error(error);
                } else {
                    Terminal::drop_error(error);
                }
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.done.enter() {
            self.upstream.cancel();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn on_complete(&self) {
        if self.done.enter() {
            self.upstream.cancel();
            self.downstream.on_complete();
        }
    }
}
