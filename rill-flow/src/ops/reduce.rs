// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Terminal folds.
//!
//! One generic stage powers the whole single-value family (`reduce`,
//! `count`, `all`, `any`, `element_at`, `single`, `last`, `to_list`,
//! `to_map`, `to_multimap`): it drives the upstream at unbounded demand,
//! feeds every element into a step closure, and emits exactly once at the
//! terminal through a demand-aware [`SoloEmitter`]. A step may short-
//! circuit (`Break`), which cancels the upstream and finishes immediately.

use crate::ops::Terminal;
use parking_lot::Mutex;
use rill_core::{
    FlowError, Source, SourceRef, SubscriberRef, Subscription, SubscriptionCell, Upstream,
    UNBOUNDED,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Step outcome of a terminal fold.
pub(crate) enum FoldControl {
    /// Keep consuming.
    Continue,
    /// Stop consuming; the fold is decided.
    Break,
}

/// Demand-aware single-emission half of a reduction stage.
///
/// The reduction may settle before downstream demand arrives; the value
/// parks until the first `request`. Exactly one of `settle_value`,
/// `settle_empty` or `settle_error` wins.
pub(crate) struct SoloEmitter<R: Send + 'static> {
    downstream: SubscriberRef<R>,
    parked: Mutex<Option<R>>,
    state: AtomicU8,
    done: Terminal,
}

const EMPTY: u8 = 0;
const REQUESTED: u8 = 1;
const PARKED: u8 = 2;
const SETTLED: u8 = 3;

impl<R: Send + 'static> SoloEmitter<R> {
    pub(crate) fn new(downstream: SubscriberRef<R>) -> Self {
        Self {
            downstream,
            parked: Mutex::new(None),
            state: AtomicU8::new(EMPTY),
            done: Terminal::new(),
        }
    }

    pub(crate) fn settle_value(&self, mut value: R) {
        loop {
            match self.state.load(Ordering::Acquire) {
                REQUESTED => {
                    if self
                        .state
                        .compare_exchange(REQUESTED, SETTLED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        if self.done.enter() {
                            self.downstream.on_next(value);
                            self.downstream.on_complete();
                        }
                        return;
                    }
                }
                EMPTY => {
                    *self.parked.lock() = Some(value);
                    if self
                        .state
                        .compare_exchange(EMPTY, PARKED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                    // A request slipped in; reclaim and retry.
                    let Some(reclaimed) = self.parked.lock().take() else {
                        return;
                    };
                    value = reclaimed;
                }
                _ => return,
            }
        }
    }

    pub(crate) fn settle_empty(&self) {
        self.state.store(SETTLED, Ordering::Release);
        if self.done.enter() {
            self.downstream.on_complete();
        }
    }

    pub(crate) fn settle_error(&self, error: FlowError) {
        self.state.store(SETTLED, Ordering::Release);
        if self.done.enter() {
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn on_request(&self) {
        loop {
            match self.state.load(Ordering::Acquire) {
                EMPTY => {
                    if self
                        .state
                        .compare_exchange(EMPTY, REQUESTED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                PARKED => {
                    if self
                        .state
                        .compare_exchange(PARKED, SETTLED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        if let Some(value) = self.parked.lock().take() {
                            if self.done.enter() {
                                self.downstream.on_next(value);
                                self.downstream.on_complete();
                            }
                        }
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn on_cancel(&self) {
        self.state.store(SETTLED, Ordering::Release);
        self.parked.lock().take();
        self.done.enter();
    }
}

type StepFn<T, A> = dyn Fn(&mut A, T) -> Result<FoldControl, FlowError> + Send + Sync;
type FinishFn<A, R> = dyn Fn(A) -> Result<Option<R>, FlowError> + Send + Sync;

pub(crate) struct FoldSource<T, A, R>
where
    T: Send + 'static,
    A: Send + 'static,
    R: Send + 'static,
{
    upstream: SourceRef<T>,
    seed: Arc<dyn Fn() -> A + Send + Sync>,
    step: Arc<StepFn<T, A>>,
    finish: Arc<FinishFn<A, R>>,
}

impl<T, A, R> FoldSource<T, A, R>
where
    T: Send + 'static,
    A: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new(
        upstream: SourceRef<T>,
        seed: impl Fn() -> A + Send + Sync + 'static,
        step: impl Fn(&mut A, T) -> Result<FoldControl, FlowError> + Send + Sync + 'static,
        finish: impl Fn(A) -> Result<Option<R>, FlowError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            upstream,
            seed: Arc::new(seed),
            step: Arc::new(step),
            finish: Arc::new(finish),
        }
    }
}

impl<T, A, R> Source<R> for FoldSource<T, A, R>
where
    T: Send + 'static,
    A: Send + 'static,
    R: Send + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<R>) {
        let stage = Arc::new_cyclic(|me: &std::sync::Weak<FoldStage<T, A, R>>| FoldStage {
            me: me.clone(),
            emitter: SoloEmitter::new(subscriber),
            upstream: SubscriptionCell::new(),
            accumulator: Mutex::new(Some((self.seed)())),
            step: Arc::clone(&self.step),
            finish: Arc::clone(&self.finish),
        });
        self.upstream.subscribe(stage);
    }
}

struct FoldStage<T, A, R>
where
    T: Send + 'static,
    A: Send + 'static,
    R: Send + 'static,
{
    me: std::sync::Weak<Self>,
    emitter: SoloEmitter<R>,
    upstream: SubscriptionCell,
    accumulator: Mutex<Option<A>>,
    step: Arc<StepFn<T, A>>,
    finish: Arc<FinishFn<A, R>>,
}

impl<T, A, R> FoldStage<T, A, R>
where
    T: Send + 'static,
    A: Send + 'static,
    R: Send + 'static,
{
    fn settle(&self) {
        let Some(accumulator) = self.accumulator.lock().take() else {
            return;
        };
        match (self.finish)(accumulator) {
            Ok(Some(value)) => self.emitter.settle_value(value),
            Ok(None) => self.emitter.settle_empty(),
            Err(error) => self.emitter.settle_error(error),
        }
    }
}

impl<T, A, R> rill_core::Subscriber<T> for FoldStage<T, A, R>
where
    T: Send + 'static,
    A: Send + 'static,
    R: Send + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if !self.upstream.set(rill_core::SubscriptionRef::clone(&subscription)) {
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        let control: rill_core::SubscriptionRef = me;
        self.emitter.downstream.on_subscribe(Upstream::Relay(control));
        subscription.request(UNBOUNDED);
    }

    fn on_next(&self, value: T) {
        let mut guard = self.accumulator.lock();
        let Some(accumulator) = guard.as_mut() else {
            return;
        };
        match (self.step)(accumulator, value) {
            Ok(FoldControl::Continue) => {}
            Ok(FoldControl::Break) => {
                drop(guard);
                self.upstream.cancel();
                self.settle();
            }
            Err(error) => {
                guard.take();
                drop(guard);
                self.upstream.cancel();
                self.emitter.settle_error(error);
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        self.accumulator.lock().take();
        self.upstream.cancel();
        self.emitter.settle_error(error);
    }

    fn on_complete(&self) {
        self.upstream.cancel();
        self.settle();
    }
}

impl<T, A, R> Subscription for FoldStage<T, A, R>
where
    T: Send + 'static,
    A: Send + 'static,
    R: Send + 'static,
{
    fn request(&self, n: u64) {
        if n == 0 {
            self.accumulator.lock().take();
            self.upstream.cancel();
            self.emitter.settle_error(FlowError::bad_request());
            return;
        }
        self.emitter.on_request();
    }

    fn cancel(&self) {
        self.emitter.on_cancel();
        self.accumulator.lock().take();
        self.upstream.cancel();
    }
}
