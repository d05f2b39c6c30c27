// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Concurrent inner-source merging: the engine behind `flat_map` and
//! `merge`.
//!
//! Up to `concurrency` inner sources run at once, each behind a bounded
//! prefetch queue. A single drain owner (elected through the stage [`Wip`])
//! round-robins over the inner queues and emits as far as downstream demand
//! allows; producers that lose the election only enqueue and poke the
//! owner. Scalar inners bypass subscription entirely: their value goes into
//! a dedicated queue and their outer slot is replenished when it drains.
//!
//! With `delay_error` set, errors park in a list while the remaining inners
//! finish, then surface as one composite.

use crate::ops::Terminal;
use crate::Flow;
use parking_lot::Mutex;
use rill_core::{
    Demand, FlowError, FusedSubscription, FusionMode, FusionRequest, QueueFactory, QueueRef,
    Scalar, Source, SourceRef, SubscriberRef, Subscription, SubscriptionCell, Upstream, Wip,
    UNBOUNDED,
};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Tuning for `flat_map` and `merge`.
#[derive(Debug, Clone, Copy)]
pub struct FlatMapConfig {
    /// Maximum number of simultaneously subscribed inner sources.
    pub concurrency: usize,
    /// Per-inner queue capacity and replenishment request size.
    pub prefetch: usize,
    /// Collect errors and surface them only after all inners terminate.
    pub delay_error: bool,
}

impl Default for FlatMapConfig {
    fn default() -> Self {
        Self {
            concurrency: 32,
            prefetch: 32,
            delay_error: false,
        }
    }
}

impl FlatMapConfig {
    /// Config with the given concurrency bound and default prefetch.
    #[must_use]
    pub fn concurrency(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            ..Self::default()
        }
    }
}

pub(crate) struct FlatMapSource<T, U, F> {
    upstream: SourceRef<T>,
    mapper: Arc<F>,
    config: FlatMapConfig,
    _marker: std::marker::PhantomData<fn(T) -> U>,
}

impl<T, U, F> FlatMapSource<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    pub(crate) fn new(upstream: SourceRef<T>, mapper: F, config: FlatMapConfig) -> Self {
        Self {
            upstream,
            mapper: Arc::new(mapper),
            config,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, U, F> Source<U> for FlatMapSource<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<U>) {
        let stage = Arc::new_cyclic(|me: &Weak<FlatMapStage<T, U, F>>| FlatMapStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            mapper: Arc::clone(&self.mapper),
            config: self.config,
            outer: SubscriptionCell::new(),
            demand: Demand::new(),
            wip: Wip::new(),
            inners: Mutex::new(Vec::new()),
            scalars: QueueFactory::unbounded().create(),
            errors: Mutex::new(Vec::new()),
            outer_done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            done: Terminal::new(),
        });
        self.upstream.subscribe(stage);
    }
}

struct FlatMapStage<T: Send + 'static, U: Send + 'static, F> {
    me: Weak<Self>,
    downstream: SubscriberRef<U>,
    mapper: Arc<F>,
    config: FlatMapConfig,
    outer: SubscriptionCell,
    demand: Demand,
    wip: Wip,
    inners: Mutex<Vec<Arc<FlatMapInner<T, U, F>>>>,
    scalars: QueueRef<U>,
    errors: Mutex<Vec<FlowError>>,
    outer_done: AtomicBool,
    cancelled: AtomicBool,
    done: Terminal,
}

impl<T, U, F> FlatMapStage<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    fn record_error(&self, error: FlowError, from_inner: Option<&FlatMapInner<T, U, F>>) {
        if self.config.delay_error {
            self.errors.lock().push(error);
            if let Some(inner) = from_inner {
                inner.done.store(true, Ordering::Release);
            }
            self.drain();
        } else if self.done.enter() {
            self.cancelled.store(true, Ordering::Release);
            self.outer.cancel();
            self.cancel_inners();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn cancel_inners(&self) {
        let inners = std::mem::take(&mut *self.inners.lock());
        for inner in inners {
            inner.upstream.cancel();
        }
        self.scalars.clear();
    }

    fn remove_inner(&self, target: &Arc<FlatMapInner<T, U, F>>) {
        let mut inners = self.inners.lock();
        if let Some(position) = inners.iter().position(|i| Arc::ptr_eq(i, target)) {
            inners.remove(position);
        }
    }

    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.cancel_inners();
            } else {
                self.drain_pass();
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn drain_pass(&self) {
        let mut emitted: u64 = 0;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return;
            }
            let budget = self.demand.get();
            let mut progressed = false;

            if budget > emitted {
                if let Some(value) = self.scalars.poll() {
                    self.downstream.on_next(value);
                    emitted += 1;
                    // A drained scalar frees the outer slot it consumed.
                    self.outer.request(1);
                    continue;
                }
            }

            let snapshot: Vec<_> = self.inners.lock().clone();
            let mut finished: Vec<Arc<FlatMapInner<T, U, F>>> = Vec::new();
            for inner in &snapshot {
                if budget <= emitted {
                    break;
                }
                match inner.poll_value() {
                    InnerPoll::Value(value) => {
                        self.downstream.on_next(value);
                        emitted += 1;
                        inner.replenish();
                        progressed = true;
                    }
                    InnerPoll::Empty => {}
                    InnerPoll::Finished => finished.push(Arc::clone(inner)),
                    InnerPoll::Failed(error) => {
                        self.record_error(error, Some(inner));
                        finished.push(Arc::clone(inner));
                    }
                }
            }
            // Inners that terminated with nothing queued are retired even
            // when the demand budget is exhausted.
            for inner in &snapshot {
                if matches!(inner.poll_state(), InnerPoll::Finished)
                    && !finished.iter().any(|f| Arc::ptr_eq(f, inner))
                {
                    finished.push(Arc::clone(inner));
                }
            }
            let retired = !finished.is_empty();
            for inner in finished {
                self.remove_inner(&inner);
                self.outer.request(1);
            }

            if emitted > 0 {
                self.demand.produce(emitted);
                emitted = 0;
            }

            if self.outer_done.load(Ordering::Acquire)
                && self.inners.lock().is_empty()
                && self.scalars.is_empty()
            {
                if self.done.enter() {
                    self.outer.cancel();
                    let errors = std::mem::take(&mut *self.errors.lock());
                    if errors.is_empty() {
                        self.downstream.on_complete();
                    } else {
                        self.downstream.on_error(FlowError::composite(errors));
                    }
                }
                return;
            }

            if !progressed && !retired {
                return;
            }
        }
    }
}

impl<T, U, F> rill_core::Subscriber<T> for FlatMapStage<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if !self.outer.set(rill_core::SubscriptionRef::clone(&subscription)) {
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        let downstream_subscription: rill_core::SubscriptionRef = me;
        self.downstream
            .on_subscribe(Upstream::Relay(downstream_subscription));
        let initial = if self.config.concurrency == usize::MAX {
            UNBOUNDED
        } else {
            self.config.concurrency as u64
        };
        subscription.request(initial);
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let flow = match (self.mapper)(value) {
            Ok(flow) => flow,
            Err(error) => {
                self.record_error(error, None);
                return;
            }
        };
        match flow.as_source().scalar() {
            Some(Scalar::Empty) => {
                // Nothing to merge; the slot frees up immediately.
                self.outer.request(1);
            }
            Some(Scalar::Value(value)) => {
                let _ = self.scalars.offer(value);
                self.drain();
            }
            None => {
                let Some(me) = self.me.upgrade() else { return };
                let inner = Arc::new(FlatMapInner {
                    parent: Arc::downgrade(&me),
                    upstream: SubscriptionCell::new(),
                    queue: QueueFactory::bounded(self.config.prefetch).create(),
                    fused: Mutex::new(None),
                    mode: AtomicU8::new(INNER_RELAY),
                    done: AtomicBool::new(false),
                    sync_drained: AtomicBool::new(false),
                });
                self.inners.lock().push(Arc::clone(&inner));
                let subscriber: SubscriberRef<U> = inner;
                flow.subscribe_with(subscriber);
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        self.outer_done.store(true, Ordering::Release);
        self.record_error(error, None);
    }

    fn on_complete(&self) {
        self.outer_done.store(true, Ordering::Release);
        self.drain();
    }
}

impl<T, U, F> Subscription for FlatMapStage<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        if n == 0 {
            self.record_error(FlowError::bad_request(), None);
            return;
        }
        self.demand.add(n);
        self.drain();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.outer.cancel();
            self.drain();
        }
    }
}

const INNER_RELAY: u8 = 0;
const INNER_SYNC: u8 = 1;
const INNER_ASYNC: u8 = 2;

enum InnerPoll<U> {
    Value(U),
    Empty,
    Finished,
    Failed(FlowError),
}

struct FlatMapInner<T: Send + 'static, U: Send + 'static, F> {
    parent: Weak<FlatMapStage<T, U, F>>,
    upstream: SubscriptionCell,
    queue: QueueRef<U>,
    fused: Mutex<Option<Arc<dyn FusedSubscription<U>>>>,
    mode: AtomicU8,
    done: AtomicBool,
    sync_drained: AtomicBool,
}

impl<T, U, F> FlatMapInner<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    fn poll_value(&self) -> InnerPoll<U> {
        match self.mode.load(Ordering::Acquire) {
            INNER_SYNC | INNER_ASYNC => {
                let fused = self.fused.lock().clone();
                let Some(fused) = fused else {
                    return InnerPoll::Empty;
                };
                match fused.poll() {
                    Ok(Some(value)) => InnerPoll::Value(value),
                    Ok(None) => {
                        if self.mode.load(Ordering::Acquire) == INNER_SYNC {
                            // Sync contract: an empty poll is the terminal.
                            self.sync_drained.store(true, Ordering::Release);
                            InnerPoll::Finished
                        } else if self.done.load(Ordering::Acquire) {
                            InnerPoll::Finished
                        } else {
                            InnerPoll::Empty
                        }
                    }
                    Err(error) => InnerPoll::Failed(error),
                }
            }
            _ => match self.queue.poll() {
                Some(value) => InnerPoll::Value(value),
                None => {
                    if self.done.load(Ordering::Acquire) {
                        InnerPoll::Finished
                    } else {
                        InnerPoll::Empty
                    }
                }
            },
        }
    }

    /// Terminal probe that must not consume a value.
    fn poll_state(&self) -> InnerPoll<U> {
        let empty = match self.mode.load(Ordering::Acquire) {
            INNER_SYNC | INNER_ASYNC => self.fused.lock().as_ref().is_none_or(|f| f.is_empty()),
            _ => self.queue.is_empty(),
        };
        let finished = match self.mode.load(Ordering::Acquire) {
            INNER_SYNC => self.sync_drained.load(Ordering::Acquire),
            _ => self.done.load(Ordering::Acquire) && empty,
        };
        if finished {
            InnerPoll::Finished
        } else {
            InnerPoll::Empty
        }
    }

    fn replenish(&self) {
        if self.mode.load(Ordering::Acquire) != INNER_SYNC {
            self.upstream.request(1);
        }
    }
}

impl<T, U, F> rill_core::Subscriber<U> for FlatMapInner<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<U>) {
        let Some(parent) = self.parent.upgrade() else {
            upstream.cancel();
            return;
        };
        let subscription = upstream.subscription();
        if !self.upstream.set(rill_core::SubscriptionRef::clone(&subscription)) {
            return;
        }
        if let Some(fused) = upstream.fusable() {
            match fused.request_fusion(FusionRequest::ANY) {
                FusionMode::Sync => {
                    *self.fused.lock() = Some(Arc::clone(fused));
                    self.mode.store(INNER_SYNC, Ordering::Release);
                    parent.drain();
                    return;
                }
                FusionMode::Async => {
                    *self.fused.lock() = Some(Arc::clone(fused));
                    self.mode.store(INNER_ASYNC, Ordering::Release);
                }
                FusionMode::None => {}
            }
        }
        subscription.request(parent.config.prefetch as u64);
    }

    fn on_next(&self, value: U) {
        let Some(parent) = self.parent.upgrade() else { return };
        if self.queue.offer(value).is_err() {
            // The inner outran its prefetch grant; that is a protocol bug
            // upstream, surfaced as overflow.
            self.upstream.cancel();
            parent.record_error(
                FlowError::overflow("flat_map inner produced beyond its prefetch"),
                None,
            );
            return;
        }
        parent.drain();
    }

    fn on_error(&self, error: FlowError) {
        let Some(parent) = self.parent.upgrade() else {
            rill_core::hooks::on_error_dropped(error);
            return;
        };
        self.done.store(true, Ordering::Release);
        parent.record_error(error, None);
    }

    fn on_complete(&self) {
        self.done.store(true, Ordering::Release);
        if let Some(parent) = self.parent.upgrade() {
            parent.drain();
        }
    }

    fn on_poll_ready(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.drain();
        }
    }
}
