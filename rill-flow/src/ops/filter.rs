// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Predicate gate.
//!
//! Dropping an element consumes one unit of upstream demand without
//! producing anything downstream, so the stage compensates with
//! `request(1)`; downstream demand accounting never observes the drop.
//! In ASYNC fusion the same compensation happens inside `poll`.

use crate::ops::Terminal;
use parking_lot::Mutex;
use rill_core::{
    FlowError, FusedSubscription, FusionMode, FusionRequest, Scalar, Source, SourceRef,
    SubscriberRef, Subscription, SubscriptionCell, Upstream,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

pub(crate) struct FilterSource<T, P> {
    upstream: SourceRef<T>,
    predicate: Arc<P>,
}

impl<T, P> FilterSource<T, P>
where
    T: Send + 'static,
    P: Fn(&T) -> Result<bool, FlowError> + Send + Sync + 'static,
{
    pub(crate) fn new(upstream: SourceRef<T>, predicate: P) -> Self {
        Self {
            upstream,
            predicate: Arc::new(predicate),
        }
    }
}

impl<T, P> Source<T> for FilterSource<T, P>
where
    T: Send + 'static,
    P: Fn(&T) -> Result<bool, FlowError> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        self.upstream
            .subscribe(FilterStage::create(subscriber, Arc::clone(&self.predicate)));
    }

    fn scalar(&self) -> Option<Scalar<T>> {
        match self.upstream.scalar()? {
            Scalar::Empty => Some(Scalar::Empty),
            Scalar::Value(value) => match (self.predicate)(&value) {
                Ok(true) => Some(Scalar::Value(value)),
                Ok(false) => Some(Scalar::Empty),
                Err(_) => None,
            },
        }
    }
}

const MODE_NONE: u8 = 0;
const MODE_SYNC: u8 = 1;
const MODE_ASYNC: u8 = 2;

pub(crate) struct FilterStage<T: Send + 'static, P> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    predicate: Arc<P>,
    upstream: SubscriptionCell,
    fused: Mutex<Option<Arc<dyn FusedSubscription<T>>>>,
    mode: AtomicU8,
    done: Terminal,
}

impl<T, P> FilterStage<T, P>
where
    T: Send + 'static,
    P: Fn(&T) -> Result<bool, FlowError> + Send + Sync + 'static,
{
    pub(crate) fn create(downstream: SubscriberRef<T>, predicate: Arc<P>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            downstream,
            predicate,
            upstream: SubscriptionCell::new(),
            fused: Mutex::new(None),
            mode: AtomicU8::new(MODE_NONE),
            done: Terminal::new(),
        })
    }

    fn halt(&self, error: FlowError) {
        if self.done.enter() {
            self.upstream.cancel();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }
}

impl<T, P> rill_core::Subscriber<T> for FilterStage<T, P>
where
    T: Send + 'static,
    P: Fn(&T) -> Result<bool, FlowError> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if !self.upstream.set(upstream.subscription()) {
            return;
        }
        if let Some(fused) = upstream.fusable() {
            *self.fused.lock() = Some(Arc::clone(fused));
        }
        if let Some(me) = self.me.upgrade() {
            self.downstream.on_subscribe(Upstream::Fusable(me));
        }
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() {
            return;
        }
        match (self.predicate)(&value) {
            Ok(true) => self.downstream.on_next(value),
            Ok(false) => self.upstream.request(1),
            Err(error) => self.halt(error),
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

    fn on_poll_ready(&self) {
        self.downstream.on_poll_ready();
    }
}

impl<T, P> Subscription for FilterStage<T, P>
where
    T: Send + 'static,
    P: Fn(&T) -> Result<bool, FlowError> + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.upstream.cancel();
    }
}

impl<T, P> FusedSubscription<T> for FilterStage<T, P>
where
    T: Send + 'static,
    P: Fn(&T) -> Result<bool, FlowError> + Send + Sync + 'static,
{
    fn request_fusion(&self, requested: FusionRequest) -> FusionMode {
        let granted = match self.fused.lock().as_ref() {
            Some(upstream) => upstream.request_fusion(requested),
            None => FusionMode::None,
        };
        let mode = match granted {
            FusionMode::None => MODE_NONE,
            FusionMode::Sync => MODE_SYNC,
            FusionMode::Async => MODE_ASYNC,
        };
        self.mode.store(mode, Ordering::Release);
        granted
    }

    fn poll(&self) -> Result<Option<T>, FlowError> {
        let upstream = self.fused.lock().clone();
        let Some(upstream) = upstream else {
            return Ok(None);
        };
        loop {
            match upstream.poll()? {
                Some(value) => match (self.predicate)(&value) {
                    Ok(true) => return Ok(Some(value)),
                    Ok(false) => {
                        // Replenish asynchronously-produced elements the
                        // consumer will never see.
                        if self.mode.load(Ordering::Acquire) == MODE_ASYNC {
                            upstream.request(1);
                        }
                    }
                    Err(error) => {
                        upstream.cancel();
                        upstream.clear();
                        return Err(error);
                    }
                },
                None => return Ok(None),
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.fused.lock().as_ref().is_none_or(|q| q.is_empty())
    }

    fn len(&self) -> usize {
        self.fused.lock().as_ref().map_or(0, |q| q.len())
    }

    fn clear(&self) {
        if let Some(upstream) = self.fused.lock().as_ref() {
            upstream.clear();
        }
    }
}
