// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! 1:1 transformation stage.
//!
//! `map` forwards the handshake, transforms each element and forwards
//! terminals. It participates in fusion from both sides: when its upstream
//! offers a queue view, the stage re-exports that view with the mapper
//! applied inside `poll`, so `range(..).map(f).map(g)` collapses into one
//! pull loop. It also propagates the scalar side-channel, which is how
//! `just(x).map(f)` stays a scalar all the way through composition.

use crate::ops::Terminal;
use parking_lot::Mutex;
use rill_core::{
    FlowError, FusedSubscription, FusionMode, FusionRequest, Scalar, Source, SourceRef,
    SubscriberRef, Subscription, SubscriptionCell, Upstream,
};
use std::sync::{Arc, Weak};

pub(crate) struct MapSource<T, U, F> {
    upstream: SourceRef<T>,
    mapper: Arc<F>,
    _marker: std::marker::PhantomData<fn(T) -> U>,
}

impl<T, U, F> MapSource<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<U, FlowError> + Send + Sync + 'static,
{
    pub(crate) fn new(upstream: SourceRef<T>, mapper: F) -> Self {
        Self {
            upstream,
            mapper: Arc::new(mapper),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, U, F> Source<U> for MapSource<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<U, FlowError> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<U>) {
        self.upstream
            .subscribe(MapStage::create(subscriber, Arc::clone(&self.mapper)));
    }

    fn scalar(&self) -> Option<Scalar<U>> {
        match self.upstream.scalar()? {
            Scalar::Empty => Some(Scalar::Empty),
            // A failing mapper cannot be represented as a scalar; fall back
            // to the subscription path, which surfaces the error properly.
            Scalar::Value(value) => (self.mapper)(value).ok().map(Scalar::Value),
        }
    }
}

pub(crate) struct MapStage<T: Send + 'static, U: Send + 'static, F> {
    me: Weak<Self>,
    downstream: SubscriberRef<U>,
    mapper: Arc<F>,
    upstream: SubscriptionCell,
    fused: Mutex<Option<Arc<dyn FusedSubscription<T>>>>,
    done: Terminal,
}

impl<T, U, F> MapStage<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<U, FlowError> + Send + Sync + 'static,
{
    pub(crate) fn create(downstream: SubscriberRef<U>, mapper: Arc<F>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            downstream,
            mapper,
            upstream: SubscriptionCell::new(),
            fused: Mutex::new(None),
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

impl<T, U, F> rill_core::Subscriber<T> for MapStage<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<U, FlowError> + Send + Sync + 'static,
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
        match (self.mapper)(value) {
            Ok(mapped) => self.downstream.on_next(mapped),
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

impl<T, U, F> Subscription for MapStage<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<U, FlowError> + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.upstream.cancel();
    }
}

impl<T, U, F> FusedSubscription<U> for MapStage<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<U, FlowError> + Send + Sync + 'static,
{
    fn request_fusion(&self, requested: FusionRequest) -> FusionMode {
        match self.fused.lock().as_ref() {
            Some(upstream) => upstream.request_fusion(requested),
            None => FusionMode::None,
        }
    }

    fn poll(&self) -> Result<Option<U>, FlowError> {
        let upstream = self.fused.lock().clone();
        let Some(upstream) = upstream else {
            return Ok(None);
        };
        match upstream.poll()? {
            Some(value) => match (self.mapper)(value) {
                Ok(mapped) => Ok(Some(mapped)),
                Err(error) => {
                    upstream.cancel();
                    upstream.clear();
                    Err(error)
                }
            },
            None => Ok(None),
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
