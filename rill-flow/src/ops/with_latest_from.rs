// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Main-driven sampling of a side stream.
//!
//! Each main element combines with the most recent side value; main
//! elements arriving before the side has produced anything are dropped and
//! compensated with `request(1)`. The side is consumed at unbounded demand.
//! A side completing before it ever emitted completes the whole flow.

use crate::ops::Terminal;
use parking_lot::Mutex;
use rill_core::{
    FlowError, Source, SourceRef, SubscriberRef, Subscription, SubscriptionCell, Upstream,
    UNBOUNDED,
};
use std::sync::Arc;

pub(crate) struct WithLatestFromSource<T, S, R, F> {
    main: SourceRef<T>,
    side: SourceRef<S>,
    combiner: Arc<F>,
    _marker: std::marker::PhantomData<fn(T, S) -> R>,
}

impl<T, S, R, F> WithLatestFromSource<T, S, R, F>
where
    T: Send + 'static,
    S: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(T, S) -> Result<R, FlowError> + Send + Sync + 'static,
{
    pub(crate) fn new(main: SourceRef<T>, side: SourceRef<S>, combiner: F) -> Self {
        Self {
            main,
            side,
            combiner: Arc::new(combiner),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, S, R, F> Source<R> for WithLatestFromSource<T, S, R, F>
where
    T: Send + 'static,
    S: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(T, S) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<R>) {
        let stage = Arc::new(WithLatestFromStage {
            downstream: SubscriberRef::clone(&subscriber),
            combiner: Arc::clone(&self.combiner),
            main: SubscriptionCell::new(),
            side: SubscriptionCell::new(),
            latest: Mutex::new(None),
            done: Terminal::new(),
            _marker: std::marker::PhantomData,
        });
        let side_leg: SubscriberRef<S> = Arc::new(SideLeg {
            parent: Arc::clone(&stage),
        });
        self.side.subscribe(side_leg);
        self.main.subscribe(stage);
    }
}

struct WithLatestFromStage<T: Send + 'static, S: Send + 'static, R: Send + 'static, F> {
    downstream: SubscriberRef<R>,
    combiner: Arc<F>,
    main: SubscriptionCell,
    side: SubscriptionCell,
    latest: Mutex<Option<S>>,
    done: Terminal,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, S, R, F> WithLatestFromStage<T, S, R, F>
where
    T: Send + 'static,
    S: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(T, S) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn halt(&self, error: FlowError) {
        if self.done.enter() {
            self.main.cancel();
            self.side.cancel();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn finish(&self) {
        if self.done.enter() {
            self.main.cancel();
            self.side.cancel();
            self.downstream.on_complete();
        }
    }
}

/// The stage itself subscribes to the main upstream; its subscription is
/// what downstream sees.
impl<T, S, R, F> rill_core::Subscriber<T> for WithLatestFromStage<T, S, R, F>
where
    T: Send + 'static,
    S: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(T, S) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if !self.main.set(rill_core::SubscriptionRef::clone(&subscription)) {
            return;
        }
        self.downstream.on_subscribe(Upstream::Relay(Arc::new(MainSubscription {
            main: subscription,
            side: self.side.get(),
        })));
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() {
            return;
        }
        let latest = self.latest.lock().clone();
        match latest {
            Some(side_value) => match (self.combiner)(value, side_value) {
                Ok(output) => self.downstream.on_next(output),
                Err(error) => self.halt(error),
            },
            None => {
                // Side has not produced yet; the main element is dropped.
                self.main.request(1);
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        self.halt(error);
    }

    fn on_complete(&self) {
        self.finish();
    }
}

struct MainSubscription {
    main: rill_core::SubscriptionRef,
    side: Option<rill_core::SubscriptionRef>,
}

impl Subscription for MainSubscription {
    fn request(&self, n: u64) {
        self.main.request(n);
    }

    fn cancel(&self) {
        self.main.cancel();
        if let Some(side) = &self.side {
            side.cancel();
        }
    }
}

struct SideLeg<T: Send + 'static, S: Send + 'static, R: Send + 'static, F> {
    parent: Arc<WithLatestFromStage<T, S, R, F>>,
}

impl<T, S, R, F> rill_core::Subscriber<S> for SideLeg<T, S, R, F>
where
    T: Send + 'static,
    S: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(T, S) -> Result<R, FlowError> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<S>) {
        let subscription = upstream.subscription();
        if !self
            .parent
            .side
            .set(rill_core::SubscriptionRef::clone(&subscription))
        {
            return;
        }
        subscription.request(UNBOUNDED);
    }

    fn on_next(&self, value: S) {
        *self.parent.latest.lock() = Some(value);
    }

    fn on_error(&self, error: FlowError) {
        self.parent.halt(error);
    }

    fn on_complete(&self) {
        // A side that never produced can never produce a combination.
        if self.parent.latest.lock().is_none() {
            self.parent.finish();
        }
    }
}
