// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Deduplication stages.
//!
//! `distinct` remembers every key it has let through; `distinct_until_changed`
//! only remembers the previous one. Both compensate drops with `request(1)`
//! like `filter` does.

use crate::ops::Terminal;
use parking_lot::Mutex;
use rill_core::{FlowError, Source, SourceRef, SubscriberRef, SubscriptionCell, Upstream};
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;

pub(crate) struct DistinctSource<T, K, KF> {
    upstream: SourceRef<T>,
    key_fn: Arc<KF>,
    _marker: std::marker::PhantomData<fn() -> K>,
}

impl<T, K, KF> DistinctSource<T, K, KF>
where
    T: Send + 'static,
    K: Hash + Eq + Send + 'static,
    KF: Fn(&T) -> K + Send + Sync + 'static,
{
    pub(crate) fn new(upstream: SourceRef<T>, key_fn: KF) -> Self {
        Self {
            upstream,
            key_fn: Arc::new(key_fn),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, K, KF> Source<T> for DistinctSource<T, K, KF>
where
    T: Send + 'static,
    K: Hash + Eq + Send + 'static,
    KF: Fn(&T) -> K + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        self.upstream.subscribe(Arc::new(DistinctStage {
            downstream: subscriber,
            upstream: SubscriptionCell::new(),
            key_fn: Arc::clone(&self.key_fn),
            seen: Mutex::new(HashSet::new()),
            done: Terminal::new(),
        }));
    }
}

struct DistinctStage<T: Send + 'static, K, KF> {
    downstream: SubscriberRef<T>,
    upstream: SubscriptionCell,
    key_fn: Arc<KF>,
    seen: Mutex<HashSet<K>>,
    done: Terminal,
}

impl<T, K, KF> rill_core::Subscriber<T> for DistinctStage<T, K, KF>
where
    T: Send + 'static,
    K: Hash + Eq + Send + 'static,
    KF: Fn(&T) -> K + Send + Sync + 'static,
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
        let fresh = self.seen.lock().insert((self.key_fn)(&value));
        if fresh {
            self.downstream.on_next(value);
        } else {
            self.upstream.request(1);
        }
    }

    fn on_error(&self, error: FlowError) {
        self.seen.lock().clear();
        if self.done.enter() {
            self.upstream.cancel();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn on_complete(&self) {
        self.seen.lock().clear();
        if self.done.enter() {
            self.upstream.cancel();
            self.downstream.on_complete();
        }
    }
}

pub(crate) struct DistinctUntilChangedSource<T, K, KF> {
    upstream: SourceRef<T>,
    key_fn: Arc<KF>,
    _marker: std::marker::PhantomData<fn() -> K>,
}

impl<T, K, KF> DistinctUntilChangedSource<T, K, KF>
where
    T: Send + 'static,
    K: PartialEq + Send + 'static,
    KF: Fn(&T) -> K + Send + Sync + 'static,
{
    pub(crate) fn new(upstream: SourceRef<T>, key_fn: KF) -> Self {
        Self {
            upstream,
            key_fn: Arc::new(key_fn),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, K, KF> Source<T> for DistinctUntilChangedSource<T, K, KF>
where
    T: Send + 'static,
    K: PartialEq + Send + 'static,
    KF: Fn(&T) -> K + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        self.upstream.subscribe(Arc::new(DistinctUntilChangedStage {
            downstream: subscriber,
            upstream: SubscriptionCell::new(),
            key_fn: Arc::clone(&self.key_fn),
            previous: Mutex::new(None),
            done: Terminal::new(),
        }));
    }
}

struct DistinctUntilChangedStage<T: Send + 'static, K, KF> {
    downstream: SubscriberRef<T>,
    upstream: SubscriptionCell,
    key_fn: Arc<KF>,
    previous: Mutex<Option<K>>,
    done: Terminal,
}

impl<T, K, KF> rill_core::Subscriber<T> for DistinctUntilChangedStage<T, K, KF>
where
    T: Send + 'static,
    K: PartialEq + Send + 'static,
    KF: Fn(&T) -> K + Send + Sync + 'static,
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
        let key = (self.key_fn)(&value);
        let changed = {
            let mut previous = self.previous.lock();
            let changed = previous.as_ref() != Some(&key);
            *previous = Some(key);
            changed
        };
        if changed {
            self.downstream.on_next(value);
        } else {
            self.upstream.request(1);
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
