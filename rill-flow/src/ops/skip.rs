// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Prefix dropping.
//!
//! The first `request` is padded by the skip amount so downstream demand
//! accounting never observes the dropped prefix.

use crate::ops::Terminal;
use rill_core::{add_cap, FlowError, Source, SourceRef, SubscriberRef, Subscription, Upstream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub(crate) struct SkipSource<T> {
    upstream: SourceRef<T>,
    count: u64,
}

impl<T: Send + 'static> SkipSource<T> {
    pub(crate) fn new(upstream: SourceRef<T>, count: u64) -> Self {
        Self { upstream, count }
    }
}

impl<T: Send + 'static> Source<T> for SkipSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let stage = Arc::new_cyclic(|me: &Weak<SkipStage<T>>| SkipStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            upstream: rill_core::SubscriptionCell::new(),
            to_skip: AtomicU64::new(self.count),
            skip_amount: self.count,
            first_request: AtomicBool::new(true),
            done: Terminal::new(),
        });
        self.upstream.subscribe(stage);
    }
}

struct SkipStage<T: Send + 'static> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    upstream: rill_core::SubscriptionCell,
    to_skip: AtomicU64,
    skip_amount: u64,
    first_request: AtomicBool,
    done: Terminal,
}

impl<T: Send + 'static> rill_core::Subscriber<T> for SkipStage<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if !self.upstream.set(upstream.subscription()) {
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        let subscription: rill_core::SubscriptionRef = me;
        self.downstream.on_subscribe(Upstream::Relay(subscription));
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() {
            return;
        }
        let skipping = self
            .to_skip
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
            .is_ok();
        if !skipping {
            self.downstream.on_next(value);
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

impl<T: Send + 'static> Subscription for SkipStage<T> {
    fn request(&self, n: u64) {
        let n = if self.first_request.swap(false, Ordering::AcqRel) {
            add_cap(n, self.skip_amount)
        } else {
            n
        };
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.upstream.cancel();
    }
}
