// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Window-based dropping.
//!
//! An element opens a throttling window; everything arriving inside it is
//! dropped (with `request(1)` compensation) until the window elapses. The
//! window is measured against the monotonic clock at arrival time, so the
//! stage needs no timer of its own.

use crate::ops::Terminal;
use parking_lot::Mutex;
use rill_core::{FlowError, Source, SourceRef, SubscriberRef, SubscriptionCell, Upstream};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) struct ThrottleSource<T> {
    upstream: SourceRef<T>,
    window: Duration,
}

impl<T: Send + 'static> ThrottleSource<T> {
    pub(crate) fn new(upstream: SourceRef<T>, window: Duration) -> Self {
        Self { upstream, window }
    }
}

impl<T: Send + 'static> Source<T> for ThrottleSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        self.upstream.subscribe(Arc::new(ThrottleStage {
            downstream: subscriber,
            upstream: SubscriptionCell::new(),
            window: self.window,
            open_until: Mutex::new(None),
            done: Terminal::new(),
        }));
    }
}

struct ThrottleStage<T: Send + 'static> {
    downstream: SubscriberRef<T>,
    upstream: SubscriptionCell,
    window: Duration,
    open_until: Mutex<Option<Instant>>,
    done: Terminal,
}

impl<T: Send + 'static> rill_core::Subscriber<T> for ThrottleStage<T> {
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
        let now = Instant::now();
        let pass = {
            let mut open_until = self.open_until.lock();
            match *open_until {
                Some(until) if now < until => false,
                _ => {
                    *open_until = Some(now + self.window);
                    true
                }
            }
        };
        if pass {
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
