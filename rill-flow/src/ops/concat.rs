// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Sequential concatenation of N sources.
//!
//! Source *i + 1* is subscribed only after source *i* completes. The
//! subscribe hop runs through a trampoline so a chain of synchronously
//! completing sources drains in a loop instead of recursing. Unsatisfied
//! demand carries across the boundary through the [`Arbiter`].

use crate::ops::Terminal;
use parking_lot::Mutex;
use rill_core::{Arbiter, FlowError, Source, SourceRef, SubscriberRef, Subscription, Upstream, Wip};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// When a concatenating operator surfaces errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// Errors cut through immediately, even while an inner source is
    /// active.
    #[default]
    Immediate,
    /// Errors wait for the currently draining source to reach its
    /// boundary.
    Boundary,
    /// Errors are collected and surfaced only after every source finished;
    /// multiple causes fold into a composite.
    End,
}

pub(crate) struct ConcatSource<T> {
    sources: Vec<SourceRef<T>>,
    mode: ErrorMode,
}

impl<T: Send + 'static> ConcatSource<T> {
    pub(crate) fn new(sources: Vec<SourceRef<T>>, mode: ErrorMode) -> Self {
        Self { sources, mode }
    }
}

impl<T: Send + 'static> Source<T> for ConcatSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let stage = Arc::new_cyclic(|me: &Weak<ConcatStage<T>>| ConcatStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            sources: self.sources.clone(),
            mode: self.mode,
            index: AtomicUsize::new(0),
            arbiter: Arc::new(Arbiter::new()),
            collected: Mutex::new(Vec::new()),
            hop: Wip::new(),
            done: Terminal::new(),
        });
        let subscription: rill_core::SubscriptionRef = Arc::clone(&stage.arbiter) as rill_core::SubscriptionRef;
        subscriber.on_subscribe(Upstream::Relay(subscription));
        stage.subscribe_next();
    }
}

struct ConcatStage<T: Send + 'static> {
    me: Weak<Self>,
    downstream: SubscriberRef<T>,
    sources: Vec<SourceRef<T>>,
    mode: ErrorMode,
    index: AtomicUsize,
    arbiter: Arc<Arbiter>,
    collected: Mutex<Vec<FlowError>>,
    hop: Wip,
    done: Terminal,
}

impl<T: Send + 'static> ConcatStage<T> {
    fn subscribe_next(&self) {
        if !self.hop.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if !self.arbiter.is_cancelled() && !self.done.is_done() {
                let index = self.index.fetch_add(1, Ordering::AcqRel);
                match self.sources.get(index) {
                    Some(source) => {
                        if let Some(me) = self.me.upgrade() {
                            let subscriber: SubscriberRef<T> = me;
                            SourceRef::clone(source).subscribe(subscriber);
                        }
                    }
                    None => self.finish(),
                }
            }
            missed = self.hop.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn finish(&self) {
        if !self.done.enter() {
            return;
        }
        self.arbiter.cancel();
        let collected = std::mem::take(&mut *self.collected.lock());
        if collected.is_empty() {
            self.downstream.on_complete();
        } else {
            self.downstream.on_error(FlowError::composite(collected));
        }
    }
}

impl<T: Send + 'static> rill_core::Subscriber<T> for ConcatStage<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.arbiter.set_subscription(upstream.subscription());
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() {
            return;
        }
        self.arbiter.produced(1);
        self.downstream.on_next(value);
    }

    fn on_error(&self, error: FlowError) {
        match self.mode {
            ErrorMode::Immediate | ErrorMode::Boundary => {
                if self.done.enter() {
                    self.arbiter.cancel();
                    self.downstream.on_error(error);
                } else {
                    Terminal::drop_error(error);
                }
            }
            ErrorMode::End => {
                self.collected.lock().push(error);
                self.subscribe_next();
            }
        }
    }

    fn on_complete(&self) {
        self.subscribe_next();
    }
}
