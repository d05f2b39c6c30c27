// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Side-effect observation points.
//!
//! `tap` attaches callbacks to the signals passing through an edge without
//! changing them. Callbacks run before the signal is forwarded; a panic in
//! a callback is the caller's problem, exactly like any other user closure.

use rill_core::{FlowError, Source, SourceRef, SubscriberRef, Subscription, Upstream};
use std::sync::Arc;

type NextFn<T> = dyn Fn(&T) + Send + Sync;
type ErrorFn = dyn Fn(&FlowError) + Send + Sync;
type SignalFn = dyn Fn() + Send + Sync;
type RequestFn = dyn Fn(u64) + Send + Sync;

/// Callback set for [`Flow::tap`](crate::Flow::tap). Build with the
/// `on_*` setters; unset callbacks cost nothing.
pub struct Tap<T> {
    pub(crate) on_subscribe: Option<Box<SignalFn>>,
    pub(crate) on_next: Option<Box<NextFn<T>>>,
    pub(crate) on_error: Option<Box<ErrorFn>>,
    pub(crate) on_complete: Option<Box<SignalFn>>,
    pub(crate) on_request: Option<Box<RequestFn>>,
    pub(crate) on_cancel: Option<Box<SignalFn>>,
}

impl<T> Default for Tap<T> {
    fn default() -> Self {
        Self {
            on_subscribe: None,
            on_next: None,
            on_error: None,
            on_complete: None,
            on_request: None,
            on_cancel: None,
        }
    }
}

impl<T> Tap<T> {
    /// An empty callback set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes the completed handshake.
    #[must_use]
    pub fn on_subscribe(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_subscribe = Some(Box::new(f));
        self
    }

    /// Observes each element.
    #[must_use]
    pub fn on_next(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_next = Some(Box::new(f));
        self
    }

    /// Observes the terminal error.
    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&FlowError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Observes completion.
    #[must_use]
    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Observes demand flowing upstream.
    #[must_use]
    pub fn on_request(mut self, f: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.on_request = Some(Box::new(f));
        self
    }

    /// Observes cancellation flowing upstream.
    #[must_use]
    pub fn on_cancel(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_cancel = Some(Box::new(f));
        self
    }
}

pub(crate) struct TapSource<T> {
    upstream: SourceRef<T>,
    callbacks: Arc<Tap<T>>,
}

impl<T: Send + 'static> TapSource<T> {
    pub(crate) fn new(upstream: SourceRef<T>, callbacks: Tap<T>) -> Self {
        Self {
            upstream,
            callbacks: Arc::new(callbacks),
        }
    }
}

impl<T: Send + 'static> Source<T> for TapSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        self.upstream.subscribe(Arc::new(TapStage {
            downstream: subscriber,
            callbacks: Arc::clone(&self.callbacks),
        }));
    }
}

struct TapStage<T: Send + 'static> {
    downstream: SubscriberRef<T>,
    callbacks: Arc<Tap<T>>,
}

impl<T: Send + 'static> rill_core::Subscriber<T> for TapStage<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        if let Some(f) = &self.callbacks.on_subscribe {
            f();
        }
        self.downstream.on_subscribe(Upstream::Relay(Arc::new(TapSubscription {
            upstream: upstream.subscription(),
            callbacks: Arc::clone(&self.callbacks),
        })));
    }

    fn on_next(&self, value: T) {
        if let Some(f) = &self.callbacks.on_next {
            f(&value);
        }
        self.downstream.on_next(value);
    }

    fn on_error(&self, error: FlowError) {
        if let Some(f) = &self.callbacks.on_error {
            f(&error);
        }
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        if let Some(f) = &self.callbacks.on_complete {
            f();
        }
        self.downstream.on_complete();
    }
}

struct TapSubscription<T> {
    upstream: rill_core::SubscriptionRef,
    callbacks: Arc<Tap<T>>,
}

impl<T: Send + 'static> Subscription for TapSubscription<T> {
    fn request(&self, n: u64) {
        if let Some(f) = &self.callbacks.on_request {
            f(n);
        }
        self.upstream.request(n);
    }

    fn cancel(&self) {
        if let Some(f) = &self.callbacks.on_cancel {
            f();
        }
        self.upstream.cancel();
    }
}
