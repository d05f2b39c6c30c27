// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Terminal consumers behind `Flow::subscribe`.

use parking_lot::{Condvar, Mutex};
use rill_core::{FlowError, Subscription, SubscriptionCell, Upstream, UNBOUNDED};
use std::sync::Arc;
use std::time::Duration;

type NextFn<T> = dyn Fn(T) + Send + Sync;
type ErrorFn = dyn Fn(FlowError) + Send + Sync;
type CompleteFn = dyn Fn() + Send + Sync;

/// Callback-driven consumer running at unbounded demand.
pub(crate) struct LambdaSubscriber<T: Send + 'static> {
    on_next: Box<NextFn<T>>,
    on_error: Option<Box<ErrorFn>>,
    on_complete: Option<Box<CompleteFn>>,
    pub(crate) upstream: Arc<SubscriptionCell>,
}

impl<T: Send + 'static> LambdaSubscriber<T> {
    pub(crate) fn new(
        on_next: impl Fn(T) + Send + Sync + 'static,
        on_error: Option<Box<ErrorFn>>,
        on_complete: Option<Box<CompleteFn>>,
    ) -> Self {
        Self {
            on_next: Box::new(on_next),
            on_error,
            on_complete,
            upstream: Arc::new(SubscriptionCell::new()),
        }
    }
}

impl<T: Send + 'static> rill_core::Subscriber<T> for LambdaSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if self
            .upstream
            .set(rill_core::SubscriptionRef::clone(&subscription))
        {
            subscription.request(UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        (self.on_next)(value);
    }

    fn on_error(&self, error: FlowError) {
        match &self.on_error {
            Some(handler) => handler(error),
            None => rill_core::hooks::on_error_dropped(error),
        }
        self.upstream.cancel();
    }

    fn on_complete(&self) {
        if let Some(handler) = &self.on_complete {
            handler();
        }
        self.upstream.cancel();
    }
}

/// Blocking single-value consumer behind `Solo::block`.
pub(crate) struct BlockingSubscriber<T: Send + 'static> {
    state: Mutex<BlockingState<T>>,
    settled: Condvar,
    upstream: SubscriptionCell,
}

struct BlockingState<T> {
    value: Option<T>,
    error: Option<FlowError>,
    terminated: bool,
}

impl<T: Send + 'static> BlockingSubscriber<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(BlockingState {
                value: None,
                error: None,
                terminated: false,
            }),
            settled: Condvar::new(),
            upstream: SubscriptionCell::new(),
        }
    }

    /// Waits for the terminal. `Ok(None)` means the flow completed empty.
    pub(crate) fn wait(&self, timeout: Duration) -> Result<Option<T>, FlowError> {
        let mut state = self.state.lock();
        if !state.terminated && self.settled.wait_for(&mut state, timeout).timed_out() {
            self.upstream.cancel();
            return Err(FlowError::timeout(timeout));
        }
        if let Some(error) = state.error.take() {
            return Err(error);
        }
        Ok(state.value.take())
    }
}

impl<T: Send + 'static> rill_core::Subscriber<T> for BlockingSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if self
            .upstream
            .set(rill_core::SubscriptionRef::clone(&subscription))
        {
            subscription.request(UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        self.state.lock().value = Some(value);
    }

    fn on_error(&self, error: FlowError) {
        {
            let mut state = self.state.lock();
            state.error = Some(error);
            state.terminated = true;
        }
        self.settled.notify_all();
        self.upstream.cancel();
    }

    fn on_complete(&self) {
        self.state.lock().terminated = true;
        self.settled.notify_all();
        self.upstream.cancel();
    }
}
