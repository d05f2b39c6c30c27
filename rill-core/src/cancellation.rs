// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Shared cancellation flag with async wakeups.
//!
//! Used wherever the engine hands out a "stop this" capability that is not
//! itself a subscription: executor task handles, the handle returned by
//! `connect()` on a connectable flow, and emitter teardown callbacks.

use event_listener::{Event, EventListener};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

/// Clonable cancellation handle; all clones share one flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    event: Event,
    callbacks: parking_lot::Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            event: Event::new(),
            callbacks: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

impl CancellationToken {
    /// A token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the flag, wakes every waiter and runs registered callbacks.
    /// Idempotent.
    pub fn cancel(&self) {
        // Release pairs with the Acquire in is_cancelled: writes before the
        // cancel are visible to code observing it.
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.event.notify(usize::MAX);
        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
        for callback in callbacks {
            callback();
        }
    }

    /// Registers teardown to run when the token is cancelled; runs
    /// immediately if it already was. Each callback runs at most once.
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) {
        if self.is_cancelled() {
            callback();
            return;
        }
        self.inner.callbacks.lock().push(Box::new(callback));
        // A cancel racing the push might have missed it; re-check and
        // flush.
        if self.is_cancelled() {
            let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
            for callback in callbacks {
                callback();
            }
        }
    }

    /// Non-blocking probe.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once the token is cancelled; immediately if it already is.
    pub fn cancelled(&self) -> Cancelled<'_> {
        Cancelled {
            token: self,
            listener: None,
        }
    }

    /// Runs `action` exactly when this token first observes cancellation
    /// from the calling thread; a convenience for teardown callbacks that
    /// must not run twice.
    pub fn cancel_with(&self, action: impl FnOnce()) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.event.notify(usize::MAX);
            action();
        }
    }
}

/// Future returned by [`CancellationToken::cancelled`].
pub struct Cancelled<'a> {
    token: &'a CancellationToken,
    listener: Option<EventListener>,
}

impl Future for Cancelled<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }
        if self.listener.is_none() {
            self.listener = Some(self.token.inner.event.listen());
            // Re-check after registering: a cancel between the first check
            // and listen() would otherwise be missed.
            if self.token.is_cancelled() {
                return Poll::Ready(());
            }
        }
        match Pin::new(self.listener.as_mut().expect("listener just set")).poll(cx) {
            Poll::Ready(()) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_idempotent_and_visible() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.clone().is_cancelled());
    }

    #[test]
    fn cancel_with_runs_once() {
        let token = CancellationToken::new();
        let mut runs = 0;
        token.cancel_with(|| runs += 1);
        token.cancel_with(|| runs += 1);
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        token.cancel();
        task.await.unwrap();
    }
}
