// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Tokio-backed executor.
//!
//! Actions become short-lived tokio tasks; cancellation rides a
//! [`CancellationToken`] selected against the delay, so a cancelled timer
//! neither fires nor leaks its task.

use crate::executor::{DelayedExecutor, Executor, Task};
use rill_core::CancellationToken;
use std::time::Duration;
use tokio::runtime::Handle;

/// Dispatches engine actions onto a tokio runtime.
///
/// With no explicit handle, tasks go to the runtime that is current at
/// dispatch time (panics outside of one, like `tokio::spawn`).
#[derive(Debug, Clone, Default)]
pub struct TokioExecutor {
    handle: Option<Handle>,
}

impl TokioExecutor {
    /// Dispatches onto the ambient runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatches onto the given runtime handle regardless of the caller's
    /// context.
    #[must_use]
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match &self.handle {
            Some(handle) => {
                handle.spawn(future);
            }
            None => {
                tokio::spawn(future);
            }
        }
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Task) -> CancellationToken {
        let token = CancellationToken::new();
        let guard = token.clone();
        self.spawn(async move {
            if !guard.is_cancelled() {
                task();
            }
        });
        token
    }
}

impl DelayedExecutor for TokioExecutor {
    fn schedule(&self, task: Task, delay: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let guard = token.clone();
        self.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    if !guard.is_cancelled() {
                        task();
                    }
                }
                () = guard.cancelled() => {}
            }
        });
        token
    }

    fn schedule_periodic(
        &self,
        mut task: Box<dyn FnMut() + Send + 'static>,
        initial_delay: Duration,
        period: Duration,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let guard = token.clone();
        self.spawn(async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut ticks = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        if guard.is_cancelled() {
                            break;
                        }
                        task();
                    }
                    () = guard.cancelled() => break,
                }
            }
        });
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread")]
    async fn execute_runs_soon() {
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = runs.clone();
        TokioExecutor::new().execute(Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_schedule_never_fires() {
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = runs.clone();
        let token = TokioExecutor::new().schedule(
            Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(40),
        );
        token.cancel();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn periodic_fires_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = runs.clone();
        let token = TokioExecutor::new().schedule_periodic(
            Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        let after_cancel = runs.load(Ordering::SeqCst);
        assert!(after_cancel >= 3, "expected several ticks, saw {after_cancel}");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(runs.load(Ordering::SeqCst) <= after_cancel + 1);
    }
}
