// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The two capabilities the engine consumes from its environment.

use rill_core::CancellationToken;
use std::sync::Arc;
use std::time::Duration;

/// A one-shot action dispatched onto a worker.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// "Run this action soon."
///
/// Implementations decide the worker; the engine only relies on the action
/// running at most once and on the returned token preventing a
/// not-yet-started action from running.
pub trait Executor: Send + Sync + 'static {
    /// Dispatches the action. Cancelling the returned token before the
    /// action starts suppresses it; cancelling later is a no-op.
    fn execute(&self, task: Task) -> CancellationToken;
}

/// "Run this action later", with an optional cadence.
pub trait DelayedExecutor: Executor {
    /// Runs the action once, `delay` from now.
    fn schedule(&self, task: Task, delay: Duration) -> CancellationToken;

    /// Runs the action after `initial_delay`, then every `period` until the
    /// returned token is cancelled.
    fn schedule_periodic(
        &self,
        task: Box<dyn FnMut() + Send + 'static>,
        initial_delay: Duration,
        period: Duration,
    ) -> CancellationToken;
}

/// Shared handle to an [`Executor`].
pub type ExecutorRef = Arc<dyn Executor>;

/// Shared handle to a [`DelayedExecutor`].
pub type DelayedExecutorRef = Arc<dyn DelayedExecutor>;

/// Runs actions inline on the calling thread.
///
/// Useful in tests and for assembling pipelines whose `subscribe_on` hop
/// should be a no-op. Provides no delay capability.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallerExecutor;

impl Executor for CallerExecutor {
    fn execute(&self, task: Task) -> CancellationToken {
        let token = CancellationToken::new();
        task();
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_executor_runs_inline() {
        let cell = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen = cell.clone();
        CallerExecutor.execute(Box::new(move || {
            seen.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        assert!(cell.load(std::sync::atomic::Ordering::SeqCst));
    }
}
