// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Scheduler bridge for the rill reactive runtime.
//!
//! The engine never spawns threads or tasks itself; it consumes exactly two
//! capabilities from its environment:
//!
//! - [`Executor`]: "run this action soon" on some worker, cancellable.
//! - [`DelayedExecutor`]: "run this action after a delay / periodically",
//!   cancellable.
//!
//! Operators take these as `Arc<dyn _>` parameters ([`ExecutorRef`],
//! [`DelayedExecutorRef`]), which keeps thread pools, time wheels and test
//! harnesses out of the engine. [`TokioExecutor`] is the batteries-included
//! implementation behind the `runtime-tokio` feature (enabled by default).

#![allow(clippy::multiple_crate_versions, clippy::doc_markdown)]

pub mod executor;
#[cfg(feature = "runtime-tokio")]
pub mod tokio_executor;

pub use executor::{
    CallerExecutor, DelayedExecutor, DelayedExecutorRef, Executor, ExecutorRef, Task,
};
#[cfg(feature = "runtime-tokio")]
pub use tokio_executor::TokioExecutor;
