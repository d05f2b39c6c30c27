// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! # rill
//!
//! A reactive dataflow runtime: asynchronous, backpressure-aware
//! sequences of values composed through a fluent operator algebra, with an
//! explicit subscription protocol connecting producers to consumers across
//! threads under bounded memory.
//!
//! ## Overview
//!
//! The central type is [`Flow<T>`], a cold sequence that replays per
//! subscriber. Consumers pace producers through demand: a producer may
//! deliver at most as many elements as the consumer has requested, and
//! `cancel` stops an edge for good. Reductions produce a [`Solo<T>`] — a
//! flow of at most one value. Hot, shared signals come from the multicast
//! layer ([`ConnectableFlow`]) and the imperative [`Emitter`] facade.
//!
//! ```
//! use rill::prelude::*;
//! use std::time::Duration;
//!
//! let total = Flow::range(1, 100)
//!     .filter(|x| x % 2 == 0)
//!     .map(|x| x * x)
//!     .reduce(0i64, |acc, x| acc + x)
//!     .block(Duration::from_secs(1))
//!     .unwrap();
//! assert_eq!(total, Some(171_700));
//! ```
//!
//! ## Workspace structure
//!
//! - [`rill`](crate) — this crate: re-exports and the prelude.
//! - `rill-core` — the signal protocol, demand accounting, queues and
//!   fusion.
//! - `rill-flow` — the operator stage library and the `Flow`/`Solo`
//!   facades.
//! - `rill-runtime` — the `Executor`/`DelayedExecutor` seam plus the tokio
//!   implementation.
//! - `rill-test-utils` — protocol-level test doubles.
//!
//! ## Choosing an executor
//!
//! Time-based and thread-hopping operators take executors as explicit
//! `Arc<dyn _>` parameters; with the default `runtime-tokio` feature,
//! [`TokioExecutor`] is the implementation to hand them:
//!
//! ```
//! use rill::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "multi_thread")]
//! # async fn main() {
//! let exec: DelayedExecutorRef = Arc::new(TokioExecutor::new());
//! let ticks = Flow::interval(Duration::from_millis(10), exec)
//!     .take(3)
//!     .to_list()
//!     .block(Duration::from_secs(1))
//!     .unwrap();
//! assert_eq!(ticks, Some(vec![0, 1, 2]));
//! # }
//! ```

#![allow(clippy::multiple_crate_versions, clippy::doc_markdown)]

pub use rill_core::{
    hooks, FlowError, FusedSubscription, FusionMode, FusionRequest, OverflowPolicy, Queue,
    QueueFactory, QueueRef, Result, Scalar, Signal, Source, SourceRef, Subscriber, SubscriberRef,
    Subscription, SubscriptionRef, Upstream, UNBOUNDED,
};

pub use rill_flow::{
    ConnectableFlow, Emitter, ErrorMode, FlatMapConfig, Flow, FlowStream, GroupedFlow,
    ReplayConfig, Solo, Tap,
};

pub use rill_runtime::{DelayedExecutor, DelayedExecutorRef, Executor, ExecutorRef};

#[cfg(feature = "runtime-tokio")]
pub use rill_runtime::TokioExecutor;

/// The commonly needed imports in one place.
pub mod prelude {
    pub use rill_core::{FlowError, OverflowPolicy, Result, Signal};
    pub use rill_flow::{
        ConnectableFlow, Emitter, ErrorMode, FlatMapConfig, Flow, GroupedFlow, ReplayConfig,
        Solo, Tap,
    };
    pub use rill_runtime::{DelayedExecutorRef, ExecutorRef};

    #[cfg(feature = "runtime-tokio")]
    pub use rill_runtime::TokioExecutor;
}
