// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Protocol layer of the rill reactive runtime.
//!
//! This crate defines the contract every rill stage obeys and the small set
//! of concurrency primitives the operator library is built from:
//!
//! - [`Source`], [`Subscriber`] and [`Subscription`]: the subscription
//!   handshake and the four signals (`subscribe`, `next`, `error`,
//!   `complete`) with their legal orderings.
//! - [`Demand`]: the saturating demand counter behind cooperative
//!   backpressure, together with the [`UNBOUNDED`] sentinel.
//! - [`Wip`]: the work-in-progress counter that elects a single drain owner
//!   for stages entered from several threads.
//! - [`SubscriptionCell`] and [`Arbiter`]: upstream-handle plumbing, from
//!   plain set-once storage up to demand-preserving upstream replacement.
//! - [`Queue`] and [`QueueFactory`]: the bounded/unbounded FIFO contract all
//!   cross-thread hand-off goes through.
//! - [`FusionMode`] and [`FusedSubscription`]: the pull sub-protocol that
//!   lets adjacent stages share a queue instead of relaying element by
//!   element.
//! - [`FlowError`] and the process-wide [`hooks`] for errors that can no
//!   longer be delivered.
//!
//! The operator stages themselves live in `rill-flow`; executors live in
//! `rill-runtime`. Nothing in this crate spawns tasks or keeps global state
//! apart from the injectable dropped-error hook.

#![allow(clippy::multiple_crate_versions, clippy::doc_markdown)]

#[macro_use]
pub mod logging;

pub mod arbiter;
pub mod cancellation;
pub mod demand;
pub mod error;
pub mod fusion;
pub mod hooks;
pub mod queue;
pub mod signal;
pub mod traits;
pub mod wip;

pub use arbiter::{Arbiter, SubscriptionCell};
pub use cancellation::CancellationToken;
pub use demand::{add_cap, mul_cap, Demand, UNBOUNDED};
pub use error::{FlowError, Result};
pub use fusion::{FusedSubscription, FusionMode, FusionRequest};
pub use queue::{OverflowPolicy, Queue, QueueFactory, QueueRef};
pub use signal::Signal;
pub use traits::{
    NoopSubscription, Source, SourceRef, Subscriber, SubscriberRef, Subscription, SubscriptionRef,
    Upstream,
};
pub use wip::Wip;

/// Scalar side-channel answer of a 0-or-1-element constant source.
///
/// Operators inspect this during composition to short-circuit whole chains
/// (`just(x).map(f)` collapses to `just(f(x))`) and to bypass inner
/// subscriptions in `flat_map`-style operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scalar<T> {
    /// The source completes without emitting.
    Empty,
    /// The source emits exactly this value, then completes.
    Value(T),
}

impl<T> Scalar<T> {
    /// Maps the contained value, keeping `Empty` as is.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Scalar<U> {
        match self {
            Scalar::Empty => Scalar::Empty,
            Scalar::Value(v) => Scalar::Value(f(v)),
        }
    }

    /// Converts into an `Option`, losing the scalar/non-scalar distinction.
    pub fn into_option(self) -> Option<T> {
        match self {
            Scalar::Empty => None,
            Scalar::Value(v) => Some(v),
        }
    }
}
