// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The subscription handshake between producers and consumers.
//!
//! Every edge in a flow graph obeys the same grammar: exactly one
//! `on_subscribe`, then zero or more `on_next`, then at most one terminal
//! (`on_error` or `on_complete`). Signals to a single subscriber are
//! serialized; `request` and `cancel` may arrive from any thread at any
//! time.

use crate::error::FlowError;
use crate::fusion::FusedSubscription;
use crate::Scalar;
use std::sync::Arc;

/// Shared handle to a [`Subscription`].
pub type SubscriptionRef = Arc<dyn Subscription>;

/// Shared handle to a [`Subscriber`].
pub type SubscriberRef<T> = Arc<dyn Subscriber<T>>;

/// Shared handle to a [`Source`].
pub type SourceRef<T> = Arc<dyn Source<T>>;

/// The consumer-to-producer control channel of one edge.
///
/// Both operations are safe to call from any thread. Demand accumulates
/// additively and saturates at [`UNBOUNDED`](crate::UNBOUNDED); `cancel` is
/// idempotent and a `cancel` after a terminal is a no-op.
pub trait Subscription: Send + Sync + 'static {
    /// Grants the producer permission to deliver `n` more elements.
    ///
    /// `n == 0` is a protocol violation: the producer answers with
    /// `on_error(FlowError::bad_request())` (or routes it to the
    /// dropped-error hook when a terminal already went out).
    fn request(&self, n: u64);

    /// Stops the producer. No signal may be delivered afterwards.
    fn cancel(&self);
}

/// The producer-to-consumer signal channel of one edge.
pub trait Subscriber<T: Send + 'static>: Send + Sync + 'static {
    /// Delivered exactly once, before any other signal.
    fn on_subscribe(&self, upstream: Upstream<T>);

    /// Delivers one element. Never outruns the demand granted via
    /// [`Subscription::request`].
    fn on_next(&self, value: T);

    /// Terminal failure. After this, no further signal is delivered.
    fn on_error(&self, error: FlowError);

    /// Terminal completion. After this, no further signal is delivered.
    fn on_complete(&self);

    /// Drain notification on an ASYNC-fused edge.
    ///
    /// Only delivered after the subscriber negotiated
    /// [`FusionMode::Async`](crate::FusionMode): instead of pushing values
    /// through `on_next`, the producer enqueues them and pokes the consumer
    /// here to poll. Relay-mode subscribers never see this signal.
    fn on_poll_ready(&self) {}
}

/// A producer of an asynchronous sequence; the cold half of the engine.
///
/// `subscribe` may be called any number of times; each call creates an
/// independent stage pipeline for that subscriber.
pub trait Source<T: Send + 'static>: Send + Sync + 'static {
    /// Attaches a subscriber, triggering the `on_subscribe` handshake.
    fn subscribe(&self, subscriber: SubscriberRef<T>);

    /// Scalar side-channel: a 0-or-1-element constant source answers with
    /// its value here without being subscribed. Everything else keeps the
    /// default `None`.
    fn scalar(&self) -> Option<Scalar<T>> {
        None
    }
}

/// What a producer hands its consumer at subscription time.
///
/// Fusion negotiation between adjacent stages happens through this
/// handshake: a fusable upstream sends `Fusable`, and the downstream either
/// calls [`FusedSubscription::request_fusion`] to enter a pull mode or keeps
/// treating the handle as a plain subscription (relay mode).
pub enum Upstream<T> {
    /// Relay mode only: a plain demand-driven subscription.
    Relay(SubscriptionRef),
    /// The upstream supports fusion; mode selection is up to the consumer.
    Fusable(Arc<dyn FusedSubscription<T>>),
}

impl<T> Clone for Upstream<T> {
    fn clone(&self) -> Self {
        match self {
            Upstream::Relay(s) => Upstream::Relay(Arc::clone(s)),
            Upstream::Fusable(q) => Upstream::Fusable(Arc::clone(q)),
        }
    }
}

impl<T: Send + 'static> Upstream<T> {
    /// Views the handle as a plain subscription, erasing the fusion
    /// capability.
    pub fn subscription(&self) -> SubscriptionRef {
        match self {
            Upstream::Relay(s) => Arc::clone(s),
            Upstream::Fusable(q) => Arc::new(ErasedFused(Arc::clone(q))),
        }
    }

    /// The queue view, when the upstream offered one.
    pub fn fusable(&self) -> Option<&Arc<dyn FusedSubscription<T>>> {
        match self {
            Upstream::Relay(_) => None,
            Upstream::Fusable(q) => Some(q),
        }
    }

    /// Forwards a demand grant without materializing a subscription handle.
    pub fn request(&self, n: u64) {
        match self {
            Upstream::Relay(s) => s.request(n),
            Upstream::Fusable(q) => q.request(n),
        }
    }

    /// Cancels the upstream.
    pub fn cancel(&self) {
        match self {
            Upstream::Relay(s) => s.cancel(),
            Upstream::Fusable(q) => q.cancel(),
        }
    }
}

/// Fusion-capability eraser; keeps `Upstream::subscription` independent of
/// trait-object upcasting support.
struct ErasedFused<T: Send + 'static>(Arc<dyn FusedSubscription<T>>);

impl<T: Send + 'static> Subscription for ErasedFused<T> {
    fn request(&self, n: u64) {
        self.0.request(n);
    }

    fn cancel(&self) {
        self.0.cancel();
    }
}

/// A subscription that never produces and ignores all demand.
///
/// Producers that terminate immediately (empty, failed) still owe their
/// subscriber a handshake; this is the handle they send.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}

impl NoopSubscription {
    /// The handshake payload for immediately-terminating producers.
    pub fn upstream<T: Send + 'static>() -> Upstream<T> {
        Upstream::Relay(Arc::new(NoopSubscription))
    }
}
