// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The fusion sub-protocol.
//!
//! Fusion lets two adjacent stages skip element-by-element relaying: the
//! downstream pulls through [`FusedSubscription::poll`] instead of
//! receiving `on_next` pushes. Negotiation happens during the subscription
//! handshake: a fusable upstream hands down
//! [`Upstream::Fusable`](crate::Upstream) and the downstream calls
//! [`request_fusion`](FusedSubscription::request_fusion) with the modes it
//! supports. Incompatible pairs fall back to [`FusionMode::None`] and the
//! edge behaves like any relay edge.
//!
//! Mode semantics:
//!
//! - **Sync**: values are computed on demand inside `poll`; `Ok(None)`
//!   means the sequence is complete. `request` is not used on a sync-fused
//!   edge.
//! - **Async**: values arrive asynchronously in a shared queue; `Ok(None)`
//!   means "nothing ready right now" and the terminal travels through the
//!   regular `on_error`/`on_complete` signals, with
//!   [`on_poll_ready`](crate::Subscriber::on_poll_ready) poking the
//!   consumer whenever new values land. `request` still bounds how much the
//!   producer may enqueue.

use crate::error::FlowError;
use crate::traits::Subscription;

/// Granted fusion mode for one edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionMode {
    /// Relay mode; push signals as usual.
    None,
    /// Pull mode, consumer-driven.
    Sync,
    /// Shared-queue mode, producer-driven.
    Async,
}

/// The set of modes a consumer can work with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FusionRequest {
    /// Consumer can drive a sync pull loop.
    pub sync: bool,
    /// Consumer can react to `on_poll_ready`.
    pub r#async: bool,
}

impl FusionRequest {
    /// Accepts only `Sync`.
    pub const SYNC: Self = Self {
        sync: true,
        r#async: false,
    };

    /// Accepts only `Async`.
    pub const ASYNC: Self = Self {
        sync: false,
        r#async: true,
    };

    /// Accepts either mode.
    pub const ANY: Self = Self {
        sync: true,
        r#async: true,
    };

    /// `true` when the granted mode satisfies this request.
    #[must_use]
    pub const fn accepts(self, mode: FusionMode) -> bool {
        match mode {
            FusionMode::None => true,
            FusionMode::Sync => self.sync,
            FusionMode::Async => self.r#async,
        }
    }
}

/// The queue view a fusable producer exposes alongside its subscription.
pub trait FusedSubscription<T: Send + 'static>: Subscription {
    /// Negotiates a mode. The producer grants the strongest mode it
    /// supports among the requested ones, or [`FusionMode::None`].
    fn request_fusion(&self, requested: FusionRequest) -> FusionMode;

    /// Pulls the next value. See the module docs for the `Ok(None)`
    /// semantics per mode. `Err` is terminal: the consumer must treat it
    /// exactly like an `on_error` and stop polling.
    fn poll(&self) -> Result<Option<T>, FlowError>;

    /// `true` when `poll` would return `Ok(None)` right now.
    fn is_empty(&self) -> bool;

    /// Number of immediately pollable values (0 for computed sources).
    fn len(&self) -> usize;

    /// Drops all pending values; used on downstream cancellation.
    fn clear(&self);
}
