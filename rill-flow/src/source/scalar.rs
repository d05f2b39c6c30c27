// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The constant sources: `just`, `empty`, `never`, `fail`.
//!
//! `just` and `empty` answer the scalar side-channel, which is what lets
//! downstream operators specialize whole chains at composition time.

use rill_core::{
    FlowError, FusedSubscription, FusionMode, FusionRequest, NoopSubscription, Scalar, Source,
    SubscriberRef, Subscription, Upstream,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Emits one value, then completes.
pub(crate) struct JustSource<T: Clone + Send + Sync + 'static> {
    value: T,
}

impl<T: Clone + Send + Sync + 'static> JustSource<T> {
    pub(crate) fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T: Clone + Send + Sync + 'static> Source<T> for JustSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let subscription = Arc::new(ScalarSubscription::new(
            SubscriberRef::clone(&subscriber),
            self.value.clone(),
        ));
        subscriber.on_subscribe(Upstream::Fusable(subscription));
    }

    fn scalar(&self) -> Option<Scalar<T>> {
        Some(Scalar::Value(self.value.clone()))
    }
}

const FRESH: u8 = 0;
const CONSUMED: u8 = 1;
const CANCELLED: u8 = 2;

/// One-value subscription: emits on the first positive request, or hands
/// the value out through the SYNC fusion `poll`.
pub(crate) struct ScalarSubscription<T: Send + 'static> {
    downstream: SubscriberRef<T>,
    value: parking_lot::Mutex<Option<T>>,
    state: AtomicU8,
    fused: AtomicU8,
}

impl<T: Send + 'static> ScalarSubscription<T> {
    pub(crate) fn new(downstream: SubscriberRef<T>, value: T) -> Self {
        Self {
            downstream,
            value: parking_lot::Mutex::new(Some(value)),
            state: AtomicU8::new(FRESH),
            fused: AtomicU8::new(0),
        }
    }
}

impl<T: Send + 'static> Subscription for ScalarSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            if self
                .state
                .compare_exchange(FRESH, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.downstream.on_error(FlowError::bad_request());
            }
            return;
        }
        if self.fused.load(Ordering::Acquire) != 0 {
            // Sync-fused consumers pull; demand is meaningless here.
            return;
        }
        if self
            .state
            .compare_exchange(FRESH, CONSUMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(value) = self.value.lock().take() {
                self.downstream.on_next(value);
            }
            if self.state.load(Ordering::Acquire) != CANCELLED {
                self.downstream.on_complete();
            }
        }
    }

    fn cancel(&self) {
        self.state.store(CANCELLED, Ordering::Release);
        self.value.lock().take();
    }
}

impl<T: Send + 'static> FusedSubscription<T> for ScalarSubscription<T> {
    fn request_fusion(&self, requested: FusionRequest) -> FusionMode {
        if requested.sync {
            self.fused.store(1, Ordering::Release);
            FusionMode::Sync
        } else {
            FusionMode::None
        }
    }

    fn poll(&self) -> Result<Option<T>, FlowError> {
        Ok(self.value.lock().take())
    }

    fn is_empty(&self) -> bool {
        self.value.lock().is_none()
    }

    fn len(&self) -> usize {
        usize::from(!self.is_empty())
    }

    fn clear(&self) {
        self.value.lock().take();
    }
}

/// Completes immediately without emitting.
pub(crate) struct EmptySource;

impl<T: Send + 'static> Source<T> for EmptySource {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        subscriber.on_subscribe(NoopSubscription::upstream());
        subscriber.on_complete();
    }

    fn scalar(&self) -> Option<Scalar<T>> {
        Some(Scalar::Empty)
    }
}

/// Never signals after the handshake.
///
/// Unlike the other constant sources, `never` sends no terminal of its
/// own, so its subscription must still police `request(0)` itself: with no
/// terminal ever pending, the violation would otherwise vanish into
/// silence.
pub(crate) struct NeverSource;

impl<T: Send + 'static> Source<T> for NeverSource {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let subscription: rill_core::SubscriptionRef = Arc::new(NeverSubscription {
            downstream: SubscriberRef::clone(&subscriber),
            terminated: AtomicU8::new(0),
        });
        subscriber.on_subscribe(Upstream::Relay(subscription));
    }
}

struct NeverSubscription<T: Send + 'static> {
    downstream: SubscriberRef<T>,
    terminated: AtomicU8,
}

impl<T: Send + 'static> Subscription for NeverSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0
            && self
                .terminated
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.downstream.on_error(FlowError::bad_request());
        }
        // Positive demand can never be satisfied; it is absorbed.
    }

    fn cancel(&self) {
        self.terminated.store(1, Ordering::Release);
    }
}

/// Fails immediately with a clone of the given error.
pub(crate) struct FailSource {
    error: FlowError,
}

impl FailSource {
    pub(crate) fn new(error: FlowError) -> Self {
        Self { error }
    }
}

impl<T: Send + 'static> Source<T> for FailSource {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        subscriber.on_subscribe(NoopSubscription::upstream());
        subscriber.on_error(self.error.clone());
    }
}
