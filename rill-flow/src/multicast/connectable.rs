// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The connectable handle and its two lifecycle adapters.

use crate::Flow;
use rill_core::{
    CancellationToken, FlowError, Source, SourceRef, SubscriberRef, Subscription, Upstream,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// The capability a multicast hub adds on top of `Source`: starting the
/// single upstream subscription.
pub(crate) trait Connect: Send + Sync + 'static {
    /// Starts the upstream if not already started. The returned token
    /// disconnects: the upstream subscription is cancelled and the hub
    /// returns to the unconnected state.
    fn connect(&self) -> CancellationToken;
}

/// A hot source whose upstream start is an explicit step.
pub struct ConnectableFlow<T: Send + 'static> {
    source: SourceRef<T>,
    hub: Arc<dyn Connect>,
}

impl<T: Send + 'static> Clone for ConnectableFlow<T> {
    fn clone(&self) -> Self {
        Self {
            source: SourceRef::clone(&self.source),
            hub: Arc::clone(&self.hub),
        }
    }
}

impl<T: Send + 'static> ConnectableFlow<T> {
    pub(crate) fn new(source: SourceRef<T>, hub: Arc<dyn Connect>) -> Self {
        Self { source, hub }
    }

    /// Subscribes without starting the upstream; the subscriber parks until
    /// [`connect`](Self::connect).
    pub fn subscribe_with(&self, subscriber: SubscriberRef<T>) {
        self.source.subscribe(subscriber);
    }

    /// The flow view; subscribers still park until connect.
    pub fn flow(&self) -> Flow<T> {
        Flow::from_arc_source(SourceRef::clone(&self.source))
    }

    /// Starts the single upstream subscription. Idempotent while
    /// connected; the token disconnects.
    pub fn connect(&self) -> CancellationToken {
        self.hub.connect()
    }

    /// Connects automatically once `subscribers` have subscribed, and
    /// stays connected afterwards.
    #[must_use]
    pub fn auto_connect(self, subscribers: usize) -> Flow<T> {
        Flow::from_source(AutoConnectSource {
            connectable: self,
            remaining: AtomicUsize::new(subscribers.max(1)),
        })
    }

    /// Connects on the `subscribers`-th subscriber and disconnects when
    /// the live count drops below that threshold.
    #[must_use]
    pub fn ref_count(self, subscribers: usize) -> Flow<T> {
        Flow::from_source(RefCountSource {
            connectable: self,
            state: Arc::new(RefCountState {
                threshold: subscribers.max(1),
                live: AtomicUsize::new(0),
                connection: parking_lot::Mutex::new(None),
            }),
        })
    }
}

struct AutoConnectSource<T: Send + 'static> {
    connectable: ConnectableFlow<T>,
    remaining: AtomicUsize,
}

impl<T: Send + 'static> Source<T> for AutoConnectSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        self.connectable.subscribe_with(subscriber);
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1));
        if previous == Ok(1) {
            // The threshold subscriber triggers the connection, exactly
            // once.
            self.connectable.connect();
        }
    }
}

struct RefCountState {
    threshold: usize,
    live: AtomicUsize,
    connection: parking_lot::Mutex<Option<CancellationToken>>,
}

impl RefCountState {
    fn departed(&self) {
        let live = self.live.fetch_sub(1, Ordering::AcqRel) - 1;
        if live < self.threshold {
            if let Some(connection) = self.connection.lock().take() {
                connection.cancel();
            }
        }
    }
}

/// Shared one-shot departure latch between the tracking subscriber (for
/// terminals) and the tracking subscription (for cancels).
struct DepartureGuard {
    state: Arc<RefCountState>,
    left: AtomicBool,
}

impl DepartureGuard {
    fn leave(&self) {
        if !self.left.swap(true, Ordering::AcqRel) {
            self.state.departed();
        }
    }
}

struct RefCountSource<T: Send + 'static> {
    connectable: ConnectableFlow<T>,
    state: Arc<RefCountState>,
}

impl<T: Send + 'static> Source<T> for RefCountSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let guard = Arc::new(DepartureGuard {
            state: Arc::clone(&self.state),
            left: AtomicBool::new(false),
        });
        let tracked: SubscriberRef<T> = Arc::new(RefCountSubscriber {
            downstream: subscriber,
            guard: Arc::clone(&guard),
        });
        self.connectable.subscribe_with(tracked);
        let live = self.state.live.fetch_add(1, Ordering::AcqRel) + 1;
        if live == self.state.threshold {
            let connection = self.connectable.connect();
            *self.state.connection.lock() = Some(connection);
        }
    }
}

struct RefCountSubscriber<T: Send + 'static> {
    downstream: SubscriberRef<T>,
    guard: Arc<DepartureGuard>,
}

impl<T: Send + 'static> rill_core::Subscriber<T> for RefCountSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.downstream
            .on_subscribe(Upstream::Relay(Arc::new(RefCountSubscription {
                inner: upstream.subscription(),
                guard: Arc::clone(&self.guard),
            })));
    }

    fn on_next(&self, value: T) {
        self.downstream.on_next(value);
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
        self.guard.leave();
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
        self.guard.leave();
    }
}

struct RefCountSubscription {
    inner: rill_core::SubscriptionRef,
    guard: Arc<DepartureGuard>,
}

impl Subscription for RefCountSubscription {
    fn request(&self, n: u64) {
        self.inner.request(n);
    }

    fn cancel(&self) {
        self.inner.cancel();
        self.guard.leave();
    }
}
