// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The ambiguous race.
//!
//! All sources are subscribed; the first to produce any signal (a value or
//! a terminal) takes the atomic winner slot and the rest are cancelled.
//! Demand granted before the race settles is forwarded to every contender,
//! since any of them might become the winner.

use rill_core::{Arbiter, FlowError, Source, SourceRef, SubscriberRef, Subscription, Upstream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const UNDECIDED: usize = usize::MAX;

pub(crate) struct AmbSource<T> {
    sources: Vec<SourceRef<T>>,
}

impl<T: Send + 'static> AmbSource<T> {
    pub(crate) fn new(sources: Vec<SourceRef<T>>) -> Self {
        Self { sources }
    }
}

impl<T: Send + 'static> Source<T> for AmbSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        match self.sources.len() {
            0 => {
                subscriber.on_subscribe(rill_core::NoopSubscription::upstream());
                subscriber.on_complete();
                return;
            }
            1 => {
                self.sources[0].subscribe(subscriber);
                return;
            }
            _ => {}
        }
        let coordinator = Arc::new(AmbCoordinator {
            downstream: SubscriberRef::clone(&subscriber),
            winner: AtomicUsize::new(UNDECIDED),
            arbiters: (0..self.sources.len())
                .map(|_| Arc::new(Arbiter::new()))
                .collect(),
        });
        let subscription: rill_core::SubscriptionRef = Arc::clone(&coordinator) as rill_core::SubscriptionRef;
        subscriber.on_subscribe(Upstream::Relay(subscription));
        for (index, source) in self.sources.iter().enumerate() {
            if coordinator.winner.load(Ordering::Acquire) != UNDECIDED {
                // A synchronous contender already won; the rest never start.
                break;
            }
            let contender: SubscriberRef<T> = Arc::new(AmbContender {
                coordinator: Arc::clone(&coordinator),
                index,
            });
            source.subscribe(contender);
        }
    }
}

struct AmbCoordinator<T: Send + 'static> {
    downstream: SubscriberRef<T>,
    winner: AtomicUsize,
    arbiters: Vec<Arc<Arbiter>>,
}

impl<T: Send + 'static> AmbCoordinator<T> {
    /// Claims the slot for `index`, or confirms it already owns it.
    fn try_win(&self, index: usize) -> bool {
        match self
            .winner
            .compare_exchange(UNDECIDED, index, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                for (i, arbiter) in self.arbiters.iter().enumerate() {
                    if i != index {
                        arbiter.cancel();
                    }
                }
                true
            }
            Err(current) => current == index,
        }
    }
}

impl<T: Send + 'static> Subscription for AmbCoordinator<T> {
    fn request(&self, n: u64) {
        let winner = self.winner.load(Ordering::Acquire);
        if winner == UNDECIDED {
            for arbiter in &self.arbiters {
                arbiter.request(n);
            }
        } else if let Some(arbiter) = self.arbiters.get(winner) {
            arbiter.request(n);
        }
    }

    fn cancel(&self) {
        for arbiter in &self.arbiters {
            arbiter.cancel();
        }
    }
}

struct AmbContender<T: Send + 'static> {
    coordinator: Arc<AmbCoordinator<T>>,
    index: usize,
}

impl<T: Send + 'static> rill_core::Subscriber<T> for AmbContender<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.coordinator.arbiters[self.index].set_subscription(upstream.subscription());
    }

    fn on_next(&self, value: T) {
        if self.coordinator.try_win(self.index) {
            self.coordinator.arbiters[self.index].produced(1);
            self.coordinator.downstream.on_next(value);
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.coordinator.try_win(self.index) {
            self.coordinator.downstream.on_error(error);
        } else {
            rill_core::hooks::on_error_dropped(error);
        }
    }

    fn on_complete(&self) {
        if self.coordinator.try_win(self.index) {
            self.coordinator.downstream.on_complete();
        }
    }
}
