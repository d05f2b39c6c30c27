// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Upstream-handle plumbing.
//!
//! [`SubscriptionCell`] is the basic container: set-once (or swap) storage
//! for the upstream subscription with idempotent cancel propagation.
//!
//! [`Arbiter`] is the demand-preserving variant used by the operators that
//! replace their upstream mid-flight (concat, retry, resume-on-error): it
//! tracks how much of the granted demand the retired upstream produced and
//! transfers the unsatisfied remainder to the replacement. All of its entry
//! points trampoline through a [`Wip`] drain so that a reentrant `request`
//! arriving while a swap is in progress enqueues instead of recursing.

use crate::demand::{add_cap, UNBOUNDED};
use crate::error::FlowError;
use crate::hooks;
use crate::traits::{Subscription, SubscriptionRef};
use crate::wip::Wip;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Set-once / swap storage for an upstream subscription.
#[derive(Default)]
pub struct SubscriptionCell {
    state: Mutex<CellState>,
}

#[derive(Default)]
struct CellState {
    current: Option<SubscriptionRef>,
    cancelled: bool,
}

impl SubscriptionCell {
    /// An empty, uncancelled cell.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the subscription. Returns `false` (cancelling the incoming
    /// handle) when the cell is cancelled, or when it was already occupied:
    /// a second `on_subscribe` is a protocol violation and is routed to the
    /// dropped-error hook.
    pub fn set(&self, subscription: SubscriptionRef) -> bool {
        {
            let mut state = self.state.lock();
            if !state.cancelled && state.current.is_none() {
                state.current = Some(subscription);
                return true;
            }
            if state.cancelled {
                drop(state);
                subscription.cancel();
                return false;
            }
        }
        subscription.cancel();
        hooks::on_error_dropped(FlowError::protocol(
            "subscription already set; a stage may only be subscribed once",
        ));
        false
    }

    /// Swaps in a new subscription, cancelling the previous occupant. Used
    /// for inner subscriptions that supersede each other (switch, per-item
    /// timers). Returns `false` and cancels the incoming handle when the
    /// cell is already cancelled.
    pub fn replace(&self, subscription: SubscriptionRef) -> bool {
        let (accepted, previous) = {
            let mut state = self.state.lock();
            if state.cancelled {
                (false, None)
            } else {
                (
                    true,
                    state.current.replace(SubscriptionRef::clone(&subscription)),
                )
            }
        };
        if !accepted {
            subscription.cancel();
            return false;
        }
        if let Some(old) = previous {
            old.cancel();
        }
        true
    }

    /// Forwards a demand grant to the stored subscription, if any.
    pub fn request(&self, n: u64) {
        let current = self.state.lock().current.clone();
        if let Some(subscription) = current {
            subscription.request(n);
        }
    }

    /// Cancels and removes the current occupant without closing the cell:
    /// the next `set`/`replace` is still accepted. Used by stages that
    /// rotate per-item inner subscriptions (watchdogs, companions).
    pub fn cancel_current(&self) {
        let current = self.state.lock().current.take();
        if let Some(subscription) = current {
            subscription.cancel();
        }
    }

    /// Cancels the cell and the stored subscription. Idempotent.
    pub fn cancel(&self) {
        let current = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.current.take()
        };
        if let Some(subscription) = current {
            subscription.cancel();
        }
    }

    /// `true` once [`cancel`](Self::cancel) ran.
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// The stored subscription, if present and not cancelled.
    pub fn get(&self) -> Option<SubscriptionRef> {
        self.state.lock().current.clone()
    }
}

/// Demand-preserving upstream switcher.
///
/// The arbiter is itself a [`Subscription`]: stages hand it downstream as
/// their upstream handle and feed it through [`set_subscription`]
/// (a new upstream is live) and [`produced`] (elements were delivered from
/// the current upstream). The unsatisfied demand (granted minus produced)
/// is re-requested from every replacement upstream.
///
/// [`set_subscription`]: Arbiter::set_subscription
/// [`produced`]: Arbiter::produced
#[derive(Default)]
pub struct Arbiter {
    missed_requested: AtomicU64,
    missed_produced: AtomicU64,
    missed_subscription: Mutex<Option<SubscriptionRef>>,
    cancelled: AtomicBool,
    wip: Wip,
    state: Mutex<ArbiterState>,
}

#[derive(Default)]
struct ArbiterState {
    current: Option<SubscriptionRef>,
    requested: u64,
}

impl Arbiter {
    /// An arbiter with no upstream and no outstanding demand.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the live upstream. The previous upstream (normally already
    /// terminal) is cancelled; the unsatisfied demand is requested from the
    /// replacement.
    pub fn set_subscription(&self, subscription: SubscriptionRef) {
        if self.cancelled.load(Ordering::Acquire) {
            subscription.cancel();
            return;
        }
        {
            let mut slot = self.missed_subscription.lock();
            if let Some(superseded) = slot.replace(subscription) {
                drop(slot);
                superseded.cancel();
            }
        }
        self.drain();
    }

    /// Records `n` elements delivered by the current upstream, shrinking the
    /// demand a replacement will inherit.
    pub fn produced(&self, n: u64) {
        if n == 0 {
            return;
        }
        saturating_fetch_add(&self.missed_produced, n);
        self.drain();
    }

    /// Outstanding (granted minus produced) demand. Exposed for stages that
    /// gate emission on it and for tests.
    pub fn requested(&self) -> u64 {
        self.state.lock().requested
    }

    /// `true` once [`cancel`](Subscription::cancel) ran.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            let added = self.missed_requested.swap(0, Ordering::AcqRel);
            let produced = self.missed_produced.swap(0, Ordering::AcqRel);
            let incoming = self.missed_subscription.lock().take();
            let cancelled = self.cancelled.load(Ordering::Acquire);

            let mut retire: Option<SubscriptionRef> = None;
            let mut reject: Option<SubscriptionRef> = None;
            let mut forward: Option<(SubscriptionRef, u64)> = None;
            {
                let mut state = self.state.lock();
                if cancelled {
                    retire = state.current.take();
                    reject = incoming;
                    state.requested = 0;
                } else {
                    let mut requested = state.requested;
                    if requested != UNBOUNDED {
                        requested = add_cap(requested, added);
                        if requested != UNBOUNDED {
                            requested = requested.saturating_sub(produced);
                        }
                    }
                    state.requested = requested;
                    if let Some(next) = incoming {
                        retire = state.current.replace(SubscriptionRef::clone(&next));
                        if requested > 0 {
                            forward = Some((next, requested));
                        }
                    } else if added > 0 {
                        if let Some(current) = state.current.clone() {
                            forward = Some((current, added));
                        }
                    }
                }
            }
            // Foreign calls happen strictly outside the state lock; a
            // reentrant request lands in the missed counters and is picked
            // up by the leave() check below.
            if let Some(old) = retire {
                old.cancel();
            }
            if let Some(new) = reject {
                new.cancel();
            }
            if let Some((subscription, n)) = forward {
                subscription.request(n);
            }

            missed = self.wip.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }
}

impl Subscription for Arbiter {
    fn request(&self, n: u64) {
        if n == 0 || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        saturating_fetch_add(&self.missed_requested, n);
        self.drain();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.drain();
        }
    }
}

fn saturating_fetch_add(counter: &AtomicU64, n: u64) {
    let mut current = counter.load(Ordering::Acquire);
    loop {
        let next = add_cap(current, n);
        match counter.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as TestCounter;
    use std::sync::Arc;

    #[derive(Default)]
    struct Probe {
        requested: TestCounter,
        cancelled: AtomicBool,
    }

    impl Subscription for Probe {
        fn request(&self, n: u64) {
            self.requested.fetch_add(n, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn cell_set_is_once() {
        let cell = SubscriptionCell::new();
        let first = Arc::new(Probe::default());
        let second = Arc::new(Probe::default());
        assert!(cell.set(first.clone()));
        assert!(!cell.set(second.clone()));
        assert!(second.cancelled.load(Ordering::SeqCst));
        assert!(!first.cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn cell_cancel_reaches_current_and_future() {
        let cell = SubscriptionCell::new();
        let first = Arc::new(Probe::default());
        assert!(cell.set(first.clone()));
        cell.cancel();
        assert!(first.cancelled.load(Ordering::SeqCst));
        let late = Arc::new(Probe::default());
        assert!(!cell.set(late.clone()));
        assert!(late.cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn cell_replace_cancels_previous() {
        let cell = SubscriptionCell::new();
        let first = Arc::new(Probe::default());
        let second = Arc::new(Probe::default());
        assert!(cell.set(first.clone()));
        assert!(cell.replace(second.clone()));
        assert!(first.cancelled.load(Ordering::SeqCst));
        assert!(!second.cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn arbiter_transfers_unsatisfied_demand() {
        let arbiter = Arbiter::new();
        let first = Arc::new(Probe::default());
        arbiter.request(10);
        arbiter.set_subscription(first.clone());
        assert_eq!(first.requested.load(Ordering::SeqCst), 10);

        // First upstream delivers 4, then terminates; replacement inherits 6.
        arbiter.produced(4);
        let second = Arc::new(Probe::default());
        arbiter.set_subscription(second.clone());
        assert_eq!(second.requested.load(Ordering::SeqCst), 6);
        assert_eq!(arbiter.requested(), 6);
    }

    #[test]
    fn arbiter_forwards_increments_to_current() {
        let arbiter = Arbiter::new();
        let upstream = Arc::new(Probe::default());
        arbiter.set_subscription(upstream.clone());
        arbiter.request(3);
        arbiter.request(2);
        assert_eq!(upstream.requested.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn arbiter_unbounded_is_sticky_across_swaps() {
        let arbiter = Arbiter::new();
        arbiter.request(UNBOUNDED);
        arbiter.produced(1_000);
        let upstream = Arc::new(Probe::default());
        arbiter.set_subscription(upstream.clone());
        assert_eq!(upstream.requested.load(Ordering::SeqCst), UNBOUNDED);
    }

    #[test]
    fn arbiter_cancel_reaches_upstreams() {
        let arbiter = Arbiter::new();
        let current = Arc::new(Probe::default());
        arbiter.set_subscription(current.clone());
        arbiter.cancel();
        assert!(current.cancelled.load(Ordering::SeqCst));
        let late = Arc::new(Probe::default());
        arbiter.set_subscription(late.clone());
        assert!(late.cancelled.load(Ordering::SeqCst));
    }
}
