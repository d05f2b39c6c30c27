// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Recording consumer with controllable demand.

use parking_lot::{Condvar, Mutex};
use rill_core::{FlowError, Signal, Subscriber, Subscription, SubscriptionCell, Upstream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Terminal consumer that records every signal it observes.
///
/// Created with an initial demand; more is granted with
/// [`request`](Self::request). All accessors take snapshots, and the
/// `await_*` helpers block (with a timeout) until the condition holds,
/// which is how tests synchronize with executor-driven stages.
pub struct TestSubscriber<T: Send + 'static> {
    initial_demand: u64,
    state: Mutex<Recorded<T>>,
    changed: Condvar,
    upstream: SubscriptionCell,
    entered: AtomicBool,
}

struct Recorded<T> {
    signals: Vec<Signal<T>>,
    terminated: bool,
}

impl<T: Send + 'static> TestSubscriber<T> {
    /// Subscriber that immediately requests `initial_demand`.
    #[must_use]
    pub fn new(initial_demand: u64) -> Arc<Self> {
        Arc::new(Self {
            initial_demand,
            state: Mutex::new(Recorded {
                signals: Vec::new(),
                terminated: false,
            }),
            changed: Condvar::new(),
            upstream: SubscriptionCell::new(),
            entered: AtomicBool::new(false),
        })
    }

    /// Subscriber with unbounded demand.
    #[must_use]
    pub fn unbounded() -> Arc<Self> {
        Self::new(rill_core::UNBOUNDED)
    }

    /// Grants additional demand.
    pub fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    /// Cancels the subscription.
    pub fn cancel(&self) {
        self.upstream.cancel();
    }

    /// Every recorded signal, in observation order.
    pub fn signals(&self) -> Vec<Signal<T>>
    where
        T: Clone,
    {
        self.state.lock().signals.clone()
    }

    /// The recorded values, in order.
    pub fn values(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.state
            .lock()
            .signals
            .iter()
            .filter_map(|s| match s {
                Signal::Next(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    /// The terminal error, if one was observed.
    pub fn error(&self) -> Option<FlowError> {
        self.state.lock().signals.iter().find_map(|s| match s {
            Signal::Error(e) => Some(e.clone()),
            _ => None,
        })
    }

    /// `true` once `on_complete` was observed.
    pub fn is_complete(&self) -> bool {
        self.state
            .lock()
            .signals
            .iter()
            .any(|s| matches!(s, Signal::Complete))
    }

    /// `true` once either terminal was observed.
    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// Number of values observed so far.
    pub fn value_count(&self) -> usize {
        self.state
            .lock()
            .signals
            .iter()
            .filter(|s| s.is_next())
            .count()
    }

    /// Blocks until a terminal arrives. Panics on timeout.
    pub fn await_terminal(&self, timeout: Duration) {
        let mut state = self.state.lock();
        let deadline = Instant::now() + timeout;
        while !state.terminated {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                panic!(
                    "no terminal within {timeout:?}; observed {} signals",
                    state.signals.len()
                );
            }
        }
    }

    /// Blocks until at least `count` values arrived. Panics on timeout.
    pub fn await_values(&self, count: usize, timeout: Duration) {
        let mut state = self.state.lock();
        let deadline = Instant::now() + timeout;
        loop {
            let seen = state.signals.iter().filter(|s| s.is_next()).count();
            if seen >= count {
                return;
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                panic!("saw {seen} of {count} expected values within {timeout:?}");
            }
        }
    }

    /// Asserts nothing beyond the current recording arrives for `window`.
    pub fn assert_quiet(&self, window: Duration) {
        let baseline = self.state.lock().signals.len();
        std::thread::sleep(window);
        let now = self.state.lock().signals.len();
        assert_eq!(
            baseline, now,
            "expected silence, got {} new signals",
            now - baseline
        );
    }

    fn record(&self, signal: Signal<T>) {
        // Serialization law: two producers must never overlap in delivery.
        assert!(
            !self.entered.swap(true, Ordering::AcqRel),
            "overlapping signal delivery observed"
        );
        {
            let mut state = self.state.lock();
            if matches!(signal, Signal::Error(_) | Signal::Complete) {
                state.terminated = true;
            }
            state.signals.push(signal);
        }
        self.changed.notify_all();
        self.entered.store(false, Ordering::Release);
    }
}

impl<T: Send + 'static> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if self
            .upstream
            .set(rill_core::SubscriptionRef::clone(&subscription))
        {
            self.record(Signal::Subscribe);
            if self.initial_demand > 0 {
                subscription.request(self.initial_demand);
            }
        }
    }

    fn on_next(&self, value: T) {
        self.record(Signal::Next(value));
    }

    fn on_error(&self, error: FlowError) {
        self.record(Signal::Error(error));
        self.upstream.cancel();
    }

    fn on_complete(&self) {
        self.record(Signal::Complete);
        self.upstream.cancel();
    }
}
