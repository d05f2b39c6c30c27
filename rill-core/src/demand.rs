// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Saturating demand accounting.
//!
//! Demand is the number of elements a consumer has authorized but not yet
//! received. It only ever moves through the two operations below: `add`
//! when a `request` arrives, `produce` when elements go out. Both saturate
//! at [`UNBOUNDED`], the sentinel that disables the bound entirely.

use std::sync::atomic::{AtomicU64, Ordering};

/// Demand sentinel meaning "no bound": once reached, a counter stays there.
pub const UNBOUNDED: u64 = u64::MAX;

/// Adds two demand amounts, saturating at [`UNBOUNDED`].
#[must_use]
pub const fn add_cap(a: u64, b: u64) -> u64 {
    a.saturating_add(b)
}

/// Multiplies two demand amounts, saturating at [`UNBOUNDED`].
///
/// Used by prefetch math (`inners * per_inner_prefetch`).
#[must_use]
pub const fn mul_cap(a: u64, b: u64) -> u64 {
    a.saturating_mul(b)
}

/// Thread-safe outstanding-demand counter for one edge.
#[derive(Debug, Default)]
pub struct Demand(AtomicU64);

impl Demand {
    /// Starts at zero outstanding demand.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Starts with the given demand already granted.
    #[must_use]
    pub const fn with_initial(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    /// Current outstanding demand.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Accumulates `n` more demand, saturating. Returns the demand that was
    /// outstanding *before* the add; a `0` return means emission may have
    /// been stalled and the caller should kick the drain loop.
    pub fn add(&self, n: u64) -> u64 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            let next = add_cap(current, n);
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }

    /// Records `n` delivered elements. Returns the demand remaining after
    /// the decrement. Unbounded demand is never decremented.
    pub fn produce(&self, n: u64) -> u64 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            // Producing past the granted demand is a stage bug; saturate
            // rather than wrap so the failure stays visible downstream.
            let next = current.saturating_sub(n);
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// `true` once the counter holds the [`UNBOUNDED`] sentinel.
    pub fn is_unbounded(&self) -> bool {
        self.get() == UNBOUNDED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_returns_previous_value() {
        let d = Demand::new();
        assert_eq!(d.add(3), 0);
        assert_eq!(d.add(2), 3);
        assert_eq!(d.get(), 5);
    }

    #[test]
    fn produce_decrements() {
        let d = Demand::with_initial(4);
        assert_eq!(d.produce(1), 3);
        assert_eq!(d.produce(3), 0);
    }

    #[test]
    fn unbounded_is_sticky() {
        let d = Demand::new();
        d.add(UNBOUNDED);
        assert!(d.is_unbounded());
        assert_eq!(d.produce(10), UNBOUNDED);
        assert_eq!(d.add(1), UNBOUNDED);
    }

    #[test]
    fn add_saturates() {
        let d = Demand::with_initial(UNBOUNDED - 1);
        d.add(5);
        assert!(d.is_unbounded());
    }
}
