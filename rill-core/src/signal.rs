// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Value-level view of the four protocol signals.
//!
//! Stages communicate through the [`Subscriber`](crate::Subscriber) trait
//! directly; `Signal` exists for the places that need signals as data: test
//! recordings, replay history, and diagnostics.

use crate::error::FlowError;

/// One observed protocol signal.
///
/// A legal recording for a single subscriber always matches
/// `Subscribe (Next)* (Error | Complete)?` with at most one terminal.
#[derive(Debug, Clone)]
pub enum Signal<T> {
    /// The subscription handshake completed.
    Subscribe,
    /// One element was delivered.
    Next(T),
    /// The sequence failed.
    Error(FlowError),
    /// The sequence completed.
    Complete,
}

impl<T> Signal<T> {
    /// Returns `true` for `Next`.
    pub const fn is_next(&self) -> bool {
        matches!(self, Signal::Next(_))
    }

    /// Returns `true` for `Error` or `Complete`.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Signal::Error(_) | Signal::Complete)
    }

    /// The carried element, if any.
    pub fn into_value(self) -> Option<T> {
        match self {
            Signal::Next(v) => Some(v),
            _ => None,
        }
    }

    /// The carried error, if any.
    pub fn into_error(self) -> Option<FlowError> {
        match self {
            Signal::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Maps the carried element, keeping the other variants untouched.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Signal<U> {
        match self {
            Signal::Subscribe => Signal::Subscribe,
            Signal::Next(v) => Signal::Next(f(v)),
            Signal::Error(e) => Signal::Error(e),
            Signal::Complete => Signal::Complete,
        }
    }
}

impl<T: PartialEq> PartialEq for Signal<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Signal::Subscribe, Signal::Subscribe) => true,
            (Signal::Next(a), Signal::Next(b)) => a == b,
            (Signal::Complete, Signal::Complete) => true,
            // Errors are never equal, like the causes they carry.
            _ => false,
        }
    }
}
