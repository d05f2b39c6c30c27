// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Single-value flows.
//!
//! `Solo<T>` is the output of the reduction operators: a sequence that
//! emits at most one value, then terminates. It speaks the same protocol
//! as [`Flow`] (demand, cancellation, terminals), so it composes with
//! everything else; the type only records the multiplicity contract.

use crate::subscriber::BlockingSubscriber;
use crate::Flow;
use rill_core::{FlowError, Source, SourceRef, SubscriberRef};
use std::sync::Arc;
use std::time::Duration;

/// A flow of at most one value.
pub struct Solo<T: Send + 'static> {
    source: SourceRef<T>,
}

impl<T: Send + 'static> Clone for Solo<T> {
    fn clone(&self) -> Self {
        Self {
            source: SourceRef::clone(&self.source),
        }
    }
}

impl<T: Send + 'static> Solo<T> {
    pub(crate) fn from_source(source: impl Source<T>) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// Attaches a protocol-level subscriber.
    pub fn subscribe_with(&self, subscriber: SubscriberRef<T>) {
        self.source.subscribe(subscriber);
    }

    /// Widens back into a general flow.
    #[must_use]
    pub fn into_flow(self) -> Flow<T> {
        Flow::from_arc_source(self.source)
    }

    /// Transforms the value, keeping the single-emission contract.
    pub fn map<U: Send + 'static>(self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Solo<U> {
        let mapped = self.into_flow().map(f);
        Solo {
            source: SourceRef::clone(mapped.as_source()),
        }
    }

    /// Maps the value to an inner flow of any multiplicity.
    pub fn flatten_many<U: Send + 'static>(
        self,
        f: impl Fn(T) -> Flow<U> + Send + Sync + 'static,
    ) -> Flow<U> {
        self.into_flow().concat_map(f)
    }

    /// Blocks the calling thread until the terminal. `Ok(None)` means the
    /// solo completed empty; timing out cancels the subscription.
    ///
    /// # Errors
    /// The terminal error, or [`FlowError::Timeout`] after `timeout`.
    pub fn block(self, timeout: Duration) -> Result<Option<T>, FlowError> {
        let subscriber = Arc::new(BlockingSubscriber::new());
        self.source
            .subscribe(Arc::clone(&subscriber) as SubscriberRef<T>);
        subscriber.wait(timeout)
    }
}

impl<T: Clone + Send + Sync + 'static> Solo<T> {
    /// The scalar constructor, typed as a solo.
    #[must_use]
    pub fn just(value: T) -> Self {
        let flow = Flow::just(value);
        Self {
            source: SourceRef::clone(flow.as_source()),
        }
    }
}
