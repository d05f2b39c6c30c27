// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Identity stage that conceals upstream capabilities.
//!
//! Fusion and the scalar side-channel are deliberately not propagated, so
//! downstream operators see a plain relay edge. Use it to pin down
//! observable behavior at an operator boundary.

use rill_core::{FlowError, Source, SourceRef, SubscriberRef, Upstream};
use std::sync::Arc;

pub(crate) struct HideSource<T> {
    upstream: SourceRef<T>,
}

impl<T: Send + 'static> HideSource<T> {
    pub(crate) fn new(upstream: SourceRef<T>) -> Self {
        Self { upstream }
    }
}

impl<T: Send + 'static> Source<T> for HideSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        self.upstream.subscribe(Arc::new(HideStage {
            downstream: subscriber,
        }));
    }
}

struct HideStage<T: Send + 'static> {
    downstream: SubscriberRef<T>,
}

impl<T: Send + 'static> rill_core::Subscriber<T> for HideStage<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        self.downstream
            .on_subscribe(Upstream::Relay(upstream.subscription()));
    }

    fn on_next(&self, value: T) {
        self.downstream.on_next(value);
    }

    fn on_error(&self, error: FlowError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}
