// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::Flow;
use rill_core::{Source, SubscriberRef};

/// Builds a fresh inner flow for every subscriber.
///
/// The factory runs at subscription time, so side effects and captured
/// state are evaluated per subscription, which is what makes `defer` the
/// canonical cold-source constructor.
pub(crate) struct DeferSource<T: Send + 'static, F> {
    factory: F,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Send + 'static, F: Fn() -> Flow<T> + Send + Sync + 'static> DeferSource<T, F> {
    pub(crate) fn new(factory: F) -> Self {
        Self {
            factory,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Send + 'static, F: Fn() -> Flow<T> + Send + Sync + 'static> Source<T>
    for DeferSource<T, F>
{
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        (self.factory)().subscribe_with(subscriber);
    }
}
