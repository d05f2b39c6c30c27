// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The `Flow` facade: constructors for the cold sources and one method per
//! operator stage. A `Flow<T>` is a cheap handle (an `Arc` to the source
//! graph); cloning it and subscribing several times replays the cold chain
//! per subscriber.

use crate::multicast::connectable::Connect;
use crate::multicast::publish::PublishHub;
use crate::multicast::replay::{ReplayConfig, ReplayHub};
use crate::ops;
use crate::ops::concat::ErrorMode;
use crate::ops::flat_map::FlatMapConfig;
use crate::ops::group_by::GroupedFlow;
use crate::ops::reduce::{FoldControl, FoldSource};
use crate::ops::tap::Tap;
use crate::solo::Solo;
use crate::source;
use crate::source::create::Emitter;
use crate::subscriber::LambdaSubscriber;
use crate::ConnectableFlow;
use rill_core::{
    CancellationToken, FlowError, OverflowPolicy, Source, SourceRef, SubscriberRef,
};
use rill_runtime::{DelayedExecutorRef, ExecutorRef};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// An asynchronous, backpressure-aware sequence of values.
pub struct Flow<T: Send + 'static> {
    source: SourceRef<T>,
}

impl<T: Send + 'static> Clone for Flow<T> {
    fn clone(&self) -> Self {
        Self {
            source: SourceRef::clone(&self.source),
        }
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

impl<T: Send + 'static> Flow<T> {
    pub(crate) fn from_source(source: impl Source<T>) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    pub(crate) fn from_arc_source(source: SourceRef<T>) -> Self {
        Self { source }
    }

    /// Wraps a custom [`Source`] implementation, giving it the whole
    /// operator algebra.
    pub fn wrap(source: impl Source<T>) -> Self {
        Self::from_source(source)
    }

    /// Wraps an already-shared source handle.
    #[must_use]
    pub fn from_shared(source: SourceRef<T>) -> Self {
        Self { source }
    }

    pub(crate) fn as_source(&self) -> &SourceRef<T> {
        &self.source
    }

    /// Completes immediately without emitting.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_source(source::scalar::EmptySource)
    }

    /// Never signals after the handshake.
    #[must_use]
    pub fn never() -> Self {
        Self::from_source(source::scalar::NeverSource)
    }

    /// Fails immediately with (clones of) the given error.
    #[must_use]
    pub fn fail(error: FlowError) -> Self {
        Self::from_source(source::scalar::FailSource::new(error))
    }

    /// Replays the iterable per subscriber.
    pub fn from_iter<I>(iterable: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send + 'static,
    {
        Self::from_source(source::iter::IterSource::new(iterable))
    }

    /// Builds a fresh flow per subscriber.
    pub fn defer(factory: impl Fn() -> Flow<T> + Send + Sync + 'static) -> Self {
        Self::from_source(source::defer::DeferSource::new(factory))
    }

    /// Imperative producer facade; `policy` governs values arriving with
    /// no outstanding demand.
    pub fn create(
        setup: impl Fn(Emitter<T>) + Send + Sync + 'static,
        policy: OverflowPolicy,
    ) -> Self {
        Self::from_source(source::create::CreateSource::new(setup, policy))
    }

    /// Subscribes source *i + 1* after source *i* completes.
    #[must_use]
    pub fn concat(flows: Vec<Flow<T>>) -> Self {
        Self::concat_mode(flows, ErrorMode::Immediate)
    }

    /// `concat` with an explicit error-surfacing mode.
    #[must_use]
    pub fn concat_mode(flows: Vec<Flow<T>>, mode: ErrorMode) -> Self {
        let sources = flows.into_iter().map(|f| f.source).collect();
        Self::from_source(ops::concat::ConcatSource::new(sources, mode))
    }

    /// Interleaves all sources at the default concurrency bound.
    #[must_use]
    pub fn merge(flows: Vec<Flow<T>>) -> Self {
        Self::merge_concurrent(flows, FlatMapConfig::default().concurrency)
    }

    /// Interleaves at most `concurrency` sources at a time.
    #[must_use]
    pub fn merge_concurrent(flows: Vec<Flow<T>>, concurrency: usize) -> Self {
        Flow::from_iter(flows).flat_map_with(|flow| Ok(flow), FlatMapConfig::concurrency(concurrency))
    }

    /// Races all sources; the first to signal wins and the rest are
    /// cancelled.
    #[must_use]
    pub fn amb(flows: Vec<Flow<T>>) -> Self {
        let sources = flows.into_iter().map(|f| f.source).collect();
        Self::from_source(ops::amb::AmbSource::new(sources))
    }

    /// Lockstep combination of N same-typed flows.
    pub fn zip<R: Send + 'static>(
        flows: Vec<Flow<T>>,
        combiner: impl Fn(Vec<T>) -> R + Send + Sync + 'static,
    ) -> Flow<R> {
        let sources = flows.into_iter().map(|f| f.source).collect();
        Flow::from_source(ops::zip::ZipManySource::new(sources, move |row| {
            Ok(combiner(row))
        }))
    }

    /// Latest-value combination of N same-typed flows.
    pub fn combine_latest<R: Send + 'static>(
        flows: Vec<Flow<T>>,
        combiner: impl Fn(Vec<T>) -> R + Send + Sync + 'static,
    ) -> Flow<R>
    where
        T: Clone,
    {
        let sources = flows.into_iter().map(|f| f.source).collect();
        Flow::from_source(ops::combine_latest::CombineLatestSource::new(
            sources,
            move |row| Ok(combiner(row)),
        ))
    }

    /// Mirrors the newest inner flow of a flow of flows.
    #[must_use]
    pub fn switch_on_next(outer: Flow<Flow<T>>) -> Self {
        outer.switch_map(|inner| inner)
    }

    /// Drives a `futures::Stream` as a flow; the pump runs on `executor`
    /// and polls only while demand is outstanding. Single-subscriber.
    pub fn from_stream<S>(stream: S, executor: ExecutorRef) -> Self
    where
        S: futures::Stream<Item = T> + Send + 'static,
    {
        Self::from_source(crate::bridge::FromStreamSource::new(stream, executor))
    }
}

impl<T: Clone + Send + Sync + 'static> Flow<T> {
    /// Emits one value, then completes. The canonical scalar source.
    #[must_use]
    pub fn just(value: T) -> Self {
        Self::from_source(source::scalar::JustSource::new(value))
    }
}

impl Flow<i64> {
    /// Emits `count` consecutive integers starting at `start`.
    #[must_use]
    pub fn range(start: i64, count: usize) -> Self {
        Self::from_iter(start..start + count as i64)
    }
}

impl Flow<u64> {
    /// Emits `0` after `delay`, then completes.
    #[must_use]
    pub fn timer(delay: Duration, executor: DelayedExecutorRef) -> Self {
        Self::from_source(source::timer::TimerSource::new(delay, executor))
    }

    /// Emits `0, 1, 2, ...` every `period`.
    #[must_use]
    pub fn interval(period: Duration, executor: DelayedExecutorRef) -> Self {
        Self::interval_with(period, period, executor)
    }

    /// `interval` with a distinct initial delay.
    #[must_use]
    pub fn interval_with(
        initial_delay: Duration,
        period: Duration,
        executor: DelayedExecutorRef,
    ) -> Self {
        Self::from_source(source::timer::IntervalSource::new(
            initial_delay,
            period,
            executor,
        ))
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

impl<T: Send + 'static> Flow<T> {
    /// Attaches a protocol-level subscriber.
    pub fn subscribe_with(&self, subscriber: SubscriberRef<T>) {
        self.source.subscribe(subscriber);
    }

    /// Consumes values at unbounded demand. Errors go to the dropped-error
    /// hook. The returned token cancels the subscription.
    pub fn subscribe(&self, on_next: impl Fn(T) + Send + Sync + 'static) -> CancellationToken {
        let subscriber = Arc::new(LambdaSubscriber::new(on_next, None, None));
        let cell = Arc::clone(&subscriber.upstream);
        let token = CancellationToken::new();
        token.on_cancel(move || cell.cancel());
        self.subscribe_with(subscriber);
        token
    }

    /// `subscribe` with explicit terminal handlers.
    pub fn subscribe_handlers(
        &self,
        on_next: impl Fn(T) + Send + Sync + 'static,
        on_error: impl Fn(FlowError) + Send + Sync + 'static,
        on_complete: impl Fn() + Send + Sync + 'static,
    ) -> CancellationToken {
        let subscriber = Arc::new(LambdaSubscriber::new(
            on_next,
            Some(Box::new(on_error)),
            Some(Box::new(on_complete)),
        ));
        let cell = Arc::clone(&subscriber.upstream);
        let token = CancellationToken::new();
        token.on_cancel(move || cell.cancel());
        self.subscribe_with(subscriber);
        token
    }

    /// Pull view with `futures::Stream` semantics; `prefetch` bounds the
    /// crossing queue.
    pub fn into_stream(&self, prefetch: usize) -> crate::bridge::FlowStream<T> {
        crate::bridge::into_stream(self, prefetch)
    }
}

// ---------------------------------------------------------------------------
// Stateless operators
// ---------------------------------------------------------------------------

impl<T: Send + 'static> Flow<T> {
    /// 1:1 transformation; fusable and scalar-transparent.
    pub fn map<U: Send + 'static>(self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Flow<U> {
        Flow::from_source(ops::map::MapSource::new(self.source, move |v| Ok(f(v))))
    }

    /// Fallible 1:1 transformation; an `Err` terminates the flow.
    pub fn try_map<U: Send + 'static>(
        self,
        f: impl Fn(T) -> Result<U, FlowError> + Send + Sync + 'static,
    ) -> Flow<U> {
        Flow::from_source(ops::map::MapSource::new(self.source, f))
    }

    /// Infallible conversion through `From`; a fused identity-shape map.
    pub fn cast<U>(self) -> Flow<U>
    where
        U: From<T> + Send + 'static,
    {
        self.map(U::from)
    }

    /// Predicate gate; drops are compensated upstream.
    pub fn filter(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flow<T> {
        Flow::from_source(ops::filter::FilterSource::new(self.source, move |v| {
            Ok(predicate(v))
        }))
    }

    /// Fallible predicate gate.
    pub fn try_filter(
        self,
        predicate: impl Fn(&T) -> Result<bool, FlowError> + Send + Sync + 'static,
    ) -> Flow<T> {
        Flow::from_source(ops::filter::FilterSource::new(self.source, predicate))
    }

    /// Conceals fusion and the scalar side-channel.
    #[must_use]
    pub fn hide(self) -> Flow<T> {
        Flow::from_source(ops::hide::HideSource::new(self.source))
    }

    /// Attaches side-effect callbacks to the signals on this edge.
    #[must_use]
    pub fn tap(self, callbacks: Tap<T>) -> Flow<T> {
        Flow::from_source(ops::tap::TapSource::new(self.source, callbacks))
    }
}

// ---------------------------------------------------------------------------
// Slicing
// ---------------------------------------------------------------------------

impl<T: Send + 'static> Flow<T> {
    /// Delivers the first `count` elements, then cancels upstream.
    #[must_use]
    pub fn take(self, count: u64) -> Flow<T> {
        Flow::from_source(ops::take::TakeSource::new(self.source, count))
    }

    /// Delivers elements while the predicate holds.
    pub fn take_while(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flow<T> {
        Flow::from_source(ops::take::TakeWhileSource::new(self.source, move |v| {
            Ok(predicate(v))
        }))
    }

    /// Drops the first `count` elements.
    #[must_use]
    pub fn skip(self, count: u64) -> Flow<T> {
        Flow::from_source(ops::skip::SkipSource::new(self.source, count))
    }
}

impl<T: Clone + Send + Sync + 'static> Flow<T> {
    /// Emits the given items ahead of the upstream.
    #[must_use]
    pub fn start_with(self, items: Vec<T>) -> Flow<T> {
        Flow::concat(vec![Flow::from_iter(items), self])
    }

    /// Substitutes `fallback` when the upstream completes empty.
    #[must_use]
    pub fn default_if_empty(self, fallback: T) -> Flow<T> {
        Flow::from_source(ops::start_with::DefaultIfEmptySource::new(
            self.source,
            fallback,
        ))
    }
}

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

impl<T: Send + 'static> Flow<T> {
    /// First occurrence per key passes.
    pub fn distinct_by<K>(self, key_fn: impl Fn(&T) -> K + Send + Sync + 'static) -> Flow<T>
    where
        K: Hash + Eq + Send + 'static,
    {
        Flow::from_source(ops::distinct::DistinctSource::new(self.source, key_fn))
    }

    /// Suppresses adjacent duplicates by key.
    pub fn distinct_until_changed_by<K>(
        self,
        key_fn: impl Fn(&T) -> K + Send + Sync + 'static,
    ) -> Flow<T>
    where
        K: PartialEq + Send + 'static,
    {
        Flow::from_source(ops::distinct::DistinctUntilChangedSource::new(
            self.source,
            key_fn,
        ))
    }
}

impl<T: Clone + Hash + Eq + Send + 'static> Flow<T> {
    /// First occurrence of each value passes.
    #[must_use]
    pub fn distinct(self) -> Flow<T> {
        self.distinct_by(Clone::clone)
    }
}

impl<T: Clone + PartialEq + Send + 'static> Flow<T> {
    /// Suppresses adjacent duplicate values.
    #[must_use]
    pub fn distinct_until_changed(self) -> Flow<T> {
        self.distinct_until_changed_by(Clone::clone)
    }
}

// ---------------------------------------------------------------------------
// Ordering combinators
// ---------------------------------------------------------------------------

impl<T: Send + 'static> Flow<T> {
    /// Appends `other` after this flow completes.
    #[must_use]
    pub fn concat_with(self, other: Flow<T>) -> Flow<T> {
        Flow::concat(vec![self, other])
    }

    /// Maps each element to an inner flow, draining them strictly in
    /// sequence.
    pub fn concat_map<U: Send + 'static>(
        self,
        f: impl Fn(T) -> Flow<U> + Send + Sync + 'static,
    ) -> Flow<U> {
        self.concat_map_mode(f, ErrorMode::Immediate)
    }

    /// `concat_map` with an explicit error-surfacing mode.
    pub fn concat_map_mode<U: Send + 'static>(
        self,
        f: impl Fn(T) -> Flow<U> + Send + Sync + 'static,
        mode: ErrorMode,
    ) -> Flow<U> {
        Flow::from_source(ops::concat_map::ConcatMapSource::new(
            self.source,
            move |v| Ok(f(v)),
            mode,
        ))
    }

    /// Switches to the inner flow of each new element, cancelling the
    /// previous inner.
    pub fn switch_map<U: Send + 'static>(
        self,
        f: impl Fn(T) -> Flow<U> + Send + Sync + 'static,
    ) -> Flow<U> {
        Flow::from_source(ops::switch_map::SwitchMapSource::new(
            self.source,
            move |v| Ok(f(v)),
        ))
    }
}

// ---------------------------------------------------------------------------
// Interleaving combinators
// ---------------------------------------------------------------------------

impl<T: Send + 'static> Flow<T> {
    /// Maps each element to an inner flow and merges them concurrently
    /// with default tuning.
    pub fn flat_map<U: Send + 'static>(
        self,
        f: impl Fn(T) -> Flow<U> + Send + Sync + 'static,
    ) -> Flow<U> {
        self.flat_map_with(move |v| Ok(f(v)), FlatMapConfig::default())
    }

    /// `flat_map` with explicit concurrency, prefetch and delay-error
    /// tuning; the mapper may fail.
    pub fn flat_map_with<U: Send + 'static>(
        self,
        f: impl Fn(T) -> Result<Flow<U>, FlowError> + Send + Sync + 'static,
        config: FlatMapConfig,
    ) -> Flow<U> {
        Flow::from_source(ops::flat_map::FlatMapSource::new(self.source, f, config))
    }

    /// Pairs this flow with `other` in lockstep.
    pub fn zip_with<U, R>(
        self,
        other: Flow<U>,
        combiner: impl Fn(T, U) -> R + Send + Sync + 'static,
    ) -> Flow<R>
    where
        U: Send + 'static,
        R: Send + 'static,
    {
        Flow::from_source(ops::zip::ZipWithSource::new(
            self.source,
            other.source,
            move |a, b| Ok(combiner(a, b)),
        ))
    }

    /// Combines each element with the latest value of a side flow; drops
    /// elements while the side is still empty.
    pub fn with_latest_from<S, R>(
        self,
        side: Flow<S>,
        combiner: impl Fn(T, S) -> R + Send + Sync + 'static,
    ) -> Flow<R>
    where
        S: Clone + Send + 'static,
        R: Send + 'static,
    {
        Flow::from_source(ops::with_latest_from::WithLatestFromSource::new(
            self.source,
            side.source,
            move |a, b| Ok(combiner(a, b)),
        ))
    }
}

// ---------------------------------------------------------------------------
// Rate / time operators
// ---------------------------------------------------------------------------

impl<T: Send + 'static> Flow<T> {
    /// Emits the value latched since the previous periodic tick.
    #[must_use]
    pub fn sample(self, period: Duration, executor: DelayedExecutorRef) -> Flow<T> {
        Flow::from_source(ops::sample::SampleSource::new(self.source, period, executor))
    }

    /// Emits the first value of each period-long window.
    #[must_use]
    pub fn sample_first(self, period: Duration, executor: DelayedExecutorRef) -> Flow<T> {
        Flow::from_source(ops::sample::SampleFirstSource::new(
            self.source,
            period,
            executor,
        ))
    }

    /// Drops elements arriving inside the throttling window opened by the
    /// previous delivery.
    #[must_use]
    pub fn throttle(self, window: Duration) -> Flow<T> {
        Flow::from_source(ops::throttle::ThrottleSource::new(self.source, window))
    }

    /// Shifts every signal by `delay`.
    #[must_use]
    pub fn delay(self, delay: Duration, executor: DelayedExecutorRef) -> Flow<T> {
        Flow::from_source(ops::delay::DelaySource::new(self.source, delay, executor))
    }

    /// Shifts the subscription itself by `delay`.
    #[must_use]
    pub fn delay_subscription(self, delay: Duration, executor: DelayedExecutorRef) -> Flow<T> {
        Flow::from_source(ops::delay::DelaySubscriptionSource::new(
            self.source,
            delay,
            executor,
        ))
    }

    /// Errors with [`FlowError::Timeout`] if the gap between elements
    /// exceeds `timeout`.
    #[must_use]
    pub fn timeout(self, timeout: Duration, executor: DelayedExecutorRef) -> Flow<T> {
        self.timeout_inner(timeout, executor, None)
    }

    /// Switches to `fallback` instead of erroring on timeout.
    #[must_use]
    pub fn timeout_or(
        self,
        timeout: Duration,
        executor: DelayedExecutorRef,
        fallback: Flow<T>,
    ) -> Flow<T> {
        self.timeout_inner(timeout, executor, Some(fallback))
    }

    fn timeout_inner(
        self,
        timeout: Duration,
        executor: DelayedExecutorRef,
        fallback: Option<Flow<T>>,
    ) -> Flow<T> {
        let first_executor = DelayedExecutorRef::clone(&executor);
        Flow::from_source(ops::timeout::TimeoutSource::new(
            self.source,
            Box::new(move || Flow::timer(timeout, DelayedExecutorRef::clone(&first_executor))),
            Box::new(move |_: &T| Flow::timer(timeout, DelayedExecutorRef::clone(&executor))),
            fallback,
            Some(timeout),
        ))
    }

    /// Fully general per-item watchdog: `first` races the first element,
    /// `per_item` builds the companion racing each subsequent gap.
    pub fn timeout_when<C: Send + 'static>(
        self,
        first: Flow<C>,
        per_item: impl Fn(&T) -> Flow<C> + Send + Sync + 'static,
        fallback: Option<Flow<T>>,
    ) -> Flow<T> {
        Flow::from_source(ops::timeout::TimeoutSource::new(
            self.source,
            Box::new(move || first.clone()),
            Box::new(per_item),
            fallback,
            None,
        ))
    }
}

impl<T: Clone + Send + 'static> Flow<T> {
    /// Debounces: an element is emitted when its companion fires before a
    /// newer element supersedes it.
    pub fn sample_timeout<C: Send + 'static>(
        self,
        companion: impl Fn(&T) -> Flow<C> + Send + Sync + 'static,
    ) -> Flow<T> {
        Flow::from_source(ops::sample::SampleTimeoutSource::new(self.source, companion))
    }
}

// ---------------------------------------------------------------------------
// Buffers & windows
// ---------------------------------------------------------------------------

impl<T: Clone + Send + 'static> Flow<T> {
    /// Collects elements into non-overlapping batches of `count`.
    #[must_use]
    pub fn buffer(self, count: usize) -> Flow<Vec<T>> {
        self.buffer_with_skip(count, count)
    }

    /// Count batches with an open cadence: `skip < max_size` overlaps,
    /// `skip > max_size` drops between batches.
    #[must_use]
    pub fn buffer_with_skip(self, max_size: usize, skip: usize) -> Flow<Vec<T>> {
        Flow::from_source(ops::buffer::BufferCountSource::new(
            self.source,
            max_size,
            skip,
        ))
    }

    /// Closes the running batch on each companion signal.
    pub fn buffer_boundary<C: Send + 'static>(self, boundary: Flow<C>) -> Flow<Vec<T>> {
        Flow::from_source(ops::buffer::BufferBoundarySource::new(self.source, boundary))
    }

    /// Duration-bounded batches driven by the executor clock.
    #[must_use]
    pub fn buffer_time(self, period: Duration, executor: DelayedExecutorRef) -> Flow<Vec<T>> {
        let boundary = Flow::interval(period, executor);
        self.buffer_boundary(boundary)
    }

    /// Arbitrary-overlap batches: each `open` element starts a batch that
    /// its own close companion ends.
    pub fn buffer_when<O, C>(
        self,
        open: Flow<O>,
        close_fn: impl Fn(&O) -> Flow<C> + Send + Sync + 'static,
    ) -> Flow<Vec<T>>
    where
        O: Send + 'static,
        C: Send + 'static,
    {
        Flow::from_source(ops::buffer::BufferWhenSource::new(self.source, open, close_fn))
    }

    /// Splits into exact substream windows of `count`.
    #[must_use]
    pub fn window(self, count: usize) -> Flow<Flow<T>> {
        self.window_with_skip(count, count)
    }

    /// Count windows with an open cadence; see
    /// [`buffer_with_skip`](Self::buffer_with_skip) for the overlap rules.
    #[must_use]
    pub fn window_with_skip(self, max_size: usize, skip: usize) -> Flow<Flow<T>> {
        Flow::from_source(ops::window::WindowCountSource::new(
            self.source,
            max_size,
            skip,
        ))
    }

    /// Rotates the current window on each companion signal.
    pub fn window_boundary<C: Send + 'static>(self, boundary: Flow<C>) -> Flow<Flow<T>> {
        Flow::from_source(ops::window::WindowBoundarySource::new(self.source, boundary))
    }

    /// Duration-bounded windows driven by the executor clock.
    #[must_use]
    pub fn window_time(self, period: Duration, executor: DelayedExecutorRef) -> Flow<Flow<T>> {
        let boundary = Flow::interval(period, executor);
        self.window_boundary(boundary)
    }

    /// Arbitrary-overlap windows opened by `open` and closed by their own
    /// companions.
    pub fn window_when<O, C>(
        self,
        open: Flow<O>,
        close_fn: impl Fn(&O) -> Flow<C> + Send + Sync + 'static,
    ) -> Flow<Flow<T>>
    where
        O: Send + 'static,
        C: Send + 'static,
    {
        Flow::from_source(ops::window::WindowWhenSource::new(self.source, open, close_fn))
    }
}

// ---------------------------------------------------------------------------
// Grouping
// ---------------------------------------------------------------------------

impl<T: Send + 'static> Flow<T> {
    /// Partitions into one substream per unique key.
    pub fn group_by<K>(self, key_fn: impl Fn(&T) -> K + Send + Sync + 'static) -> Flow<GroupedFlow<K, T>>
    where
        K: Clone + Hash + Eq + Send + Sync + 'static,
    {
        self.group_by_map(key_fn, |value| Ok(value))
    }

    /// `group_by` with a value projection per element.
    pub fn group_by_map<K, V>(
        self,
        key_fn: impl Fn(&T) -> K + Send + Sync + 'static,
        value_fn: impl Fn(T) -> Result<V, FlowError> + Send + Sync + 'static,
    ) -> Flow<GroupedFlow<K, V>>
    where
        K: Clone + Hash + Eq + Send + Sync + 'static,
        V: Send + 'static,
    {
        Flow::from_source(ops::group_by::GroupBySource::new(
            self.source,
            key_fn,
            value_fn,
        ))
    }
}

// ---------------------------------------------------------------------------
// Reductions
// ---------------------------------------------------------------------------

impl<T: Send + 'static> Flow<T> {
    /// Folds every element into `seed`, emitting the final accumulator.
    pub fn reduce<A>(
        self,
        seed: A,
        f: impl Fn(A, T) -> A + Send + Sync + 'static,
    ) -> Solo<A>
    where
        A: Clone + Send + Sync + 'static,
    {
        Solo::from_source(FoldSource::new(
            self.source,
            move || Some(seed.clone()),
            move |acc: &mut Option<A>, value| {
                if let Some(current) = acc.take() {
                    *acc = Some(f(current, value));
                }
                Ok(FoldControl::Continue)
            },
            |acc| Ok(acc),
        ))
    }

    /// Emits the running accumulator per element, starting with the seed.
    pub fn scan<A>(self, seed: A, f: impl Fn(A, T) -> A + Send + Sync + 'static) -> Flow<A>
    where
        A: Clone + Send + Sync + 'static,
    {
        let scanned = Flow::from_source(ops::scan::ScanSource::new(
            self.source,
            seed.clone(),
            move |acc, v| Ok(f(acc, v)),
        ));
        Flow::concat(vec![Flow::just(seed), scanned])
    }

    /// Emits how many elements the upstream produced.
    #[must_use]
    pub fn count(self) -> Solo<u64> {
        Solo::from_source(FoldSource::new(
            self.source,
            || 0u64,
            |acc, _| {
                *acc += 1;
                Ok(FoldControl::Continue)
            },
            |acc| Ok(Some(acc)),
        ))
    }

    /// `true` when every element satisfies the predicate; short-circuits
    /// on the first counterexample.
    pub fn all(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Solo<bool> {
        Solo::from_source(FoldSource::new(
            self.source,
            || true,
            move |acc, value| {
                if predicate(&value) {
                    Ok(FoldControl::Continue)
                } else {
                    *acc = false;
                    Ok(FoldControl::Break)
                }
            },
            |acc| Ok(Some(acc)),
        ))
    }

    /// `true` when some element satisfies the predicate; short-circuits on
    /// the first witness.
    pub fn any(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Solo<bool> {
        Solo::from_source(FoldSource::new(
            self.source,
            || false,
            move |acc, value| {
                if predicate(&value) {
                    *acc = true;
                    Ok(FoldControl::Break)
                } else {
                    Ok(FoldControl::Continue)
                }
            },
            |acc| Ok(Some(acc)),
        ))
    }

    /// Emits the element at `index`, or errors when the upstream is too
    /// short.
    #[must_use]
    pub fn element_at(self, index: u64) -> Solo<T> {
        Solo::from_source(FoldSource::new(
            self.source,
            || (0u64, None),
            move |(seen, slot): &mut (u64, Option<T>), value| {
                if *seen == index {
                    *slot = Some(value);
                    *seen += 1;
                    Ok(FoldControl::Break)
                } else {
                    *seen += 1;
                    Ok(FoldControl::Continue)
                }
            },
            move |(_, slot)| {
                slot.map(Some).ok_or_else(|| {
                    FlowError::stream(format!("sequence ended before index {index}"))
                })
            },
        ))
    }

    /// Emits the only element; errors on an empty or multi-element
    /// upstream.
    #[must_use]
    pub fn single(self) -> Solo<T> {
        Solo::from_source(FoldSource::new(
            self.source,
            || None,
            |slot: &mut Option<T>, value| {
                if slot.is_some() {
                    Err(FlowError::stream("expected a single element, got more"))
                } else {
                    *slot = Some(value);
                    Ok(FoldControl::Continue)
                }
            },
            |slot| {
                slot.map(Some)
                    .ok_or_else(|| FlowError::stream("expected a single element, got none"))
            },
        ))
    }

    /// Emits the final element; errors on an empty upstream.
    #[must_use]
    pub fn last(self) -> Solo<T> {
        Solo::from_source(FoldSource::new(
            self.source,
            || None,
            |slot: &mut Option<T>, value| {
                *slot = Some(value);
                Ok(FoldControl::Continue)
            },
            |slot| {
                slot.map(Some)
                    .ok_or_else(|| FlowError::stream("sequence completed without elements"))
            },
        ))
    }

    /// Collects everything into a `Vec`.
    #[must_use]
    pub fn to_list(self) -> Solo<Vec<T>> {
        Solo::from_source(FoldSource::new(
            self.source,
            Vec::new,
            |acc: &mut Vec<T>, value| {
                acc.push(value);
                Ok(FoldControl::Continue)
            },
            |acc| Ok(Some(acc)),
        ))
    }

    /// Collects into a map; later keys overwrite earlier ones.
    pub fn to_map<K, V>(
        self,
        key_fn: impl Fn(&T) -> K + Send + Sync + 'static,
        value_fn: impl Fn(T) -> V + Send + Sync + 'static,
    ) -> Solo<HashMap<K, V>>
    where
        K: Hash + Eq + Send + 'static,
        V: Send + 'static,
    {
        Solo::from_source(FoldSource::new(
            self.source,
            HashMap::new,
            move |acc: &mut HashMap<K, V>, value| {
                acc.insert(key_fn(&value), value_fn(value));
                Ok(FoldControl::Continue)
            },
            |acc| Ok(Some(acc)),
        ))
    }

    /// Collects into a map of per-key element lists.
    pub fn to_multimap<K, V>(
        self,
        key_fn: impl Fn(&T) -> K + Send + Sync + 'static,
        value_fn: impl Fn(T) -> V + Send + Sync + 'static,
    ) -> Solo<HashMap<K, Vec<V>>>
    where
        K: Hash + Eq + Send + 'static,
        V: Send + 'static,
    {
        Solo::from_source(FoldSource::new(
            self.source,
            HashMap::new,
            move |acc: &mut HashMap<K, Vec<V>>, value| {
                acc.entry(key_fn(&value)).or_default().push(value_fn(value));
                Ok(FoldControl::Continue)
            },
            |acc| Ok(Some(acc)),
        ))
    }
}

// ---------------------------------------------------------------------------
// Error recovery
// ---------------------------------------------------------------------------

impl<T: Send + 'static> Flow<T> {
    /// Switches to the flow built from the cause when the upstream errors.
    pub fn on_error_resume_with(
        self,
        fallback: impl Fn(FlowError) -> Flow<T> + Send + Sync + 'static,
    ) -> Flow<T> {
        Flow::from_source(ops::on_error::OnErrorResumeSource::new(self.source, fallback))
    }

    /// Rewrites the terminal error without recovering.
    pub fn map_error(
        self,
        mapper: impl Fn(FlowError) -> FlowError + Send + Sync + 'static,
    ) -> Flow<T> {
        Flow::from_source(ops::on_error::MapErrorSource::new(self.source, mapper))
    }

    /// Resubscribes on any error, up to `retries` extra attempts.
    #[must_use]
    pub fn retry(self, retries: u64) -> Flow<T> {
        self.retry_if(retries, |_| true)
    }

    /// Resubscribes on matching errors, up to `retries` extra attempts.
    pub fn retry_if(
        self,
        retries: u64,
        predicate: impl Fn(&FlowError) -> bool + Send + Sync + 'static,
    ) -> Flow<T> {
        Flow::from_source(ops::retry::RetrySource::new(self.source, retries, predicate))
    }

    /// Routes errors into a companion; the companion's `next` triggers a
    /// resubscription and its terminal ends the chain.
    pub fn retry_when<S: Send + 'static>(
        self,
        companion: impl Fn(Flow<FlowError>) -> Flow<S> + Send + Sync + 'static,
    ) -> Flow<T> {
        Flow::from_source(ops::retry::RetryWhenSource::new(self.source, companion))
    }

    /// Resubscribes after completion, up to `repeats` extra runs.
    #[must_use]
    pub fn repeat(self, repeats: u64) -> Flow<T> {
        self.repeat_if(repeats, || true)
    }

    /// Resubscribes after completion while the predicate holds.
    pub fn repeat_if(
        self,
        repeats: u64,
        predicate: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Flow<T> {
        Flow::from_source(ops::repeat::RepeatSource::new(self.source, repeats, predicate))
    }

    /// Routes completions into a companion; its `next` triggers a rerun.
    pub fn repeat_when<S: Send + 'static>(
        self,
        companion: impl Fn(Flow<()>) -> Flow<S> + Send + Sync + 'static,
    ) -> Flow<T> {
        Flow::from_source(ops::repeat::RepeatWhenSource::new(self.source, companion))
    }
}

impl<T: Clone + Send + Sync + 'static> Flow<T> {
    /// Replaces an upstream error with one final value.
    #[must_use]
    pub fn on_error_return(self, fallback: T) -> Flow<T> {
        self.on_error_resume_with(move |_| Flow::just(fallback.clone()))
    }
}

// ---------------------------------------------------------------------------
// Backpressure adapters
// ---------------------------------------------------------------------------

impl<T: Send + 'static> Flow<T> {
    /// Drives the upstream unbounded; `policy` decides what happens to
    /// elements arriving with zero downstream demand.
    #[must_use]
    pub fn on_backpressure(self, policy: OverflowPolicy) -> Flow<T> {
        Flow::from_source(ops::backpressure::BackpressureSource::new(
            self.source,
            policy,
            None,
        ))
    }

    /// Buffers without bound until demand arrives.
    #[must_use]
    pub fn on_backpressure_buffer(self) -> Flow<T> {
        self.on_backpressure(OverflowPolicy::Buffer)
    }

    /// Drops undeliverable elements, observing each through `on_drop`.
    pub fn on_backpressure_drop(self, on_drop: impl Fn(&T) + Send + Sync + 'static) -> Flow<T> {
        Flow::from_source(ops::backpressure::BackpressureSource::new(
            self.source,
            OverflowPolicy::Drop,
            Some(Arc::new(on_drop)),
        ))
    }

    /// Keeps only the most recent undeliverable element.
    #[must_use]
    pub fn on_backpressure_latest(self) -> Flow<T> {
        self.on_backpressure(OverflowPolicy::Latest)
    }

    /// Fails with overflow when an element arrives with zero demand.
    #[must_use]
    pub fn on_backpressure_error(self) -> Flow<T> {
        self.on_backpressure(OverflowPolicy::Error)
    }
}

// ---------------------------------------------------------------------------
// Scheduler bridge
// ---------------------------------------------------------------------------

impl<T: Send + 'static> Flow<T> {
    /// Re-dispatches values and terminals onto the executor behind a
    /// bounded prefetch queue.
    #[must_use]
    pub fn publish_on(self, executor: ExecutorRef, prefetch: usize) -> Flow<T> {
        Flow::from_source(ops::publish_on::PublishOnSource::new(
            self.source,
            executor,
            prefetch,
        ))
    }

    /// Dispatches the subscription (and request-driven upstream work) onto
    /// the executor.
    #[must_use]
    pub fn subscribe_on(self, executor: ExecutorRef) -> Flow<T> {
        Flow::from_source(ops::subscribe_on::SubscribeOnSource::new(
            self.source,
            executor,
        ))
    }
}

// ---------------------------------------------------------------------------
// Multicast
// ---------------------------------------------------------------------------

impl<T: Clone + Send + 'static> Flow<T> {
    /// Connectable broadcast coordinating upstream demand as the minimum
    /// outstanding across subscribers.
    #[must_use]
    pub fn publish(self, prefetch: usize) -> ConnectableFlow<T> {
        let hub = PublishHub::new(self.source, prefetch);
        let source: SourceRef<T> = Arc::clone(&hub) as SourceRef<T>;
        ConnectableFlow::new(source, hub as Arc<dyn Connect>)
    }

    /// Connectable broadcast retaining history per `config` and replaying
    /// it to late subscribers.
    #[must_use]
    pub fn replay(self, config: ReplayConfig) -> ConnectableFlow<T> {
        let hub = ReplayHub::new(self.source, config);
        let source: SourceRef<T> = Arc::clone(&hub) as SourceRef<T>;
        ConnectableFlow::new(source, hub as Arc<dyn Connect>)
    }

    /// `publish(prefetch).ref_count(1)`: connects on the first subscriber,
    /// disconnects with the last.
    #[must_use]
    pub fn share(self, prefetch: usize) -> Flow<T> {
        self.publish(prefetch).ref_count(1)
    }
}
