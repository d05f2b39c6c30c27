// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Substream windows.
//!
//! Windows are queue-backed unicast substreams (the same processor that
//! backs `group_by`), opened and closed by a boundary discipline:
//!
//! - count with skip: every `skip`-th element opens a window and a window
//!   closes after `max_size` elements. `skip < max_size` overlaps,
//!   `skip > max_size` drops the elements between windows, `skip ==
//!   max_size` tiles exactly.
//! - boundary companion: each companion signal closes the current window
//!   and opens the next.
//! - open/close pair: each `open` element opens a window that its own
//!   close companion shuts; windows may overlap arbitrarily.
//!
//! The upstream is consumed at unbounded demand; elements buffer in the
//! window queues under their subscribers' demand. Cancelling the outer
//! flow cancels every live window.

use crate::ops::processor::UnicastProcessor;
use crate::ops::Terminal;
use crate::Flow;
use parking_lot::Mutex;
use rill_core::{
    Demand, FlowError, QueueFactory, QueueRef, Source, SourceRef, SubscriberRef, Subscription,
    SubscriptionCell, Upstream, Wip, UNBOUNDED,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Shared open-window bookkeeping and outer emission plumbing.
struct WindowHub<T: Send + 'static> {
    downstream: SubscriberRef<Flow<T>>,
    upstream: SubscriptionCell,
    pending: QueueRef<Flow<T>>,
    demand: Demand,
    wip: Wip,
    input_done: AtomicBool,
    cancelled: AtomicBool,
    done: Terminal,
}

impl<T: Send + 'static> WindowHub<T> {
    fn new(downstream: SubscriberRef<Flow<T>>) -> Self {
        Self {
            downstream,
            upstream: SubscriptionCell::new(),
            pending: QueueFactory::unbounded().create(),
            demand: Demand::new(),
            wip: Wip::new(),
            input_done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            done: Terminal::new(),
        }
    }

    fn open(&self, processor: &Arc<UnicastProcessor<T>>) {
        let flow = Flow::from_arc_source(Arc::clone(processor) as Arc<dyn Source<T>>);
        let _ = self.pending.offer(flow);
        self.drain();
    }

    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.pending.clear();
            } else {
                let mut emitted = 0u64;
                while self.demand.get() > emitted {
                    match self.pending.poll() {
                        Some(window) => {
                            self.downstream.on_next(window);
                            emitted += 1;
                        }
                        None => break,
                    }
                }
                if emitted > 0 {
                    self.demand.produce(emitted);
                }
                if self.input_done.load(Ordering::Acquire)
                    && self.pending.is_empty()
                    && self.done.enter()
                {
                    self.upstream.cancel();
                    self.downstream.on_complete();
                }
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn halt<I: IntoIterator<Item = Arc<UnicastProcessor<T>>>>(
        &self,
        windows: I,
        error: FlowError,
    ) {
        if self.done.enter() {
            self.cancelled.store(true, Ordering::Release);
            self.upstream.cancel();
            for window in windows {
                window.fail(error.clone());
            }
            self.pending.clear();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn complete<I: IntoIterator<Item = Arc<UnicastProcessor<T>>>>(&self, windows: I) {
        self.input_done.store(true, Ordering::Release);
        for window in windows {
            window.finish();
        }
        self.drain();
    }

    fn cancel<I: IntoIterator<Item = Arc<UnicastProcessor<T>>>>(&self, windows: I) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.upstream.cancel();
            for window in windows {
                window.cancel();
            }
            self.drain();
        }
    }
}

pub(crate) struct WindowCountSource<T> {
    upstream: SourceRef<T>,
    max_size: usize,
    skip: usize,
}

impl<T: Clone + Send + 'static> WindowCountSource<T> {
    pub(crate) fn new(upstream: SourceRef<T>, max_size: usize, skip: usize) -> Self {
        Self {
            upstream,
            max_size: max_size.max(1),
            skip: skip.max(1),
        }
    }
}

impl<T: Clone + Send + 'static> Source<Flow<T>> for WindowCountSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<Flow<T>>) {
        let stage = Arc::new_cyclic(|me: &Weak<WindowCountStage<T>>| WindowCountStage {
            me: me.clone(),
            hub: WindowHub::new(subscriber),
            max_size: self.max_size,
            skip: self.skip,
            index: AtomicU64::new(0),
            active: Mutex::new(VecDeque::new()),
        });
        self.upstream.subscribe(stage);
    }
}

struct OpenWindow<T: Send + 'static> {
    processor: Arc<UnicastProcessor<T>>,
    received: usize,
}

struct WindowCountStage<T: Send + 'static> {
    me: Weak<Self>,
    hub: WindowHub<T>,
    max_size: usize,
    skip: usize,
    index: AtomicU64,
    active: Mutex<VecDeque<OpenWindow<T>>>,
}

impl<T: Clone + Send + 'static> WindowCountStage<T> {
    fn live_windows(&self) -> Vec<Arc<UnicastProcessor<T>>> {
        self.active
            .lock()
            .iter()
            .map(|w| Arc::clone(&w.processor))
            .collect()
    }
}

impl<T: Clone + Send + 'static> rill_core::Subscriber<T> for WindowCountStage<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if !self
            .hub
            .upstream
            .set(rill_core::SubscriptionRef::clone(&subscription))
        {
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        let downstream_subscription: rill_core::SubscriptionRef = me;
        self.hub
            .downstream
            .on_subscribe(Upstream::Relay(downstream_subscription));
        subscription.request(UNBOUNDED);
    }

    fn on_next(&self, value: T) {
        if self.hub.done.is_done() || self.hub.cancelled.load(Ordering::Acquire) {
            return;
        }
        let index = self.index.fetch_add(1, Ordering::AcqRel);
        let opens = index % self.skip as u64 == 0;
        let mut to_finish: Vec<Arc<UnicastProcessor<T>>> = Vec::new();
        let mut overflow = false;
        {
            let mut active = self.active.lock();
            if opens {
                let processor = UnicastProcessor::new(QueueFactory::unbounded());
                active.push_back(OpenWindow {
                    processor: Arc::clone(&processor),
                    received: 0,
                });
                self.hub.open(&processor);
            }
            for window in active.iter_mut() {
                if window.processor.emit(value_clone_slot(&value)).is_err() {
                    overflow = true;
                }
                window.received += 1;
            }
            while active
                .front()
                .is_some_and(|w| w.received >= self.max_size)
            {
                if let Some(window) = active.pop_front() {
                    to_finish.push(window.processor);
                }
            }
        }
        if overflow {
            self.hub.halt(
                self.live_windows(),
                FlowError::overflow("window substream rejected an element"),
            );
            return;
        }
        for processor in to_finish {
            processor.finish();
        }
    }

    fn on_error(&self, error: FlowError) {
        let windows = {
            let mut active = self.active.lock();
            active.drain(..).map(|w| w.processor).collect::<Vec<_>>()
        };
        self.hub.input_done.store(true, Ordering::Release);
        self.hub.halt(windows, error);
    }

    fn on_complete(&self) {
        let windows = {
            let mut active = self.active.lock();
            active.drain(..).map(|w| w.processor).collect::<Vec<_>>()
        };
        self.hub.complete(windows);
    }
}

impl<T: Clone + Send + 'static> Subscription for WindowCountStage<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            self.hub.halt(self.live_windows(), FlowError::bad_request());
            return;
        }
        self.hub.demand.add(n);
        self.hub.drain();
    }

    fn cancel(&self) {
        let windows = {
            let mut active = self.active.lock();
            active.drain(..).map(|w| w.processor).collect::<Vec<_>>()
        };
        self.hub.cancel(windows);
    }
}

// Count windows with skip < max_size deliver one element into several
// windows; that needs Clone. The facade constrains accordingly.
fn value_clone_slot<T: Clone>(value: &T) -> T {
    value.clone()
}

pub(crate) struct WindowBoundarySource<T, C: Send + 'static> {
    upstream: SourceRef<T>,
    boundary: Flow<C>,
}

impl<T: Send + 'static, C: Send + 'static> WindowBoundarySource<T, C> {
    pub(crate) fn new(upstream: SourceRef<T>, boundary: Flow<C>) -> Self {
        Self { upstream, boundary }
    }
}

impl<T: Send + 'static, C: Send + 'static> Source<Flow<T>> for WindowBoundarySource<T, C> {
    fn subscribe(&self, subscriber: SubscriberRef<Flow<T>>) {
        let stage = Arc::new_cyclic(|me: &Weak<WindowBoundaryStage<T>>| WindowBoundaryStage {
            me: me.clone(),
            hub: WindowHub::new(subscriber),
            boundary: SubscriptionCell::new(),
            current: Mutex::new(None),
        });
        // The first window opens before any element arrives.
        stage.rotate();
        let boundary_leg: SubscriberRef<C> = Arc::new(BoundaryLeg {
            parent: Arc::downgrade(&stage),
            _marker: std::marker::PhantomData,
        });
        self.boundary.subscribe_with(boundary_leg);
        self.upstream.subscribe(stage);
    }
}

struct WindowBoundaryStage<T: Send + 'static> {
    me: Weak<Self>,
    hub: WindowHub<T>,
    boundary: SubscriptionCell,
    current: Mutex<Option<Arc<UnicastProcessor<T>>>>,
}

impl<T: Send + 'static> WindowBoundaryStage<T> {
    /// Closes the current window (if any) and opens the next.
    fn rotate(&self) {
        if self.hub.done.is_done() || self.hub.cancelled.load(Ordering::Acquire) {
            return;
        }
        let processor = UnicastProcessor::new(QueueFactory::unbounded());
        let previous = self.current.lock().replace(Arc::clone(&processor));
        if let Some(previous) = previous {
            previous.finish();
        }
        self.hub.open(&processor);
    }

    fn current_windows(&self) -> Vec<Arc<UnicastProcessor<T>>> {
        self.current.lock().iter().map(Arc::clone).collect()
    }
}

impl<T: Send + 'static> rill_core::Subscriber<T> for WindowBoundaryStage<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if !self
            .hub
            .upstream
            .set(rill_core::SubscriptionRef::clone(&subscription))
        {
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        let downstream_subscription: rill_core::SubscriptionRef = me;
        self.hub
            .downstream
            .on_subscribe(Upstream::Relay(downstream_subscription));
        subscription.request(UNBOUNDED);
    }

    fn on_next(&self, value: T) {
        if self.hub.done.is_done() || self.hub.cancelled.load(Ordering::Acquire) {
            return;
        }
        let current = self.current.lock().clone();
        if let Some(window) = current {
            if window.emit(value).is_err() {
                self.hub.halt(
                    self.current_windows(),
                    FlowError::overflow("window substream rejected an element"),
                );
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        self.boundary.cancel();
        let windows = self.current.lock().take().into_iter().collect::<Vec<_>>();
        self.hub.input_done.store(true, Ordering::Release);
        self.hub.halt(windows, error);
    }

    fn on_complete(&self) {
        self.boundary.cancel();
        let windows = self.current.lock().take().into_iter().collect::<Vec<_>>();
        self.hub.complete(windows);
    }
}

impl<T: Send + 'static> Subscription for WindowBoundaryStage<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            self.hub
                .halt(self.current_windows(), FlowError::bad_request());
            return;
        }
        self.hub.demand.add(n);
        self.hub.drain();
    }

    fn cancel(&self) {
        self.boundary.cancel();
        let windows = self.current.lock().take().into_iter().collect::<Vec<_>>();
        self.hub.cancel(windows);
    }
}

struct BoundaryLeg<T: Send + 'static, C: Send + 'static> {
    parent: Weak<WindowBoundaryStage<T>>,
    _marker: std::marker::PhantomData<fn() -> C>,
}

impl<T: Send + 'static, C: Send + 'static> rill_core::Subscriber<C> for BoundaryLeg<T, C> {
    fn on_subscribe(&self, upstream: Upstream<C>) {
        let subscription = upstream.subscription();
        match self.parent.upgrade() {
            Some(parent) if !parent.hub.done.is_done() => {
                if parent
                    .boundary
                    .set(rill_core::SubscriptionRef::clone(&subscription))
                {
                    subscription.request(UNBOUNDED);
                }
            }
            _ => subscription.cancel(),
        }
    }

    fn on_next(&self, _boundary: C) {
        if let Some(parent) = self.parent.upgrade() {
            parent.rotate();
        }
    }

    fn on_error(&self, error: FlowError) {
        match self.parent.upgrade() {
            Some(parent) => {
                let windows = parent.current.lock().take().into_iter().collect::<Vec<_>>();
                parent.hub.halt(windows, error);
            }
            None => rill_core::hooks::on_error_dropped(error),
        }
    }

    fn on_complete(&self) {
        if let Some(parent) = self.parent.upgrade() {
            let windows = parent.current.lock().take().into_iter().collect::<Vec<_>>();
            parent.hub.complete(windows);
            parent.hub.upstream.cancel();
        }
    }
}

pub(crate) struct WindowWhenSource<T, O, C, CF>
where
    O: Send + 'static,
    C: Send + 'static,
{
    upstream: SourceRef<T>,
    open: Flow<O>,
    close_fn: Arc<CF>,
    _marker: std::marker::PhantomData<fn(O) -> C>,
}

impl<T, O, C, CF> WindowWhenSource<T, O, C, CF>
where
    T: Clone + Send + 'static,
    O: Send + 'static,
    C: Send + 'static,
    CF: Fn(&O) -> Flow<C> + Send + Sync + 'static,
{
    pub(crate) fn new(upstream: SourceRef<T>, open: Flow<O>, close_fn: CF) -> Self {
        Self {
            upstream,
            open,
            close_fn: Arc::new(close_fn),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, O, C, CF> Source<Flow<T>> for WindowWhenSource<T, O, C, CF>
where
    T: Clone + Send + 'static,
    O: Send + 'static,
    C: Send + 'static,
    CF: Fn(&O) -> Flow<C> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<Flow<T>>) {
        let stage = Arc::new_cyclic(|me: &Weak<WindowWhenStage<T>>| WindowWhenStage {
            me: me.clone(),
            hub: WindowHub::new(subscriber),
            open_leg: SubscriptionCell::new(),
            close_legs: Mutex::new(Vec::new()),
            windows: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        });
        let open_leg: SubscriberRef<O> = Arc::new(WindowOpenLeg {
            parent: Arc::downgrade(&stage),
            close_fn: Arc::clone(&self.close_fn),
            _marker: std::marker::PhantomData,
        });
        self.open.subscribe_with(open_leg);
        self.upstream.subscribe(stage);
    }
}

struct WindowWhenStage<T: Send + 'static> {
    me: Weak<Self>,
    hub: WindowHub<T>,
    open_leg: SubscriptionCell,
    close_legs: Mutex<Vec<rill_core::SubscriptionRef>>,
    windows: Mutex<Vec<(u64, Arc<UnicastProcessor<T>>)>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> WindowWhenStage<T> {
    fn open_window(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let processor = UnicastProcessor::new(QueueFactory::unbounded());
        self.windows.lock().push((id, Arc::clone(&processor)));
        self.hub.open(&processor);
        id
    }

    fn close_window(&self, id: u64) {
        let processor = {
            let mut windows = self.windows.lock();
            windows
                .iter()
                .position(|(candidate, _)| *candidate == id)
                .map(|position| windows.remove(position).1)
        };
        if let Some(processor) = processor {
            processor.finish();
        }
    }

    fn drain_windows(&self) -> Vec<Arc<UnicastProcessor<T>>> {
        self.windows
            .lock()
            .drain(..)
            .map(|(_, processor)| processor)
            .collect()
    }

    fn teardown_companions(&self) {
        self.open_leg.cancel();
        for leg in self.close_legs.lock().drain(..) {
            leg.cancel();
        }
    }
}

impl<T: Clone + Send + 'static> rill_core::Subscriber<T> for WindowWhenStage<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if !self
            .hub
            .upstream
            .set(rill_core::SubscriptionRef::clone(&subscription))
        {
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        let downstream_subscription: rill_core::SubscriptionRef = me;
        self.hub
            .downstream
            .on_subscribe(Upstream::Relay(downstream_subscription));
        subscription.request(UNBOUNDED);
    }

    fn on_next(&self, value: T) {
        if self.hub.done.is_done() || self.hub.cancelled.load(Ordering::Acquire) {
            return;
        }
        let mut overflow = false;
        {
            let windows = self.windows.lock();
            for (_, processor) in windows.iter() {
                if processor.emit(value.clone()).is_err() {
                    overflow = true;
                }
            }
        }
        if overflow {
            self.teardown_companions();
            self.hub.halt(
                self.drain_windows(),
                FlowError::overflow("window substream rejected an element"),
            );
        }
    }

    fn on_error(&self, error: FlowError) {
        self.teardown_companions();
        self.hub.input_done.store(true, Ordering::Release);
        self.hub.halt(self.drain_windows(), error);
    }

    fn on_complete(&self) {
        self.teardown_companions();
        self.hub.complete(self.drain_windows());
    }
}

impl<T: Clone + Send + 'static> Subscription for WindowWhenStage<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            self.teardown_companions();
            self.hub
                .halt(self.drain_windows(), FlowError::bad_request());
            return;
        }
        self.hub.demand.add(n);
        self.hub.drain();
    }

    fn cancel(&self) {
        self.teardown_companions();
        self.hub.cancel(self.drain_windows());
    }
}

struct WindowOpenLeg<T, O, C, CF>
where
    T: Send + 'static,
    O: Send + 'static,
    C: Send + 'static,
{
    parent: Weak<WindowWhenStage<T>>,
    close_fn: Arc<CF>,
    _marker: std::marker::PhantomData<fn(O) -> C>,
}

impl<T, O, C, CF> rill_core::Subscriber<O> for WindowOpenLeg<T, O, C, CF>
where
    T: Clone + Send + 'static,
    O: Send + 'static,
    C: Send + 'static,
    CF: Fn(&O) -> Flow<C> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<O>) {
        let subscription = upstream.subscription();
        match self.parent.upgrade() {
            Some(parent) if !parent.hub.done.is_done() => {
                if parent
                    .open_leg
                    .set(rill_core::SubscriptionRef::clone(&subscription))
                {
                    subscription.request(UNBOUNDED);
                }
            }
            _ => subscription.cancel(),
        }
    }

    fn on_next(&self, opener: O) {
        let Some(parent) = self.parent.upgrade() else { return };
        if parent.hub.done.is_done() {
            return;
        }
        let id = parent.open_window();
        let close_leg: SubscriberRef<C> = Arc::new(WindowCloseLeg {
            parent: self.parent.clone(),
            id,
            _marker: std::marker::PhantomData,
        });
        (self.close_fn)(&opener).subscribe_with(close_leg);
    }

    fn on_error(&self, error: FlowError) {
        match self.parent.upgrade() {
            Some(parent) => {
                parent.teardown_companions();
                parent.hub.halt(parent.drain_windows(), error);
            }
            None => rill_core::hooks::on_error_dropped(error),
        }
    }

    fn on_complete(&self) {
        // No further windows will open; live ones still close on their own
        // companions.
    }
}

struct WindowCloseLeg<T: Send + 'static, C: Send + 'static> {
    parent: Weak<WindowWhenStage<T>>,
    id: u64,
    _marker: std::marker::PhantomData<fn() -> C>,
}

impl<T: Clone + Send + 'static, C: Send + 'static> rill_core::Subscriber<C>
    for WindowCloseLeg<T, C>
{
    fn on_subscribe(&self, upstream: Upstream<C>) {
        let subscription = upstream.subscription();
        match self.parent.upgrade() {
            Some(parent) if !parent.hub.done.is_done() => {
                parent
                    .close_legs
                    .lock()
                    .push(rill_core::SubscriptionRef::clone(&subscription));
                subscription.request(1);
            }
            _ => subscription.cancel(),
        }
    }

    fn on_next(&self, _close: C) {
        if let Some(parent) = self.parent.upgrade() {
            parent.close_window(self.id);
        }
    }

    fn on_error(&self, error: FlowError) {
        match self.parent.upgrade() {
            Some(parent) => {
                parent.teardown_companions();
                parent.hub.halt(parent.drain_windows(), error);
            }
            None => rill_core::hooks::on_error_dropped(error),
        }
    }

    fn on_complete(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.close_window(self.id);
        }
    }
}
