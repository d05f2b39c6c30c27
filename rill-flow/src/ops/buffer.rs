// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Element collection into `Vec` batches.
//!
//! The boundary disciplines mirror the window stages: count with skip
//! (overlap / gap / exact tiling), a companion whose signals close the
//! running buffer, and an open/close companion pair for arbitrary
//! overlaps. Closed buffers park in a queue and leave under downstream
//! demand; partial buffers flush at completion.

use crate::ops::Terminal;
use crate::Flow;
use parking_lot::Mutex;
use rill_core::{
    add_cap, mul_cap, Demand, FlowError, QueueFactory, QueueRef, Source, SourceRef,
    SubscriberRef, Subscription, SubscriptionCell, Upstream, Wip, UNBOUNDED,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Outer emission plumbing shared by the buffer stages.
struct BufferHub<T: Send + 'static> {
    downstream: SubscriberRef<Vec<T>>,
    upstream: SubscriptionCell,
    pending: QueueRef<Vec<T>>,
    demand: Demand,
    wip: Wip,
    input_done: AtomicBool,
    cancelled: AtomicBool,
    done: Terminal,
}

impl<T: Send + 'static> BufferHub<T> {
    fn new(downstream: SubscriberRef<Vec<T>>) -> Self {
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

    fn close(&self, buffer: Vec<T>) {
        let _ = self.pending.offer(buffer);
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
                        Some(buffer) => {
                            self.downstream.on_next(buffer);
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

    fn halt(&self, error: FlowError) {
        if self.done.enter() {
            self.cancelled.store(true, Ordering::Release);
            self.upstream.cancel();
            self.pending.clear();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn complete(&self) {
        self.input_done.store(true, Ordering::Release);
        self.drain();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.upstream.cancel();
            self.drain();
        }
    }
}

pub(crate) struct BufferCountSource<T> {
    upstream: SourceRef<T>,
    max_size: usize,
    skip: usize,
}

impl<T: Clone + Send + 'static> BufferCountSource<T> {
    pub(crate) fn new(upstream: SourceRef<T>, max_size: usize, skip: usize) -> Self {
        Self {
            upstream,
            max_size: max_size.max(1),
            skip: skip.max(1),
        }
    }
}

impl<T: Clone + Send + 'static> Source<Vec<T>> for BufferCountSource<T> {
    fn subscribe(&self, subscriber: SubscriberRef<Vec<T>>) {
        let stage = Arc::new_cyclic(|me: &Weak<BufferCountStage<T>>| BufferCountStage {
            me: me.clone(),
            hub: BufferHub::new(subscriber),
            max_size: self.max_size,
            skip: self.skip,
            index: AtomicU64::new(0),
            first_request: AtomicBool::new(true),
            open: Mutex::new(VecDeque::new()),
        });
        self.upstream.subscribe(stage);
    }
}

struct BufferCountStage<T: Send + 'static> {
    me: Weak<Self>,
    hub: BufferHub<T>,
    max_size: usize,
    skip: usize,
    index: AtomicU64,
    first_request: AtomicBool,
    open: Mutex<VecDeque<Vec<T>>>,
}

impl<T: Clone + Send + 'static> rill_core::Subscriber<T> for BufferCountStage<T> {
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
    }

    fn on_next(&self, value: T) {
        if self.hub.done.is_done() || self.hub.cancelled.load(Ordering::Acquire) {
            return;
        }
        let index = self.index.fetch_add(1, Ordering::AcqRel);
        let mut closed: Vec<Vec<T>> = Vec::new();
        {
            let mut open = self.open.lock();
            if index % self.skip as u64 == 0 {
                open.push_back(Vec::with_capacity(self.max_size));
            }
            for buffer in open.iter_mut() {
                buffer.push(value.clone());
            }
            while open.front().is_some_and(|b| b.len() >= self.max_size) {
                if let Some(buffer) = open.pop_front() {
                    closed.push(buffer);
                }
            }
        }
        for buffer in closed {
            self.hub.close(buffer);
        }
    }

    fn on_error(&self, error: FlowError) {
        self.open.lock().clear();
        self.hub.input_done.store(true, Ordering::Release);
        self.hub.halt(error);
    }

    fn on_complete(&self) {
        let remaining: Vec<Vec<T>> = self.open.lock().drain(..).collect();
        for buffer in remaining {
            if !buffer.is_empty() {
                let _ = self.hub.pending.offer(buffer);
            }
        }
        self.hub.complete();
    }
}

impl<T: Clone + Send + 'static> Subscription for BufferCountStage<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            self.hub.halt(FlowError::bad_request());
            return;
        }
        self.hub.demand.add(n);
        // Scale buffer demand into element demand for the upstream.
        let elements = if n == UNBOUNDED {
            UNBOUNDED
        } else if self.skip >= self.max_size {
            mul_cap(n, self.skip as u64)
        } else if self.first_request.swap(false, Ordering::AcqRel) {
            add_cap(
                self.max_size as u64,
                mul_cap(n.saturating_sub(1), self.skip as u64),
            )
        } else {
            mul_cap(n, self.skip as u64)
        };
        self.hub.upstream.request(elements);
        self.hub.drain();
    }

    fn cancel(&self) {
        self.open.lock().clear();
        self.hub.cancel();
    }
}

pub(crate) struct BufferBoundarySource<T, C: Send + 'static> {
    upstream: SourceRef<T>,
    boundary: Flow<C>,
}

impl<T: Send + 'static, C: Send + 'static> BufferBoundarySource<T, C> {
    pub(crate) fn new(upstream: SourceRef<T>, boundary: Flow<C>) -> Self {
        Self { upstream, boundary }
    }
}

impl<T: Send + 'static, C: Send + 'static> Source<Vec<T>> for BufferBoundarySource<T, C> {
    fn subscribe(&self, subscriber: SubscriberRef<Vec<T>>) {
        let stage = Arc::new_cyclic(|me: &Weak<BufferBoundaryStage<T>>| BufferBoundaryStage {
            me: me.clone(),
            hub: BufferHub::new(subscriber),
            boundary: SubscriptionCell::new(),
            current: Mutex::new(Vec::new()),
        });
        let boundary_leg: SubscriberRef<C> = Arc::new(BufferBoundaryLeg {
            parent: Arc::downgrade(&stage),
            _marker: std::marker::PhantomData,
        });
        self.boundary.subscribe_with(boundary_leg);
        self.upstream.subscribe(stage);
    }
}

struct BufferBoundaryStage<T: Send + 'static> {
    me: Weak<Self>,
    hub: BufferHub<T>,
    boundary: SubscriptionCell,
    current: Mutex<Vec<T>>,
}

impl<T: Send + 'static> BufferBoundaryStage<T> {
    fn rotate(&self) {
        if self.hub.done.is_done() || self.hub.cancelled.load(Ordering::Acquire) {
            return;
        }
        let buffer = std::mem::take(&mut *self.current.lock());
        self.hub.close(buffer);
    }
}

impl<T: Send + 'static> rill_core::Subscriber<T> for BufferBoundaryStage<T> {
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
        self.current.lock().push(value);
    }

    fn on_error(&self, error: FlowError) {
        self.boundary.cancel();
        self.current.lock().clear();
        self.hub.halt(error);
    }

    fn on_complete(&self) {
        self.boundary.cancel();
        let remaining = std::mem::take(&mut *self.current.lock());
        if !remaining.is_empty() {
            let _ = self.hub.pending.offer(remaining);
        }
        self.hub.complete();
    }
}

impl<T: Send + 'static> Subscription for BufferBoundaryStage<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            self.hub.halt(FlowError::bad_request());
            return;
        }
        self.hub.demand.add(n);
        self.hub.drain();
    }

    fn cancel(&self) {
        self.boundary.cancel();
        self.current.lock().clear();
        self.hub.cancel();
    }
}

struct BufferBoundaryLeg<T: Send + 'static, C: Send + 'static> {
    parent: Weak<BufferBoundaryStage<T>>,
    _marker: std::marker::PhantomData<fn() -> C>,
}

impl<T: Send + 'static, C: Send + 'static> rill_core::Subscriber<C> for BufferBoundaryLeg<T, C> {
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
            Some(parent) => parent.hub.halt(error),
            None => rill_core::hooks::on_error_dropped(error),
        }
    }

    fn on_complete(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.hub.upstream.cancel();
            let remaining = std::mem::take(&mut *parent.current.lock());
            if !remaining.is_empty() {
                let _ = parent.hub.pending.offer(remaining);
            }
            parent.hub.complete();
        }
    }
}

pub(crate) struct BufferWhenSource<T, O, C, CF>
where
    O: Send + 'static,
    C: Send + 'static,
{
    upstream: SourceRef<T>,
    open: Flow<O>,
    close_fn: Arc<CF>,
    _marker: std::marker::PhantomData<fn() -> C>,
}

impl<T, O, C, CF> BufferWhenSource<T, O, C, CF>
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

impl<T, O, C, CF> Source<Vec<T>> for BufferWhenSource<T, O, C, CF>
where
    T: Clone + Send + 'static,
    O: Send + 'static,
    C: Send + 'static,
    CF: Fn(&O) -> Flow<C> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<Vec<T>>) {
        let stage = Arc::new_cyclic(|me: &Weak<BufferWhenStage<T>>| BufferWhenStage {
            me: me.clone(),
            hub: BufferHub::new(subscriber),
            open_leg: SubscriptionCell::new(),
            close_legs: Mutex::new(Vec::new()),
            buffers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        });
        let close_fn = Arc::clone(&self.close_fn);
        let open_leg: SubscriberRef<O> = Arc::new(BufferOpenLeg {
            parent: Arc::downgrade(&stage),
            close_fn,
            _marker: std::marker::PhantomData,
        });
        self.open.subscribe_with(open_leg);
        self.upstream.subscribe(stage);
    }
}

struct BufferWhenStage<T: Send + 'static> {
    me: Weak<Self>,
    hub: BufferHub<T>,
    open_leg: SubscriptionCell,
    close_legs: Mutex<Vec<rill_core::SubscriptionRef>>,
    buffers: Mutex<Vec<(u64, Vec<T>)>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> BufferWhenStage<T> {
    fn open_buffer(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.buffers.lock().push((id, Vec::new()));
        id
    }

    fn close_buffer(&self, id: u64) {
        let buffer = {
            let mut buffers = self.buffers.lock();
            buffers
                .iter()
                .position(|(candidate, _)| *candidate == id)
                .map(|position| buffers.remove(position).1)
        };
        if let Some(buffer) = buffer {
            self.hub.close(buffer);
        }
    }

    fn teardown_companions(&self) {
        self.open_leg.cancel();
        for leg in self.close_legs.lock().drain(..) {
            leg.cancel();
        }
    }
}

impl<T: Clone + Send + 'static> rill_core::Subscriber<T> for BufferWhenStage<T> {
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
        let mut buffers = self.buffers.lock();
        for (_, buffer) in buffers.iter_mut() {
            buffer.push(value.clone());
        }
    }

    fn on_error(&self, error: FlowError) {
        self.teardown_companions();
        self.buffers.lock().clear();
        self.hub.halt(error);
    }

    fn on_complete(&self) {
        self.teardown_companions();
        let remaining: Vec<(u64, Vec<T>)> = self.buffers.lock().drain(..).collect();
        for (_, buffer) in remaining {
            if !buffer.is_empty() {
                let _ = self.hub.pending.offer(buffer);
            }
        }
        self.hub.complete();
    }
}

impl<T: Clone + Send + 'static> Subscription for BufferWhenStage<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            self.hub.halt(FlowError::bad_request());
            return;
        }
        self.hub.demand.add(n);
        self.hub.drain();
    }

    fn cancel(&self) {
        self.teardown_companions();
        self.buffers.lock().clear();
        self.hub.cancel();
    }
}

struct BufferOpenLeg<T, O, C, CF>
where
    T: Send + 'static,
    O: Send + 'static,
    C: Send + 'static,
{
    parent: Weak<BufferWhenStage<T>>,
    close_fn: Arc<CF>,
    _marker: std::marker::PhantomData<fn(O) -> C>,
}

impl<T, O, C, CF> rill_core::Subscriber<O> for BufferOpenLeg<T, O, C, CF>
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
        let id = parent.open_buffer();
        let close_leg: SubscriberRef<C> = Arc::new(BufferCloseLeg {
            parent: self.parent.clone(),
            id,
            _marker: std::marker::PhantomData,
        });
        (self.close_fn)(&opener).subscribe_with(close_leg);
    }

    fn on_error(&self, error: FlowError) {
        match self.parent.upgrade() {
            Some(parent) => parent.hub.halt(error),
            None => rill_core::hooks::on_error_dropped(error),
        }
    }

    fn on_complete(&self) {
        // No further buffers will open; existing ones still close normally.
    }
}

struct BufferCloseLeg<T: Send + 'static, C: Send + 'static> {
    parent: Weak<BufferWhenStage<T>>,
    id: u64,
    _marker: std::marker::PhantomData<fn() -> C>,
}

impl<T: Clone + Send + 'static, C: Send + 'static> rill_core::Subscriber<C>
    for BufferCloseLeg<T, C>
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
            parent.close_buffer(self.id);
        }
    }

    fn on_error(&self, error: FlowError) {
        match self.parent.upgrade() {
            Some(parent) => parent.hub.halt(error),
            None => rill_core::hooks::on_error_dropped(error),
        }
    }

    fn on_complete(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.close_buffer(self.id);
        }
    }
}
