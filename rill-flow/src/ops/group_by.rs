// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Key-partitioned substreams.
//!
//! Each unique key gets a queue-backed unicast substream; the outer flow
//! emits the substream handle once, on first occurrence of its key. The
//! upstream is prefetched and replenished as substream consumers drain
//! their queues, which keeps total buffered elements bounded by the
//! prefetch plus what subscribers have not yet taken. Cancelling the outer
//! flow cancels every live substream.

use crate::ops::processor::UnicastProcessor;
use crate::ops::Terminal;
use crate::Flow;
use parking_lot::Mutex;
use rill_core::{
    Demand, FlowError, QueueFactory, QueueRef, Source, SourceRef, SubscriberRef, Subscription,
    SubscriptionCell, Upstream, Wip,
};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

const GROUP_PREFETCH: u64 = 32;

/// One partition of a grouped flow: the key plus the substream carrying
/// every upstream element that mapped to it.
pub struct GroupedFlow<K, T: Send + 'static> {
    key: K,
    flow: Flow<T>,
}

impl<K, T: Send + 'static> GroupedFlow<K, T> {
    pub(crate) fn new(key: K, flow: Flow<T>) -> Self {
        Self { key, flow }
    }

    /// The partition key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The substream. Supports exactly one subscriber.
    pub fn flow(&self) -> Flow<T> {
        self.flow.clone()
    }

    /// Splits into key and substream.
    pub fn into_parts(self) -> (K, Flow<T>) {
        (self.key, self.flow)
    }
}

pub(crate) struct GroupBySource<T, K, V, KF, VF> {
    upstream: SourceRef<T>,
    key_fn: Arc<KF>,
    value_fn: Arc<VF>,
    _marker: std::marker::PhantomData<fn(T) -> (K, V)>,
}

impl<T, K, V, KF, VF> GroupBySource<T, K, V, KF, VF>
where
    T: Send + 'static,
    K: Clone + Hash + Eq + Send + Sync + 'static,
    V: Send + 'static,
    KF: Fn(&T) -> K + Send + Sync + 'static,
    VF: Fn(T) -> Result<V, FlowError> + Send + Sync + 'static,
{
    pub(crate) fn new(upstream: SourceRef<T>, key_fn: KF, value_fn: VF) -> Self {
        Self {
            upstream,
            key_fn: Arc::new(key_fn),
            value_fn: Arc::new(value_fn),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, K, V, KF, VF> Source<GroupedFlow<K, V>> for GroupBySource<T, K, V, KF, VF>
where
    T: Send + 'static,
    K: Clone + Hash + Eq + Send + Sync + 'static,
    V: Send + 'static,
    KF: Fn(&T) -> K + Send + Sync + 'static,
    VF: Fn(T) -> Result<V, FlowError> + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: SubscriberRef<GroupedFlow<K, V>>) {
        let stage = Arc::new_cyclic(|me: &Weak<GroupByStage<T, K, V, KF, VF>>| GroupByStage {
            me: me.clone(),
            downstream: SubscriberRef::clone(&subscriber),
            key_fn: Arc::clone(&self.key_fn),
            value_fn: Arc::clone(&self.value_fn),
            upstream: SubscriptionCell::new(),
            groups: Mutex::new(HashMap::new()),
            pending_groups: QueueFactory::unbounded().create(),
            demand: Demand::new(),
            wip: Wip::new(),
            input_done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            done: Terminal::new(),
            _marker: std::marker::PhantomData,
        });
        self.upstream.subscribe(stage);
    }
}

struct GroupByStage<T, K, V, KF, VF>
where
    T: Send + 'static,
    K: Clone + Hash + Eq + Send + Sync + 'static,
    V: Send + 'static,
{
    me: Weak<Self>,
    downstream: SubscriberRef<GroupedFlow<K, V>>,
    key_fn: Arc<KF>,
    value_fn: Arc<VF>,
    upstream: SubscriptionCell,
    groups: Mutex<HashMap<K, Arc<UnicastProcessor<V>>>>,
    pending_groups: QueueRef<GroupedFlow<K, V>>,
    demand: Demand,
    wip: Wip,
    input_done: AtomicBool,
    cancelled: AtomicBool,
    done: Terminal,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, K, V, KF, VF> GroupByStage<T, K, V, KF, VF>
where
    T: Send + 'static,
    K: Clone + Hash + Eq + Send + Sync + 'static,
    V: Send + 'static,
    KF: Fn(&T) -> K + Send + Sync + 'static,
    VF: Fn(T) -> Result<V, FlowError> + Send + Sync + 'static,
{
    fn halt(&self, error: FlowError) {
        if self.done.enter() {
            self.cancelled.store(true, Ordering::Release);
            self.upstream.cancel();
            let groups = std::mem::take(&mut *self.groups.lock());
            for processor in groups.into_values() {
                processor.fail(error.clone());
            }
            self.pending_groups.clear();
            self.downstream.on_error(error);
        } else {
            Terminal::drop_error(error);
        }
    }

    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.pending_groups.clear();
            } else {
                let mut emitted = 0u64;
                while self.demand.get() > emitted {
                    match self.pending_groups.poll() {
                        Some(group) => {
                            self.downstream.on_next(group);
                            emitted += 1;
                        }
                        None => break,
                    }
                }
                if emitted > 0 {
                    self.demand.produce(emitted);
                }
                if self.input_done.load(Ordering::Acquire)
                    && self.pending_groups.is_empty()
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
}

impl<T, K, V, KF, VF> rill_core::Subscriber<T> for GroupByStage<T, K, V, KF, VF>
where
    T: Send + 'static,
    K: Clone + Hash + Eq + Send + Sync + 'static,
    V: Send + 'static,
    KF: Fn(&T) -> K + Send + Sync + 'static,
    VF: Fn(T) -> Result<V, FlowError> + Send + Sync + 'static,
{
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if !self.upstream.set(rill_core::SubscriptionRef::clone(&subscription)) {
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        let downstream_subscription: rill_core::SubscriptionRef = me;
        self.downstream
            .on_subscribe(Upstream::Relay(downstream_subscription));
        subscription.request(GROUP_PREFETCH);
    }

    fn on_next(&self, value: T) {
        if self.done.is_done() || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let key = (self.key_fn)(&value);
        let mapped = match (self.value_fn)(value) {
            Ok(mapped) => mapped,
            Err(error) => {
                self.halt(error);
                return;
            }
        };
        let (processor, fresh) = {
            let mut groups = self.groups.lock();
            match groups.get(&key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let processor = UnicastProcessor::new(QueueFactory::unbounded());
                    // Every element a substream consumer drains frees one
                    // slot of upstream prefetch.
                    if let Some(me) = self.me.upgrade() {
                        let weak = Arc::downgrade(&me);
                        processor.set_on_consumed(move |n| {
                            if let Some(stage) = weak.upgrade() {
                                stage.upstream.request(n);
                            }
                        });
                        let weak = Arc::downgrade(&me);
                        let finished_key = key.clone();
                        processor.set_on_finish(move || {
                            if let Some(stage) = weak.upgrade() {
                                stage.groups.lock().remove(&finished_key);
                            }
                        });
                    }
                    groups.insert(key.clone(), Arc::clone(&processor));
                    (processor, true)
                }
            }
        };
        if processor.emit(mapped).is_err() {
            self.halt(FlowError::overflow("group substream rejected an element"));
            return;
        }
        if fresh {
            let flow = Flow::from_arc_source(processor as Arc<dyn Source<V>>);
            let _ = self
                .pending_groups
                .offer(GroupedFlow::new(key, flow));
            self.drain();
        }
    }

    fn on_error(&self, error: FlowError) {
        self.input_done.store(true, Ordering::Release);
        self.halt(error);
    }

    fn on_complete(&self) {
        self.input_done.store(true, Ordering::Release);
        let groups = std::mem::take(&mut *self.groups.lock());
        for processor in groups.into_values() {
            processor.finish();
        }
        self.drain();
    }
}

impl<T, K, V, KF, VF> Subscription for GroupByStage<T, K, V, KF, VF>
where
    T: Send + 'static,
    K: Clone + Hash + Eq + Send + Sync + 'static,
    V: Send + 'static,
    KF: Fn(&T) -> K + Send + Sync + 'static,
    VF: Fn(T) -> Result<V, FlowError> + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        if n == 0 {
            self.halt(FlowError::bad_request());
            return;
        }
        self.demand.add(n);
        self.drain();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.upstream.cancel();
            let groups = std::mem::take(&mut *self.groups.lock());
            for processor in groups.into_values() {
                processor.cancel();
            }
            self.drain();
        }
    }
}
