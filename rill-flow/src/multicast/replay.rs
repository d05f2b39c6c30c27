// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! History-retaining broadcast hub.
//!
//! Every value from the single upstream subscription lands in a shared
//! history, trimmed by count and/or age. Each subscriber owns a cursor
//! into that history and drains at its own demand; late subscribers start
//! from the oldest retained entry and, after the terminal, still receive
//! the retained history followed by the terminal.

use crate::multicast::connectable::Connect;
use crate::ops::Terminal;
use parking_lot::Mutex;
use rill_core::{
    CancellationToken, Demand, FlowError, Source, SourceRef, SubscriberRef, Subscription,
    SubscriptionCell, Upstream, Wip, UNBOUNDED,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Retention policy for [`Flow::replay`](crate::Flow::replay).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayConfig {
    /// Keep at most this many values (`None` = no count bound).
    pub count: Option<usize>,
    /// Drop values older than this (`None` = no age bound).
    pub max_age: Option<Duration>,
}

impl ReplayConfig {
    /// Retain the last `count` values.
    #[must_use]
    pub fn count(count: usize) -> Self {
        Self {
            count: Some(count),
            max_age: None,
        }
    }

    /// Retain values no older than `max_age`.
    #[must_use]
    pub fn age(max_age: Duration) -> Self {
        Self {
            count: None,
            max_age: Some(max_age),
        }
    }

    /// Retain everything.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }
}

pub(crate) struct ReplayHub<T: Clone + Send + 'static> {
    me: Weak<Self>,
    upstream_source: SourceRef<T>,
    config: ReplayConfig,
    upstream: SubscriptionCell,
    connection: Mutex<Option<CancellationToken>>,
    connected: AtomicBool,
    history: Mutex<History<T>>,
    slots: Mutex<Vec<Arc<ReplaySlot<T>>>>,
    input_done: AtomicBool,
    error: Mutex<Option<FlowError>>,
}

struct History<T> {
    entries: VecDeque<(Instant, T)>,
    /// Absolute index of `entries[0]`; cursors are absolute so trimming
    /// does not disturb them.
    base: u64,
}

struct ReplaySlot<T: Send + 'static> {
    subscriber: SubscriberRef<T>,
    cursor: Mutex<u64>,
    demand: Demand,
    wip: Wip,
    cancelled: AtomicBool,
    done: Terminal,
}

impl<T: Clone + Send + 'static> ReplayHub<T> {
    pub(crate) fn new(upstream_source: SourceRef<T>, config: ReplayConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            upstream_source,
            config,
            upstream: SubscriptionCell::new(),
            connection: Mutex::new(None),
            connected: AtomicBool::new(false),
            history: Mutex::new(History {
                entries: VecDeque::new(),
                base: 0,
            }),
            slots: Mutex::new(Vec::new()),
            input_done: AtomicBool::new(false),
            error: Mutex::new(None),
        })
    }

    fn record(&self, value: T) {
        let mut history = self.history.lock();
        history.entries.push_back((Instant::now(), value));
        self.trim(&mut history);
    }

    fn trim(&self, history: &mut History<T>) {
        if let Some(count) = self.config.count {
            while history.entries.len() > count {
                history.entries.pop_front();
                history.base += 1;
            }
        }
        if let Some(max_age) = self.config.max_age {
            let now = Instant::now();
            while history
                .entries
                .front()
                .is_some_and(|(at, _)| now.duration_since(*at) > max_age)
            {
                history.entries.pop_front();
                history.base += 1;
            }
        }
    }

    fn drain_all(&self) {
        let slots: Vec<_> = {
            let mut slots = self.slots.lock();
            slots.retain(|slot| !slot.cancelled.load(Ordering::Acquire) && !slot.done.is_done());
            slots.clone()
        };
        for slot in slots {
            self.drain_slot(&slot);
        }
    }

    fn drain_slot(&self, slot: &Arc<ReplaySlot<T>>) {
        if !slot.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if !slot.cancelled.load(Ordering::Acquire) && !slot.done.is_done() {
                let mut emitted = 0u64;
                loop {
                    if slot.demand.get() <= emitted {
                        break;
                    }
                    let next = {
                        let mut history = self.history.lock();
                        self.trim(&mut history);
                        let mut cursor = slot.cursor.lock();
                        if *cursor < history.base {
                            // Trimmed past the cursor; resume at the oldest
                            // retained entry.
                            *cursor = history.base;
                        }
                        let offset = (*cursor - history.base) as usize;
                        let value = history.entries.get(offset).map(|(_, v)| v.clone());
                        if value.is_some() {
                            *cursor += 1;
                        }
                        value
                    };
                    match next {
                        Some(value) => {
                            slot.subscriber.on_next(value);
                            emitted += 1;
                        }
                        None => break,
                    }
                }
                if emitted > 0 {
                    slot.demand.produce(emitted);
                }
                let caught_up = {
                    let history = self.history.lock();
                    *slot.cursor.lock() >= history.base + history.entries.len() as u64
                };
                if caught_up && self.input_done.load(Ordering::Acquire) && slot.done.enter() {
                    match self.error.lock().clone() {
                        Some(error) => slot.subscriber.on_error(error),
                        None => slot.subscriber.on_complete(),
                    }
                }
            }
            missed = slot.wip.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Clone + Send + 'static> Source<T> for ReplayHub<T> {
    fn subscribe(&self, subscriber: SubscriberRef<T>) {
        let slot = Arc::new(ReplaySlot {
            subscriber: SubscriberRef::clone(&subscriber),
            cursor: Mutex::new(self.history.lock().base),
            demand: Demand::new(),
            wip: Wip::new(),
            cancelled: AtomicBool::new(false),
            done: Terminal::new(),
        });
        self.slots.lock().push(Arc::clone(&slot));
        let Some(me) = self.me.upgrade() else { return };
        let subscription: rill_core::SubscriptionRef = Arc::new(ReplaySubscription {
            hub: me,
            slot,
        });
        subscriber.on_subscribe(Upstream::Relay(subscription));
    }
}

impl<T: Clone + Send + 'static> ReplayHub<T> {
    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.upstream.cancel_current();
    }
}

impl<T: Clone + Send + 'static> Connect for ReplayHub<T> {
    fn connect(&self) -> CancellationToken {
        {
            let connection = self.connection.lock();
            if let Some(existing) = connection.as_ref() {
                if !existing.is_cancelled() {
                    return existing.clone();
                }
            }
        }
        let token = CancellationToken::new();
        *self.connection.lock() = Some(token.clone());
        if let Some(me) = self.me.upgrade() {
            let hub = Arc::downgrade(&me);
            token.on_cancel(move || {
                if let Some(hub) = hub.upgrade() {
                    hub.disconnect();
                }
            });
            if !self.connected.swap(true, Ordering::AcqRel) {
                let tap: SubscriberRef<T> = Arc::new(ReplayUpstream { hub: me });
                self.upstream_source.subscribe(tap);
            }
        }
        token
    }
}

struct ReplayUpstream<T: Clone + Send + 'static> {
    hub: Arc<ReplayHub<T>>,
}

impl<T: Clone + Send + 'static> rill_core::Subscriber<T> for ReplayUpstream<T> {
    fn on_subscribe(&self, upstream: Upstream<T>) {
        let subscription = upstream.subscription();
        if self
            .hub
            .upstream
            .set(rill_core::SubscriptionRef::clone(&subscription))
        {
            subscription.request(UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        if self.hub.input_done.load(Ordering::Acquire) {
            return;
        }
        self.hub.record(value);
        self.hub.drain_all();
    }

    fn on_error(&self, error: FlowError) {
        if !self.hub.input_done.swap(true, Ordering::AcqRel) {
            *self.hub.error.lock() = Some(error);
            self.hub.upstream.cancel_current();
            self.hub.drain_all();
        } else {
            rill_core::hooks::on_error_dropped(error);
        }
    }

    fn on_complete(&self) {
        if !self.hub.input_done.swap(true, Ordering::AcqRel) {
            self.hub.upstream.cancel_current();
            self.hub.drain_all();
        }
    }
}

struct ReplaySubscription<T: Clone + Send + 'static> {
    hub: Arc<ReplayHub<T>>,
    slot: Arc<ReplaySlot<T>>,
}

impl<T: Clone + Send + 'static> Subscription for ReplaySubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            if self.slot.done.enter() {
                self.slot.cancelled.store(true, Ordering::Release);
                self.slot.subscriber.on_error(FlowError::bad_request());
            }
            return;
        }
        self.slot.demand.add(n);
        self.hub.drain_slot(&self.slot);
    }

    fn cancel(&self) {
        self.slot.cancelled.store(true, Ordering::Release);
    }
}
