// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The queue layer.
//!
//! Queues are the only shared mutable state that crosses threads inside a
//! stage. The contract is deliberately small: non-blocking `offer` that may
//! reject when bounded and full, non-blocking `poll`, and an emptiness
//! probe. A successful `offer` happens-before the `poll` that returns the
//! element (guaranteed by the crossbeam queues underneath).
//!
//! Stages never construct queues directly; they go through the
//! [`QueueFactory`] they were configured with, so capacity policy stays
//! injectable per operator.

use crossbeam_queue::{ArrayQueue, SegQueue};
use std::sync::Arc;

/// Non-blocking FIFO contract between one stage's producer and consumer
/// sides.
pub trait Queue<T>: Send + Sync {
    /// Enqueues, or hands the element back when bounded and full.
    fn offer(&self, value: T) -> Result<(), T>;

    /// Dequeues the oldest element, or `None` when empty.
    fn poll(&self) -> Option<T>;

    /// `true` when a `poll` right now would return `None`.
    fn is_empty(&self) -> bool;

    /// Number of queued elements.
    fn len(&self) -> usize;

    /// Discards all queued elements.
    fn clear(&self);

    /// The bound, or `None` for unbounded queues.
    fn capacity(&self) -> Option<usize>;
}

/// Shared handle to a [`Queue`].
pub type QueueRef<T> = Arc<dyn Queue<T>>;

struct Bounded<T>(ArrayQueue<T>);

impl<T: Send> Queue<T> for Bounded<T> {
    fn offer(&self, value: T) -> Result<(), T> {
        self.0.push(value)
    }

    fn poll(&self) -> Option<T> {
        self.0.pop()
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn clear(&self) {
        while self.0.pop().is_some() {}
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.0.capacity())
    }
}

struct Unbounded<T>(SegQueue<T>);

impl<T: Send> Queue<T> for Unbounded<T> {
    fn offer(&self, value: T) -> Result<(), T> {
        self.0.push(value);
        Ok(())
    }

    fn poll(&self) -> Option<T> {
        self.0.pop()
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn clear(&self) {
        while self.0.pop().is_some() {}
    }

    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// What a stage does with a new element when downstream demand is zero and
/// there is no room left.
///
/// One policy enum drives every overflow site in the engine: the emitter
/// facade, the backpressure adapter stages and replay history trimming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Buffer without bound until demand arrives.
    #[default]
    Buffer,
    /// Drop the incoming element.
    Drop,
    /// Keep only the most recent element, replacing any parked one.
    Latest,
    /// Terminate the flow with [`FlowError::Overflow`](crate::FlowError).
    Error,
}

/// Injectable queue constructor carried by operator configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFactory {
    kind: Kind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Bounded(usize),
    Unbounded,
}

impl QueueFactory {
    /// Queues bounded at `capacity` elements (at least one).
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self {
            kind: Kind::Bounded(capacity.max(1)),
        }
    }

    /// Unbounded queues.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            kind: Kind::Unbounded,
        }
    }

    /// Builds one queue.
    #[must_use]
    pub fn create<T: Send + 'static>(&self) -> QueueRef<T> {
        match self.kind {
            Kind::Bounded(capacity) => Arc::new(Bounded(ArrayQueue::new(capacity))),
            Kind::Unbounded => Arc::new(Unbounded(SegQueue::new())),
        }
    }

    /// The configured bound, or `None` for unbounded factories.
    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        match self.kind {
            Kind::Bounded(capacity) => Some(capacity),
            Kind::Unbounded => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_rejects_when_full() {
        let queue = QueueFactory::bounded(2).create::<u32>();
        assert!(queue.offer(1).is_ok());
        assert!(queue.offer(2).is_ok());
        assert_eq!(queue.offer(3), Err(3));
        assert_eq!(queue.poll(), Some(1));
        assert!(queue.offer(3).is_ok());
    }

    #[test]
    fn unbounded_accepts_and_preserves_order() {
        let queue = QueueFactory::unbounded().create::<u32>();
        for i in 0..100 {
            queue.offer(i).unwrap();
        }
        assert_eq!(queue.len(), 100);
        for i in 0..100 {
            assert_eq!(queue.poll(), Some(i));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn clear_empties() {
        let queue = QueueFactory::bounded(8).create::<u32>();
        queue.offer(1).unwrap();
        queue.offer(2).unwrap();
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn capacity_is_clamped_to_one() {
        let factory = QueueFactory::bounded(0);
        assert_eq!(factory.capacity(), Some(1));
    }
}
