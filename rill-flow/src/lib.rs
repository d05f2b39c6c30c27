// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Operator stage library and `Flow` facade of the rill reactive runtime.
//!
//! A [`Flow<T>`] is a cold, backpressure-aware sequence: subscribing wires
//! up a fresh chain of operator stages between the source and the
//! subscriber, and the subscriber paces emission through `request`. The
//! crate provides:
//!
//! - **Sources**: `just`, `empty`, `never`, `fail`, `from_iter`, `range`,
//!   `defer`, `timer`, `interval`, the imperative [`Emitter`] facade
//!   (`create`) and a `futures::Stream` bridge.
//! - **Operators**: the stage library: stateless maps and filters,
//!   ordering combinators (`concat`, `concat_map`, `amb`, `switch_map`),
//!   interleaving combinators (`flat_map`, `merge`, `zip`,
//!   `combine_latest`, `with_latest_from`), rate and time operators,
//!   buffers, windows, reductions into [`Solo`], error recovery
//!   (`on_error_resume_with`, `retry*`, `repeat*`), backpressure adapters
//!   and `group_by`.
//! - **Scheduler bridge**: `publish_on` / `subscribe_on` against the
//!   executor traits from `rill-runtime`.
//! - **Multicast**: [`ConnectableFlow`] with `publish`, `replay`,
//!   `auto_connect`, `ref_count` and `share`.
//!
//! # Quick start
//!
//! ```
//! use rill_flow::Flow;
//! use std::time::Duration;
//!
//! let squares = Flow::range(1, 5)
//!     .map(|x| x * x)
//!     .to_list()
//!     .block(Duration::from_secs(1))
//!     .unwrap();
//! assert_eq!(squares, Some(vec![1, 4, 9, 16, 25]));
//! ```
//!
//! # Backpressure
//!
//! Every edge obeys the demand contract: a producer may deliver at most as
//! many elements as the consumer requested. Operators either relay demand
//! 1:1 (maps, filters), rescale it (buffers), prefetch bounded batches
//! (`flat_map`, `zip`, `publish_on`) or decouple entirely behind an
//! explicit policy (`on_backpressure_*`, `create`).

#![allow(clippy::multiple_crate_versions, clippy::doc_markdown)]

mod logging;

pub mod bridge;
mod flow;
pub mod multicast;
pub(crate) mod ops;
mod solo;
pub(crate) mod source;
mod subscriber;

pub use bridge::FlowStream;
pub use flow::Flow;
pub use multicast::{ConnectableFlow, ReplayConfig};
pub use ops::concat::ErrorMode;
pub use ops::flat_map::FlatMapConfig;
pub use ops::group_by::GroupedFlow;
pub use ops::tap::Tap;
pub use solo::Solo;
pub use source::Emitter;

// The protocol vocabulary is part of this crate's API surface.
pub use rill_core::{
    FlowError, FusionMode, OverflowPolicy, QueueFactory, Result, Scalar, Signal, Source,
    SourceRef, Subscriber, SubscriberRef, Subscription, SubscriptionRef, Upstream,
};
