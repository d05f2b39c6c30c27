// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Test doubles for the rill protocol.
//!
//! [`TestSubscriber`] sits at the end of a chain, records every observed
//! [`Signal`] and lets the test control demand; its blocking `await_*`
//! helpers synchronize test threads with asynchronous stages. It also
//! asserts the serialization law mechanically: overlapping signal
//! delivery panics the offending producer.
//!
//! [`TestSource`] sits at the top of a chain, records `request`/`cancel`
//! traffic and emits under test control, which is what the demand
//! conservation and cancellation-finality properties are checked with.

#![allow(clippy::multiple_crate_versions, clippy::doc_markdown)]

pub mod test_source;
pub mod test_subscriber;

pub use test_source::TestSource;
pub use test_subscriber::TestSubscriber;

pub use rill_core::Signal;
