// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Hot sources: the bridge from cold, per-subscriber flows to a shared
//! live signal.
//!
//! A [`ConnectableFlow`] separates subscribing from starting the upstream:
//! subscribers that arrive before `connect` are parked, and `connect`
//! creates the single upstream subscription whose signals are broadcast.
//! `publish` coordinates upstream demand as the minimum outstanding across
//! subscribers; `replay` retains bounded history and re-delivers it to
//! late subscribers.

pub(crate) mod connectable;
pub(crate) mod publish;
pub(crate) mod replay;

pub use connectable::ConnectableFlow;
pub use replay::ReplayConfig;
