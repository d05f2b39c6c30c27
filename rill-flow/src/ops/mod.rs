// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Operator stage implementations.
//!
//! Every file holds one operator family: a `*Source` that captures the
//! composition-time configuration and a `*Stage` created per subscription.
//! Stages implement `Subscriber` toward their upstream and (usually)
//! `Subscription` toward their downstream, built with `Arc::new_cyclic` so
//! the stage can hand itself out during the handshake.

pub(crate) mod amb;
pub(crate) mod backpressure;
pub(crate) mod buffer;
pub(crate) mod combine_latest;
pub(crate) mod concat;
pub(crate) mod concat_map;
pub(crate) mod delay;
pub(crate) mod distinct;
pub(crate) mod filter;
pub(crate) mod flat_map;
pub(crate) mod group_by;
pub(crate) mod hide;
pub(crate) mod map;
pub(crate) mod on_error;
pub(crate) mod processor;
pub(crate) mod publish_on;
pub(crate) mod reduce;
pub(crate) mod repeat;
pub(crate) mod retry;
pub(crate) mod sample;
pub(crate) mod scan;
pub(crate) mod skip;
pub(crate) mod start_with;
pub(crate) mod subscribe_on;
pub(crate) mod switch_map;
pub(crate) mod take;
pub(crate) mod tap;
pub(crate) mod throttle;
pub(crate) mod timeout;
pub(crate) mod window;
pub(crate) mod with_latest_from;
pub(crate) mod zip;

use rill_core::hooks;
use rill_core::FlowError;
use std::sync::atomic::{AtomicBool, Ordering};

/// One-shot terminal latch shared by most stages: the first caller wins the
/// right to deliver the terminal; later errors go to the dropped-error hook.
#[derive(Debug, Default)]
pub(crate) struct Terminal(AtomicBool);

impl Terminal {
    pub(crate) const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// `true` exactly once, for the caller that owns the terminal.
    pub(crate) fn enter(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Routes an error that lost the terminal race to the hook.
    pub(crate) fn drop_error(error: FlowError) {
        hooks::on_error_dropped(error);
    }
}
