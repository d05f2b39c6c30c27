// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Process-wide hook for errors that can no longer be delivered.
//!
//! The protocol allows exactly one terminal per subscriber. Errors that
//! arrive after a terminal (or are thrown by `on_error` itself, or surface
//! on an already-cancelled edge) cannot travel downstream; they are routed
//! here instead. The default sink logs and swallows. Tests and embedders
//! install their own sink with [`set_dropped_error_hook`].

use crate::error::FlowError;
use parking_lot::RwLock;
use std::sync::Arc;

type DroppedErrorHook = Arc<dyn Fn(&FlowError) + Send + Sync>;

static DROPPED_ERROR_HOOK: RwLock<Option<DroppedErrorHook>> = RwLock::new(None);

/// Routes an undeliverable error to the installed hook, or logs it.
pub fn on_error_dropped(error: FlowError) {
    let hook = DROPPED_ERROR_HOOK.read().clone();
    match hook {
        Some(hook) => hook(&error),
        None => {
            error!("rill: dropped error past terminal: {error}");
        }
    }
}

/// Installs a process-wide sink for dropped errors.
pub fn set_dropped_error_hook(hook: impl Fn(&FlowError) + Send + Sync + 'static) {
    *DROPPED_ERROR_HOOK.write() = Some(Arc::new(hook));
}

/// Restores the default log-and-swallow behavior.
pub fn reset_dropped_error_hook() {
    *DROPPED_ERROR_HOOK.write() = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn installed_hook_observes_drops() {
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        set_dropped_error_hook(|_| {
            SEEN.fetch_add(1, Ordering::SeqCst);
        });
        on_error_dropped(FlowError::stream("late"));
        assert_eq!(SEEN.load(Ordering::SeqCst), 1);
        reset_dropped_error_hook();
    }
}
