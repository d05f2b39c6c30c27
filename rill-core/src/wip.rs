// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The work-in-progress drain token.
//!
//! Stages that can be entered from several threads serialize their emission
//! loop through a `Wip` counter: the first thread to move it from 0 becomes
//! the drain owner; everyone else just bumps the counter and leaves. The
//! owner re-checks the counter before exiting and loops again if work
//! arrived while it was draining. Never hold a lock across user callbacks
//! instead of this.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Single-owner election counter for a stage's drain loop.
///
/// ```
/// use rill_core::Wip;
///
/// let wip = Wip::new();
/// if wip.enter() {
///     let mut missed = 1;
///     loop {
///         // ... drain as far as demand and queued work allow ...
///         missed = wip.leave(missed);
///         if missed == 0 {
///             break;
///         }
///     }
/// }
/// ```
#[derive(Debug, Default)]
pub struct Wip(AtomicUsize);

impl Wip {
    /// A token nobody holds.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Registers intent to drain. Returns `true` when the caller became the
    /// drain owner and must run the loop; `false` means an owner is active
    /// and has been signalled to re-loop.
    pub fn enter(&self) -> bool {
        self.0.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Owner-only: retires `missed` observed entries. A non-zero return
    /// means more entries arrived during the drain pass and the owner must
    /// loop again with that count.
    pub fn leave(&self, missed: usize) -> usize {
        self.0.fetch_sub(missed, Ordering::AcqRel) - missed
    }

    /// `true` while some thread owns the drain loop.
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn first_entry_owns() {
        let wip = Wip::new();
        assert!(wip.enter());
        assert!(!wip.enter());
        // Owner retires both entries in one pass.
        assert_eq!(wip.leave(2), 0);
        assert!(wip.enter());
        assert_eq!(wip.leave(1), 0);
    }

    #[test]
    fn drain_passes_never_overlap() {
        let wip = Arc::new(Wip::new());
        let in_drain = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let passes = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let wip = Arc::clone(&wip);
                let in_drain = Arc::clone(&in_drain);
                let passes = Arc::clone(&passes);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if wip.enter() {
                            let mut missed = 1;
                            loop {
                                assert!(
                                    !in_drain.swap(true, Ordering::SeqCst),
                                    "two drain owners ran at once"
                                );
                                passes.fetch_add(1, Ordering::SeqCst);
                                in_drain.store(false, Ordering::SeqCst);
                                missed = wip.leave(missed);
                                if missed == 0 {
                                    break;
                                }
                            }
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(passes.load(Ordering::SeqCst) > 0);
        assert!(!wip.is_active());
    }
}
