// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Deferred process termination. A termination request that arrives while
//! exit is blocked is only acted on once it is unblocked again.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use tracing::warn;

type ExitHandler = Box<dyn Fn() + Send + Sync>;

pub struct Terminator {
    exit_blocked: AtomicBool,
    exit_requested: AtomicBool,
    on_exit: ExitHandler,
}

impl fmt::Debug for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminator")
            .field("exit_blocked", &self.exit_blocked)
            .field("exit_requested", &self.exit_requested)
            .finish_non_exhaustive()
    }
}

impl Default for Terminator {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminator {
    /// Exit the process with status 2 when termination is honored.
    pub fn new() -> Self {
        Self::with_handler(Box::new(|| std::process::exit(2)))
    }

    pub fn with_handler(on_exit: ExitHandler) -> Self {
        Self {
            exit_blocked: AtomicBool::new(false),
            exit_requested: AtomicBool::new(false),
            on_exit,
        }
    }

    pub fn set_exit_blocked(&self, blocked: bool) {
        self.exit_blocked.store(blocked, Ordering::SeqCst);
    }

    pub fn is_exit_blocked(&self) -> bool {
        self.exit_blocked.load(Ordering::SeqCst)
    }

    pub fn is_exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    /// Called from the signal handler.
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);

        if self.is_exit_blocked() {
            warn!("Exit requested while blocked; deferring until the current step finishes");
        } else {
            (self.on_exit)();
        }
    }

    /// Unblock exit and honor a pending request.
    pub fn unblock(&self) {
        self.set_exit_blocked(false);

        if self.is_exit_requested() {
            (self.on_exit)();
        }
    }

    /// Unblock exit when the returned guard is dropped.
    pub fn exit_unblocker(&self) -> ExitUnblocker<'_> {
        ExitUnblocker { terminator: self }
    }
}

/// Guard returned by [`Terminator::exit_unblocker()`].
#[must_use]
pub struct ExitUnblocker<'a> {
    terminator: &'a Terminator,
}

impl Drop for ExitUnblocker<'_> {
    fn drop(&mut self) {
        self.terminator.unblock();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, atomic::AtomicUsize};

    use super::*;

    fn counting() -> (Terminator, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let terminator = Terminator::with_handler(Box::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        (terminator, count)
    }

    #[test]
    fn deferred_while_blocked() {
        let (terminator, count) = counting();

        {
            let _guard = terminator.exit_unblocker();
            terminator.set_exit_blocked(true);
            terminator.request_exit();
            assert_eq!(count.load(Ordering::SeqCst), 0);
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!terminator.is_exit_blocked());
    }

    #[test]
    fn immediate_when_unblocked() {
        let (terminator, count) = counting();

        terminator.request_exit();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
