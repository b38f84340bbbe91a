//! Execution-context discipline
//!
//! The runtime is single-threaded and signal-driven. Driver-facing calls are
//! only valid from a dispatched task, never from the signal delivery path:
//! the delivery path is restricted to the coarse broadcast and must never
//! mutate shared structures. `ExecContext` is the shared flag the subsystems
//! assert against.

use alloc::rc::Rc;
use core::cell::Cell;

/// Which context the current code runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Plain component code, outside any dispatch
    Outside,
    /// Inside a task dispatched by the scheduler (includes interrupt
    /// handlers and timer/work callbacks, which run under dispatch)
    Task,
    /// Inside the raw signal delivery path
    Signal,
}

/// Shared execution-context flag
///
/// Cheap to clone; every subsystem holds one and the dispatcher flips it
/// around callback invocations.
#[derive(Debug, Clone)]
pub struct ExecContext {
    kind: Rc<Cell<ContextKind>>,
}

impl ExecContext {
    pub fn new() -> Self {
        Self {
            kind: Rc::new(Cell::new(ContextKind::Outside)),
        }
    }

    pub fn current(&self) -> ContextKind {
        self.kind.get()
    }

    /// Switch to `kind` until the guard drops
    pub fn enter(&self, kind: ContextKind) -> ContextGuard {
        let previous = self.kind.replace(kind);
        ContextGuard {
            kind: Rc::clone(&self.kind),
            previous,
        }
    }

    /// Guard for driver-facing entry points
    ///
    /// # Panics
    /// Panics when called from the signal delivery path; doing so would
    /// reintroduce concurrent mutation of shared state.
    pub fn assert_not_signal(&self) {
        assert!(
            self.kind.get() != ContextKind::Signal,
            "driver-facing call from signal context"
        );
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Restores the previous context kind on drop
pub struct ContextGuard {
    kind: Rc<Cell<ContextKind>>,
    previous: ContextKind,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.kind.set(self.previous);
    }
}
