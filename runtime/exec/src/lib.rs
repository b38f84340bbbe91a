//! Execution core - bridge, scheduler and work queue
//!
//! # Purpose
//! Reproduces a monolithic kernel's concurrency model on the substrate's
//! single-threaded, run-to-completion, signal-driven execution: blocking
//! waits become voluntary yields, deferred work drains once per wake, and
//! the one external signal channel turns into coarse broadcast wake-ups.
//!
//! # Integration Points
//! - Depends on: dekit-substrate (signal channel, context discipline)
//! - Provides to: dekit-env, ported driver code
//!
//! # Architecture
//! One `Bridge` owns the component's signal context. Each delivery triggers
//! a broadcast: every ready task runs to completion or voluntary yield, then
//! the work queue drains. No two tasks, and no task and the bridge's own
//! handling, ever execute concurrently; that invariant is what lets code
//! written against kernel-level locking run unmodified.
//!
//! # Testing Strategy
//! - Unit tests: task life-cycle, broadcast semantics, re-entrant drain
//! - Integration tests: full wake loop in dekit-env

#![no_std]

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

mod bridge;
mod task;
mod work;

pub use bridge::Bridge;
pub use task::{Scheduler, TaskId, TaskOutcome, TaskState};
pub use work::{WorkId, WorkKind, WorkQueue};
