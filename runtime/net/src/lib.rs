//! Protocol/socket registry
//!
//! # Purpose
//! Front-end for the protocol stack a ported network driver plugs into:
//! protocol families register a socket constructor under a small integer
//! id, and socket creation dispatches to it after validating the request.
//! The stack internals behind the constructors are not this crate's
//! business; only registration and object life-cycle are.
//!
//! # Integration Points
//! - Depends on: dekit-substrate (context discipline)
//! - Provides to: dekit-env, ported protocol code
//!
//! # Architecture
//! A fixed-capacity table indexed by family id; registering out of range
//! fails loudly without touching the table. Socket allocation pairs the
//! generic socket object with its wait-queue slot as one transaction: if
//! the second step fails, the first is rolled back, so a half-constructed
//! socket is never reachable.
//!
//! # Testing Strategy
//! - Unit tests: table bounds, rollback accounting, error propagation
//! - Integration tests: family registration through dekit-env

#![no_std]

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

use static_assertions::const_assert;
use thiserror::Error;

mod family;
mod socket;

pub use family::{FamilyCtor, FamilyId, ProtocolTable};
pub use socket::{SockState, SockType, Socket, WaitQueueId};

/// Capacity of the protocol-family table
pub const MAX_FAMILIES: usize = 16;

/// Capacity of the wait-queue pool sockets allocate from
pub const MAX_WAIT_QUEUES: usize = 64;

const_assert!(MAX_FAMILIES > 0 && MAX_FAMILIES <= 64);
const_assert!(MAX_WAIT_QUEUES >= MAX_FAMILIES);

/// Error types for registry and socket operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NetError {
    #[error("protocol family {family} out of range (capacity {capacity})")]
    FamilyOutOfRange { family: usize, capacity: usize },

    #[error("no protocol registered for family {family}")]
    UnknownFamily { family: usize },

    #[error("invalid socket type {raw}")]
    InvalidType { raw: u32 },

    #[error("out of wait queues (capacity {capacity})")]
    OutOfWaitQueues { capacity: usize },

    #[error("socket has a shutdown pending")]
    ShutdownPending,

    #[error("operation not supported")]
    NotSupported,

    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

pub type Result<T> = core::result::Result<T, NetError>;
