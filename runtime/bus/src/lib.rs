//! Device/bus registry and interrupt dispatch
//!
//! # Purpose
//! Multiplexes the broker's scarce device resources to ported driver code:
//! enumerate capability-secured device handles, match them against driver
//! identification tables, bind drivers, and route claimed interrupt lines to
//! registered handlers.
//!
//! # Integration Points
//! - Depends on: dekit-substrate (brokered device session)
//! - Provides to: dekit-env, ported driver code
//! - Capabilities required: device session with quota, interrupt capabilities
//!
//! # Architecture
//! Enumeration walks the broker's first/next cursor and recovers from quota
//! exhaustion with one upgrade-and-retry per failure. Bound devices are
//! registered by capability so config-space accessors can resolve the
//! wrapper from the handle a driver carries around; that lookup is a tagged
//! table, never a reinterpretation of one handle type as another.
//!
//! # Testing Strategy
//! - Unit tests: match rules, quota retry counting, probe rollback,
//!   unowned-line errors
//! - Integration tests: full bind/interrupt flow in dekit-env

#![no_std]

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

use dekit_substrate::{CapSlot, SubstrateError};
use thiserror::Error;

mod device;
mod ident;
mod irq;
mod registry;

pub use device::{BoundDevice, CommandFlags};
pub use ident::{find_match, IdTableEntry, ANY_DEVICE};
pub use irq::IrqDispatch;
pub use registry::{BusDriver, BusRegistry, DeviceHandle, DeviceList, DriverHandle};

/// Error types for registry and interrupt operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("driver registered without an identification table")]
    NoIdTable,

    #[error("no bound device owns interrupt line {line}")]
    DeviceNotFound { line: u32 },

    #[error("interrupt line {line} already has a handler")]
    LineBusy { line: u32 },

    #[error("interrupt line {line} has no handler")]
    NoHandler { line: u32 },

    #[error("no bound device for capability slot {slot}")]
    NotBound { slot: CapSlot },

    #[error("probe rejected: {0}")]
    ProbeRejected(&'static str),

    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

pub type Result<T> = core::result::Result<T, BusError>;
