//! Substrate interface - broker, signal and tick services
//!
//! # Purpose
//! Everything the driver runtime consumes from the outside world goes through
//! this crate: the resource broker that hands out device capabilities, the
//! asynchronous signal channel that drives execution, and the tick source
//! behind the timer subsystem. The rest of the runtime never talks to the
//! kernel directly.
//!
//! # Integration Points
//! - Depends on: nothing (interface crate)
//! - Provides to: dekit-exec, dekit-timer, dekit-bus, dekit-net, dekit-env
//! - Capabilities required: device session, signal contexts, timeout session
//!
//! # Architecture
//! `PlatformBus`, `SignalHub` and `TickSource` are object-safe traits so the
//! runtime can hold them as shared handles. `MockPlatform` implements all
//! three against in-memory state and is what the host-side tests run on.
//!
//! # Testing Strategy
//! - Unit tests: mock quota accounting, signal coalescing, tick arming
//! - Integration tests: exercised end-to-end through dekit-env

#![no_std]

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use bitflags::bitflags;
use thiserror::Error;

mod bus;
mod context;
pub mod mock;
mod signal;
mod tick;

pub use bus::{AccessWidth, PlatformBus};
pub use context::{ContextGuard, ContextKind, ExecContext};
pub use mock::{MockDevice, MockPlatform};
pub use signal::{SignalHub, SignalId};
pub use tick::TickSource;

/// Capability slot in the component's capability space
pub type CapSlot = usize;

/// Tick counter value of the timeout session
pub type Tick = u64;

/// Error types for substrate operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubstrateError {
    #[error("session quota exhausted (requested: {requested} bytes)")]
    QuotaExhausted { requested: usize },

    #[error("no device behind capability slot {slot}")]
    UnknownDevice { slot: CapSlot },

    #[error("interrupt line {line} rejected by broker")]
    IrqDenied { line: u32 },

    #[error("resource index {index} out of range")]
    BadResource { index: usize },

    #[error("out of signal contexts")]
    OutOfSignalContexts,

    #[error("operation not supported by this substrate")]
    NotSupported,
}

pub type Result<T> = core::result::Result<T, SubstrateError>;

/// Capability to one enumerated bus device
///
/// Only ever produced by a `PlatformBus`; the runtime treats the slot as
/// opaque and uses the capability as the lookup key for bound devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceCap(CapSlot);

impl DeviceCap {
    pub const fn new(slot: CapSlot) -> Self {
        Self(slot)
    }

    pub const fn slot(self) -> CapSlot {
        self.0
    }
}

/// Interrupt capability with its signal-delivery association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqCap {
    slot: CapSlot,
    line: u32,
}

impl IrqCap {
    pub const fn new(slot: CapSlot, line: u32) -> Self {
        Self { slot, line }
    }

    pub const fn line(self) -> u32 {
        self.line
    }

    pub const fn slot(self) -> CapSlot {
        self.slot
    }
}

/// One physical memory range of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioRange {
    pub paddr: usize,
    pub size: usize,
}

/// Resource descriptors of one enumerated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub device_id: u16,
    /// 24-bit class/subclass/interface code
    pub class_code: u32,
    pub irq_line: u32,
    pub mmio: Vec<MmioRange>,
}

/// A device memory range mapped into the local address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    /// Virtual address where the range is mapped
    pub vaddr: usize,

    /// Physical address of the range
    pub paddr: usize,

    /// Size in bytes
    pub size: usize,
}

bitflags! {
    /// Attributes for mapping a device memory range
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapAttrs: u32 {
        const READ     = 1 << 0;
        const WRITE    = 1 << 1;
        /// Device memory must bypass the cache
        const UNCACHED = 1 << 2;
    }
}

impl MapAttrs {
    /// The usual attributes for device registers
    pub const fn mmio() -> Self {
        Self::READ.union(Self::WRITE).union(Self::UNCACHED)
    }
}

/// Shared handle to the brokered device session
pub type BusHandle = Rc<RefCell<dyn PlatformBus>>;

/// Shared handle to the signal channel
pub type HubHandle = Rc<RefCell<dyn SignalHub>>;

/// Shared handle to the tick source
pub type TickHandle = Rc<RefCell<dyn TickSource>>;
