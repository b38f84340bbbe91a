//! Brokered device session interface
//!
//! The broker enumerates devices lazily through a first/next cursor because
//! it is itself resource-constrained: every step is accounted against the
//! session quota and may fail with `QuotaExhausted`. Callers recover by
//! requesting an upgrade and retrying the same step.

use crate::{DeviceCap, DeviceInfo, IrqCap, MapAttrs, MappedRange, Result, SignalId};
use alloc::vec::Vec;

/// Width of one configuration-space access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    Byte,
    Word,
    Dword,
}

impl AccessWidth {
    pub const fn bytes(self) -> usize {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::Word => 2,
            AccessWidth::Dword => 4,
        }
    }
}

/// Brokered access to bus devices, interrupts and device memory
///
/// Calls are synchronous from the caller's perspective; the blocking
/// primitive underneath yields to the dispatcher, so implementations must
/// tolerate interleaved signal delivery.
pub trait PlatformBus {
    /// Obtain the first device of the session
    ///
    /// # Errors
    /// `QuotaExhausted` if the step exceeds the session quota; the caller
    /// upgrades and retries.
    fn first_device(&mut self) -> Result<Option<DeviceCap>>;

    /// Obtain the successor of `prev` in enumeration order
    fn next_device(&mut self, prev: DeviceCap) -> Result<Option<DeviceCap>>;

    /// Donate `bytes` of quota to the session
    fn upgrade_quota(&mut self, bytes: usize) -> Result<()>;

    /// Read the resource descriptors of a device
    fn device_info(&self, dev: DeviceCap) -> Result<DeviceInfo>;

    /// Read from the device's configuration space
    fn config_read(&mut self, dev: DeviceCap, offset: u16, width: AccessWidth) -> Result<u32>;

    /// Write to the device's configuration space
    fn config_write(
        &mut self,
        dev: DeviceCap,
        offset: u16,
        width: AccessWidth,
        value: u32,
    ) -> Result<()>;

    /// Obtain the interrupt capability of a device and arrange for `notify`
    /// to be submitted whenever the interrupt fires
    fn request_irq(&mut self, dev: DeviceCap, notify: SignalId) -> Result<IrqCap>;

    /// Release an interrupt capability; no further signals are delivered
    fn release_irq(&mut self, irq: IrqCap) -> Result<()>;

    /// Interrupt lines raised since the last call, in delivery order
    fn pending_irqs(&mut self) -> Vec<u32>;

    /// Map the device memory range with index `index` into the local
    /// address space
    fn map_range(&mut self, dev: DeviceCap, index: usize, attrs: MapAttrs) -> Result<MappedRange>;

    /// Unmap a previously mapped range
    fn unmap_range(&mut self, range: MappedRange) -> Result<()>;

    /// Release the device capability back to the broker
    fn release_device(&mut self, dev: DeviceCap) -> Result<()>;
}
