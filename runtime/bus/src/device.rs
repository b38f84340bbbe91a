//! Bound-device wrapper
//!
//! Couples a claimed device capability to the resources a driver works
//! with: configuration space, memory ranges and the interrupt line. The
//! wrapper owns the capability from bind to unbind; releasing it hands the
//! device back to the broker.

use alloc::vec::Vec;

use bitflags::bitflags;
use dekit_substrate::{AccessWidth, BusHandle, DeviceCap, DeviceInfo, MapAttrs, MappedRange};

use crate::Result;

/// Offset of the command register in configuration space
const CONFIG_COMMAND: u16 = 0x04;

bitflags! {
    /// Command-register bits a driver flips before touching the device
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandFlags: u16 {
        const IO_SPACE   = 1 << 0;
        const MEM_SPACE  = 1 << 1;
        const BUS_MASTER = 1 << 2;
    }
}

pub struct BoundDevice {
    cap: DeviceCap,
    info: DeviceInfo,
    bus: BusHandle,
    mappings: Vec<MappedRange>,
}

impl BoundDevice {
    pub(crate) fn new(cap: DeviceCap, info: DeviceInfo, bus: BusHandle) -> Self {
        Self {
            cap,
            info,
            bus,
            mappings: Vec::new(),
        }
    }

    /// The capability this wrapper is registered under
    pub fn cap(&self) -> DeviceCap {
        self.cap
    }

    pub fn vendor_id(&self) -> u16 {
        self.info.vendor_id
    }

    pub fn device_id(&self) -> u16 {
        self.info.device_id
    }

    pub fn class_code(&self) -> u32 {
        self.info.class_code
    }

    pub fn irq_line(&self) -> u32 {
        self.info.irq_line
    }

    pub fn resource_count(&self) -> usize {
        self.info.mmio.len()
    }

    /// Physical base of memory resource `index`
    pub fn resource_start(&self, index: usize) -> Option<usize> {
        self.info.mmio.get(index).map(|r| r.paddr)
    }

    /// Size of memory resource `index`
    pub fn resource_len(&self, index: usize) -> Option<usize> {
        self.info.mmio.get(index).map(|r| r.size)
    }

    pub fn config_read8(&self, offset: u16) -> Result<u8> {
        self.config_read(offset, AccessWidth::Byte).map(|v| v as u8)
    }

    pub fn config_read16(&self, offset: u16) -> Result<u16> {
        self.config_read(offset, AccessWidth::Word).map(|v| v as u16)
    }

    pub fn config_read32(&self, offset: u16) -> Result<u32> {
        self.config_read(offset, AccessWidth::Dword)
    }

    pub fn config_write8(&self, offset: u16, value: u8) -> Result<()> {
        self.config_write(offset, AccessWidth::Byte, value as u32)
    }

    pub fn config_write16(&self, offset: u16, value: u16) -> Result<()> {
        self.config_write(offset, AccessWidth::Word, value as u32)
    }

    pub fn config_write32(&self, offset: u16, value: u32) -> Result<()> {
        self.config_write(offset, AccessWidth::Dword, value)
    }

    fn config_read(&self, offset: u16, width: AccessWidth) -> Result<u32> {
        Ok(self.bus.borrow_mut().config_read(self.cap, offset, width)?)
    }

    fn config_write(&self, offset: u16, width: AccessWidth, value: u32) -> Result<()> {
        Ok(self
            .bus
            .borrow_mut()
            .config_write(self.cap, offset, width, value)?)
    }

    /// Enable memory decoding and bus mastering
    pub fn enable(&self) -> Result<()> {
        let mut command = CommandFlags::from_bits_retain(self.config_read16(CONFIG_COMMAND)?);
        command |= CommandFlags::MEM_SPACE | CommandFlags::BUS_MASTER;
        self.config_write16(CONFIG_COMMAND, command.bits())
    }

    /// Map memory resource `index` into the local address space, uncached
    pub fn map_resource(&mut self, index: usize) -> Result<MappedRange> {
        let range = self
            .bus
            .borrow_mut()
            .map_range(self.cap, index, MapAttrs::mmio())?;
        self.mappings.push(range);
        Ok(range)
    }

    /// Undo every mapping made through this wrapper
    pub(crate) fn unmap_all(&mut self) {
        let mut bus = self.bus.borrow_mut();
        for range in self.mappings.drain(..) {
            if let Err(err) = bus.unmap_range(range) {
                log::warn!("unmap of {:#x} failed: {err}", range.vaddr);
            }
        }
    }

    /// Release the capability back to the broker
    pub(crate) fn release(&mut self) -> Result<()> {
        self.unmap_all();
        self.bus.borrow_mut().release_device(self.cap)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use core::cell::RefCell;
    use dekit_substrate::{MockDevice, MockPlatform, PlatformBus};

    fn bound_device() -> (BoundDevice, Rc<RefCell<MockPlatform>>) {
        let mut mock = MockPlatform::new();
        let cap = mock.add_device(
            MockDevice::new(0x8086, 0x100e, 0x02_00_00)
                .irq(11)
                .mmio(0xfebc_0000, 0x2_0000),
        );
        let info = mock.device_info(cap).unwrap();
        let platform = Rc::new(RefCell::new(mock));
        (BoundDevice::new(cap, info, platform.clone()), platform)
    }

    #[test]
    fn test_resource_queries() {
        let (dev, _) = bound_device();
        assert_eq!(dev.resource_count(), 1);
        assert_eq!(dev.resource_start(0), Some(0xfebc_0000));
        assert_eq!(dev.resource_len(0), Some(0x2_0000));
        assert_eq!(dev.resource_start(1), None);
    }

    #[test]
    fn test_enable_sets_command_bits() {
        let (dev, _) = bound_device();
        dev.enable().unwrap();
        let command = CommandFlags::from_bits_retain(dev.config_read16(0x04).unwrap());
        assert!(command.contains(CommandFlags::MEM_SPACE | CommandFlags::BUS_MASTER));
        assert!(!command.contains(CommandFlags::IO_SPACE));
    }

    #[test]
    fn test_map_and_unmap() {
        let (mut dev, platform) = bound_device();
        let range = dev.map_resource(0).unwrap();
        assert_eq!(range.paddr, 0xfebc_0000);
        assert_eq!(range.size, 0x2_0000);
        assert_eq!(platform.borrow().active_mappings(), 1);

        dev.unmap_all();
        assert_eq!(platform.borrow().active_mappings(), 0);
    }

    #[test]
    fn test_config_roundtrip() {
        let (dev, _) = bound_device();
        assert_eq!(dev.config_read16(0x00).unwrap(), 0x8086);
        dev.config_write8(0x40, 0xab).unwrap();
        assert_eq!(dev.config_read8(0x40).unwrap(), 0xab);
    }
}
