//! In-memory substrate for host-side tests
//!
//! `MockPlatform` implements all three substrate traits against plain state:
//! a seeded device table with PCI-style configuration space, a session quota
//! that is charged per enumeration step, a coalescing signal queue and a
//! manually advanced tick counter. Tests drive interrupts and deadlines by
//! hand and read back the recorded upgrade/attempt counters.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::{
    AccessWidth, DeviceCap, DeviceInfo, IrqCap, MapAttrs, MappedRange, MmioRange, PlatformBus,
    Result, SignalHub, SignalId, SubstrateError, Tick, TickSource,
};

/// Quota charged per enumeration step
pub const ENUM_STEP_COST: usize = 4096;

/// Quota a fresh mock session starts with
pub const DEFAULT_QUOTA: usize = 64 * 1024;

const CONFIG_SPACE_SIZE: usize = 256;

/// Description of one seeded device
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u32,
    pub irq_line: u32,
    pub mmio: Vec<MmioRange>,
}

impl MockDevice {
    pub fn new(vendor_id: u16, device_id: u16, class_code: u32) -> Self {
        Self {
            vendor_id,
            device_id,
            class_code,
            irq_line: 0,
            mmio: Vec::new(),
        }
    }

    pub fn irq(mut self, line: u32) -> Self {
        self.irq_line = line;
        self
    }

    pub fn mmio(mut self, paddr: usize, size: usize) -> Self {
        self.mmio.push(MmioRange { paddr, size });
        self
    }
}

struct DeviceSlot {
    info: DeviceInfo,
    config: [u8; CONFIG_SPACE_SIZE],
    released: bool,
}

impl DeviceSlot {
    fn new(desc: MockDevice) -> Self {
        let mut config = [0u8; CONFIG_SPACE_SIZE];
        config[0x00..0x02].copy_from_slice(&desc.vendor_id.to_le_bytes());
        config[0x02..0x04].copy_from_slice(&desc.device_id.to_le_bytes());
        // class/subclass/interface live in the top three bytes of the
        // dword at 0x08, the revision in the low byte
        config[0x08..0x0c].copy_from_slice(&(desc.class_code << 8).to_le_bytes());
        config[0x3c] = desc.irq_line as u8;

        Self {
            info: DeviceInfo {
                vendor_id: desc.vendor_id,
                device_id: desc.device_id,
                class_code: desc.class_code,
                irq_line: desc.irq_line,
                mmio: desc.mmio,
            },
            config,
            released: false,
        }
    }
}

/// Deterministic in-memory substrate
pub struct MockPlatform {
    devices: Vec<DeviceSlot>,
    quota: usize,
    upgrades: usize,
    enum_attempts: usize,

    next_signal: u32,
    pending: VecDeque<SignalId>,

    irq_bindings: BTreeMap<u32, SignalId>,
    next_irq_slot: usize,
    raised: VecDeque<u32>,

    now: Tick,
    armed: Option<(Tick, SignalId)>,

    next_vaddr: usize,
    active_mappings: usize,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::with_quota(DEFAULT_QUOTA)
    }

    /// Start the session with `quota` bytes; small values force the
    /// quota-upgrade path during enumeration
    pub fn with_quota(quota: usize) -> Self {
        Self {
            devices: Vec::new(),
            quota,
            upgrades: 0,
            enum_attempts: 0,
            next_signal: 0,
            pending: VecDeque::new(),
            irq_bindings: BTreeMap::new(),
            next_irq_slot: 0x1000,
            raised: VecDeque::new(),
            now: 0,
            armed: None,
            next_vaddr: 0x8000_0000,
            active_mappings: 0,
        }
    }

    /// Start the tick counter near the wrap point
    pub fn with_tick_origin(mut self, origin: Tick) -> Self {
        self.now = origin;
        self
    }

    pub fn add_device(&mut self, desc: MockDevice) -> DeviceCap {
        self.devices.push(DeviceSlot::new(desc));
        DeviceCap::new(self.devices.len() - 1)
    }

    /// Simulate a hardware interrupt on `line`
    ///
    /// Returns whether a handler association existed; an unbound line is
    /// dropped the way the broker drops unrequested interrupts.
    pub fn raise_irq(&mut self, line: u32) -> bool {
        match self.irq_bindings.get(&line) {
            Some(&notify) => {
                self.raised.push_back(line);
                self.submit(notify);
                true
            }
            None => {
                log::debug!("mock: interrupt on unbound line {line} dropped");
                false
            }
        }
    }

    /// Advance the tick counter, firing an armed deadline that elapses
    pub fn advance_ticks(&mut self, ticks: Tick) {
        self.now = self.now.wrapping_add(ticks);
        if let Some((deadline, notify)) = self.armed {
            if elapsed(self.now, deadline) {
                self.armed = None;
                self.submit(notify);
            }
        }
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    pub fn upgrade_count(&self) -> usize {
        self.upgrades
    }

    pub fn enum_attempt_count(&self) -> usize {
        self.enum_attempts
    }

    pub fn active_mappings(&self) -> usize {
        self.active_mappings
    }

    pub fn irq_binding_count(&self) -> usize {
        self.irq_bindings.len()
    }

    fn charge_enum_step(&mut self) -> Result<()> {
        self.enum_attempts += 1;
        if self.quota < ENUM_STEP_COST {
            return Err(SubstrateError::QuotaExhausted {
                requested: ENUM_STEP_COST,
            });
        }
        self.quota -= ENUM_STEP_COST;
        Ok(())
    }

    fn slot(&self, dev: DeviceCap) -> Result<&DeviceSlot> {
        self.devices
            .get(dev.slot())
            .filter(|s| !s.released)
            .ok_or(SubstrateError::UnknownDevice { slot: dev.slot() })
    }

    fn slot_mut(&mut self, dev: DeviceCap) -> Result<&mut DeviceSlot> {
        self.devices
            .get_mut(dev.slot())
            .filter(|s| !s.released)
            .ok_or(SubstrateError::UnknownDevice { slot: dev.slot() })
    }

    fn cap_at_or_after(&self, index: usize) -> Option<DeviceCap> {
        self.devices
            .iter()
            .enumerate()
            .skip(index)
            .find(|(_, s)| !s.released)
            .map(|(i, _)| DeviceCap::new(i))
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraparound-safe "now has reached deadline"
fn elapsed(now: Tick, deadline: Tick) -> bool {
    now.wrapping_sub(deadline) as i64 >= 0
}

impl PlatformBus for MockPlatform {
    fn first_device(&mut self) -> Result<Option<DeviceCap>> {
        self.charge_enum_step()?;
        Ok(self.cap_at_or_after(0))
    }

    fn next_device(&mut self, prev: DeviceCap) -> Result<Option<DeviceCap>> {
        self.charge_enum_step()?;
        Ok(self.cap_at_or_after(prev.slot() + 1))
    }

    fn upgrade_quota(&mut self, bytes: usize) -> Result<()> {
        self.upgrades += 1;
        self.quota += bytes;
        log::debug!("mock: quota upgraded by {bytes} to {}", self.quota);
        Ok(())
    }

    fn device_info(&self, dev: DeviceCap) -> Result<DeviceInfo> {
        Ok(self.slot(dev)?.info.clone())
    }

    fn config_read(&mut self, dev: DeviceCap, offset: u16, width: AccessWidth) -> Result<u32> {
        let slot = self.slot(dev)?;
        let offset = offset as usize;
        if offset + width.bytes() > CONFIG_SPACE_SIZE {
            // nonexistent config registers read as all-ones, like a
            // master-aborted access
            return Ok(u32::MAX >> (32 - 8 * width.bytes() as u32));
        }
        let mut value = 0u32;
        for i in (0..width.bytes()).rev() {
            value = (value << 8) | slot.config[offset + i] as u32;
        }
        Ok(value)
    }

    fn config_write(
        &mut self,
        dev: DeviceCap,
        offset: u16,
        width: AccessWidth,
        value: u32,
    ) -> Result<()> {
        let slot = self.slot_mut(dev)?;
        let offset = offset as usize;
        if offset + width.bytes() > CONFIG_SPACE_SIZE {
            return Ok(());
        }
        for i in 0..width.bytes() {
            slot.config[offset + i] = (value >> (8 * i)) as u8;
        }
        Ok(())
    }

    fn request_irq(&mut self, dev: DeviceCap, notify: SignalId) -> Result<IrqCap> {
        let line = self.slot(dev)?.info.irq_line;
        if self.irq_bindings.contains_key(&line) {
            return Err(SubstrateError::IrqDenied { line });
        }
        self.irq_bindings.insert(line, notify);
        let slot = self.next_irq_slot;
        self.next_irq_slot += 1;
        Ok(IrqCap::new(slot, line))
    }

    fn release_irq(&mut self, irq: IrqCap) -> Result<()> {
        self.irq_bindings.remove(&irq.line());
        Ok(())
    }

    fn pending_irqs(&mut self) -> Vec<u32> {
        self.raised.drain(..).collect()
    }

    fn map_range(&mut self, dev: DeviceCap, index: usize, _attrs: MapAttrs) -> Result<MappedRange> {
        let range = *self
            .slot(dev)?
            .info
            .mmio
            .get(index)
            .ok_or(SubstrateError::BadResource { index })?;
        let vaddr = self.next_vaddr;
        self.next_vaddr += (range.size + 0xfff) & !0xfff;
        self.active_mappings += 1;
        Ok(MappedRange {
            vaddr,
            paddr: range.paddr,
            size: range.size,
        })
    }

    fn unmap_range(&mut self, _range: MappedRange) -> Result<()> {
        assert!(self.active_mappings > 0, "unmap without mapping");
        self.active_mappings -= 1;
        Ok(())
    }

    fn release_device(&mut self, dev: DeviceCap) -> Result<()> {
        self.slot_mut(dev)?.released = true;
        Ok(())
    }
}

impl SignalHub for MockPlatform {
    fn alloc_context(&mut self) -> Result<SignalId> {
        let id = SignalId::new(self.next_signal);
        self.next_signal += 1;
        Ok(id)
    }

    fn submit(&mut self, id: SignalId) {
        if !self.pending.contains(&id) {
            self.pending.push_back(id);
        }
    }

    fn poll(&mut self) -> Option<SignalId> {
        self.pending.pop_front()
    }
}

impl TickSource for MockPlatform {
    fn now(&self) -> Tick {
        self.now
    }

    fn arm(&mut self, deadline: Tick, notify: SignalId) {
        if elapsed(self.now, deadline) {
            self.armed = None;
            self.submit(notify);
        } else {
            self.armed = Some((deadline, notify));
        }
    }

    fn disarm(&mut self) {
        self.armed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_device_mock() -> MockPlatform {
        let mut mock = MockPlatform::new();
        mock.add_device(MockDevice::new(0x8086, 0x100e, 0x02_00_00).irq(11).mmio(0xfebc_0000, 0x2_0000));
        mock.add_device(MockDevice::new(0x1234, 0x5678, 0x0c_03_20).irq(9));
        mock
    }

    #[test]
    fn test_enumeration_order() {
        let mut mock = two_device_mock();
        let first = mock.first_device().unwrap().unwrap();
        let second = mock.next_device(first).unwrap().unwrap();
        assert_eq!(mock.next_device(second).unwrap(), None);
        assert_eq!(mock.device_info(first).unwrap().vendor_id, 0x8086);
        assert_eq!(mock.device_info(second).unwrap().vendor_id, 0x1234);
    }

    #[test]
    fn test_quota_exhaustion_and_upgrade() {
        let mut mock = two_device_mock();
        mock.quota = 0;

        let result = mock.first_device();
        assert!(matches!(
            result,
            Err(SubstrateError::QuotaExhausted { requested: ENUM_STEP_COST })
        ));

        mock.upgrade_quota(ENUM_STEP_COST).unwrap();
        assert_eq!(mock.upgrade_count(), 1);
        assert!(mock.first_device().unwrap().is_some());
        assert_eq!(mock.quota(), 0);
    }

    #[test]
    fn test_config_space_layout() {
        let mut mock = two_device_mock();
        let dev = mock.first_device().unwrap().unwrap();

        assert_eq!(mock.config_read(dev, 0x00, AccessWidth::Word).unwrap(), 0x8086);
        assert_eq!(mock.config_read(dev, 0x02, AccessWidth::Word).unwrap(), 0x100e);
        assert_eq!(
            mock.config_read(dev, 0x08, AccessWidth::Dword).unwrap() >> 8,
            0x02_00_00
        );
        assert_eq!(mock.config_read(dev, 0x3c, AccessWidth::Byte).unwrap(), 11);

        // out-of-range reads are all-ones, writes are dropped
        assert_eq!(mock.config_read(dev, 0xff, AccessWidth::Dword).unwrap(), u32::MAX);
        mock.config_write(dev, 0xff, AccessWidth::Dword, 0xdead_beef).unwrap();
    }

    #[test]
    fn test_signal_coalescing() {
        let mut mock = MockPlatform::new();
        let a = mock.alloc_context().unwrap();
        let b = mock.alloc_context().unwrap();

        mock.submit(a);
        mock.submit(a);
        mock.submit(b);

        assert_eq!(mock.poll(), Some(a));
        assert_eq!(mock.poll(), Some(b));
        assert_eq!(mock.poll(), None);
    }

    #[test]
    fn test_irq_request_and_raise() {
        let mut mock = two_device_mock();
        let dev = mock.first_device().unwrap().unwrap();
        let notify = mock.alloc_context().unwrap();

        assert!(!mock.raise_irq(11));

        let irq = mock.request_irq(dev, notify).unwrap();
        assert_eq!(irq.line(), 11);

        assert!(mock.raise_irq(11));
        assert_eq!(mock.poll(), Some(notify));
        assert_eq!(mock.pending_irqs(), [11]);
        assert!(mock.pending_irqs().is_empty());

        // the line association is exclusive
        assert!(matches!(
            mock.request_irq(dev, notify),
            Err(SubstrateError::IrqDenied { line: 11 })
        ));

        mock.release_irq(irq).unwrap();
        assert!(!mock.raise_irq(11));
    }

    #[test]
    fn test_tick_arming() {
        let mut mock = MockPlatform::new();
        let notify = mock.alloc_context().unwrap();

        mock.arm(10, notify);
        mock.advance_ticks(5);
        assert_eq!(mock.poll(), None);
        mock.advance_ticks(5);
        assert_eq!(mock.poll(), Some(notify));

        // arming in the past fires immediately
        mock.arm(3, notify);
        assert_eq!(mock.poll(), Some(notify));
    }

    #[test]
    fn test_tick_arming_across_wraparound() {
        let mut mock = MockPlatform::new().with_tick_origin(Tick::MAX - 2);
        let notify = mock.alloc_context().unwrap();

        // deadline lies beyond the wrap point
        mock.arm(1, notify);
        mock.advance_ticks(2);
        assert_eq!(mock.poll(), None);
        mock.advance_ticks(2);
        assert_eq!(mock.poll(), Some(notify));
    }

    #[test]
    fn test_release_device() {
        let mut mock = two_device_mock();
        let dev = mock.first_device().unwrap().unwrap();
        mock.release_device(dev).unwrap();
        assert!(matches!(
            mock.device_info(dev),
            Err(SubstrateError::UnknownDevice { .. })
        ));
        // enumeration skips released devices
        let first = mock.first_device().unwrap().unwrap();
        assert_eq!(mock.device_info(first).unwrap().vendor_id, 0x1234);
    }
}
