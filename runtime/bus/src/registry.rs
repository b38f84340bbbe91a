//! Device enumeration and driver binding
//!
//! The broker enumerates lazily through a first/next cursor and charges
//! every step against the session quota. A step that fails with quota
//! exhaustion is recovered by exactly one upgrade request followed by one
//! retry of the same step, looping until it succeeds or fails differently.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use dekit_substrate::{
    BusHandle, DeviceCap, ExecContext, PlatformBus, SubstrateError,
};

use crate::device::BoundDevice;
use crate::ident::{find_match, IdTableEntry};
use crate::{BusError, Result};

/// A driver for bus devices, ported payload code behind this trait
pub trait BusDriver {
    fn name(&self) -> &'static str;

    /// Ordered match table; a driver without one cannot be registered
    fn id_table(&self) -> &[IdTableEntry];

    /// Take over a matched device
    ///
    /// The device is registered by capability before probe runs; inside
    /// probe, access it through the argument rather than through lookup.
    /// An error reverts the binding and enumeration continues.
    fn probe(&mut self, dev: &mut BoundDevice, matched: &IdTableEntry) -> Result<()>;

    /// Undo a successful probe; called on unbind
    fn remove(&mut self, _dev: &mut BoundDevice) {}
}

pub type DriverHandle = Rc<RefCell<dyn BusDriver>>;
pub type DeviceHandle = Rc<RefCell<BoundDevice>>;

/// Retry `attempt` across quota exhaustion: one upgrade request and one
/// retry of the same step per failure
fn retry_quota<T>(
    bus: &mut dyn PlatformBus,
    mut attempt: impl FnMut(&mut dyn PlatformBus) -> dekit_substrate::Result<T>,
) -> dekit_substrate::Result<T> {
    loop {
        match attempt(bus) {
            Err(SubstrateError::QuotaExhausted { requested }) => {
                log::debug!("enumeration step exceeded session quota, upgrading by {requested}");
                bus.upgrade_quota(requested)?;
            }
            other => return other,
        }
    }
}

/// Devices of the brokered session, in enumeration order
pub struct DeviceList {
    caps: Vec<DeviceCap>,
}

impl DeviceList {
    /// Walk the broker's cursor once, upgrading quota on demand
    pub fn enumerate(bus: &BusHandle) -> Result<Self> {
        let mut bus = bus.borrow_mut();
        let mut caps = Vec::new();

        let mut cursor = retry_quota(&mut *bus, |b| b.first_device())?;
        while let Some(cap) = cursor {
            caps.push(cap);
            cursor = retry_quota(&mut *bus, |b| b.next_device(cap))?;
        }

        log::info!("enumerated {} bus devices", caps.len());
        Ok(Self { caps })
    }

    pub fn iter(&self) -> impl Iterator<Item = DeviceCap> + '_ {
        self.caps.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }
}

struct BoundEntry {
    cap: DeviceCap,
    dev: DeviceHandle,
    driver: DriverHandle,
}

struct RegistryInner {
    bound: Vec<BoundEntry>,
    fixup: Option<fn(&mut BoundDevice)>,
}

/// Registry of bound devices, keyed by capability
#[derive(Clone)]
pub struct BusRegistry {
    inner: Rc<RefCell<RegistryInner>>,
    bus: BusHandle,
    context: ExecContext,
}

impl BusRegistry {
    pub fn new(bus: BusHandle, context: ExecContext) -> Self {
        Self {
            inner: Rc::new(RefCell::new(RegistryInner {
                bound: Vec::new(),
                fixup: None,
            })),
            bus,
            context,
        }
    }

    /// Install the pre-probe fixup hook, run on every wrapper before its
    /// driver's probe (quirk handling, e.g. firmware handoff)
    pub fn set_fixup(&self, fixup: fn(&mut BoundDevice)) {
        self.inner.borrow_mut().fixup = Some(fixup);
    }

    /// Match `driver` against every enumerated device and bind the hits
    ///
    /// A single driver may claim several device instances. Returns whether
    /// at least one device was claimed; a probe failure reverts that
    /// binding and enumeration continues.
    pub fn register_driver(&self, driver: DriverHandle, devices: &DeviceList) -> Result<bool> {
        self.context.assert_not_signal();

        if driver.borrow().id_table().is_empty() {
            return Err(BusError::NoIdTable);
        }

        let mut claimed = false;
        for cap in devices.iter() {
            if self.lookup(cap).is_some() {
                continue;
            }

            let info = match self.bus.borrow().device_info(cap) {
                Ok(info) => info,
                Err(err) => {
                    log::debug!("skipping device slot {}: {err}", cap.slot());
                    continue;
                }
            };

            let matched = {
                let driver = driver.borrow();
                find_match(driver.id_table(), &info).copied()
            };
            let Some(entry) = matched else { continue };

            // register by capability before probing, so reverse lookup
            // works for everyone else from here on
            let handle: DeviceHandle =
                Rc::new(RefCell::new(BoundDevice::new(cap, info, self.bus.clone())));
            self.inner.borrow_mut().bound.push(BoundEntry {
                cap,
                dev: Rc::clone(&handle),
                driver: Rc::clone(&driver),
            });

            let fixup = self.inner.borrow().fixup;
            if let Some(fixup) = fixup {
                fixup(&mut handle.borrow_mut());
            }

            let probed = driver.borrow_mut().probe(&mut handle.borrow_mut(), &entry);
            match probed {
                Ok(()) => {
                    log::info!(
                        "{}: bound device {:04x}:{:04x}",
                        driver.borrow().name(),
                        handle.borrow().vendor_id(),
                        handle.borrow().device_id(),
                    );
                    claimed = true;
                }
                Err(err) => {
                    log::warn!("{}: probe failed: {err}", driver.borrow().name());
                    self.inner.borrow_mut().bound.retain(|e| e.cap != cap);
                    // wrapper is destroyed, the capability stays with the
                    // enumeration list
                    handle.borrow_mut().unmap_all();
                }
            }
        }

        Ok(claimed)
    }

    /// Resolve a bound device from its capability
    pub fn lookup(&self, cap: DeviceCap) -> Option<DeviceHandle> {
        self.inner
            .borrow()
            .bound
            .iter()
            .find(|e| e.cap == cap)
            .map(|e| Rc::clone(&e.dev))
    }

    /// First bound device owning `line`
    pub fn by_irq_line(&self, line: u32) -> Option<DeviceHandle> {
        self.inner
            .borrow()
            .bound
            .iter()
            .find(|e| e.dev.borrow().irq_line() == line)
            .map(|e| Rc::clone(&e.dev))
    }

    pub fn bound_count(&self) -> usize {
        self.inner.borrow().bound.len()
    }

    /// Tear down a binding: the driver's `remove` runs, then the wrapper
    /// releases its capability back to the broker
    pub fn unbind(&self, cap: DeviceCap) -> bool {
        self.context.assert_not_signal();
        let entry = {
            let mut inner = self.inner.borrow_mut();
            match inner.bound.iter().position(|e| e.cap == cap) {
                Some(index) => inner.bound.swap_remove(index),
                None => return false,
            }
        };
        entry.driver.borrow_mut().remove(&mut entry.dev.borrow_mut());
        if let Err(err) = entry.dev.borrow_mut().release() {
            log::warn!("release of device slot {} failed: {err}", cap.slot());
        }
        true
    }
}
