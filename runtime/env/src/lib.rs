//! Driver environment assembly
//!
//! # Purpose
//! Owns one explicitly constructed instance of every runtime subsystem and
//! runs the wake loop that stitches them together. There are no lazily
//! initialized singletons anywhere: construction order is what the
//! constructor says, and tests build as many isolated environments as they
//! like.
//!
//! # Integration Points
//! - Depends on: every dekit runtime crate
//! - Provides to: ported driver code (the full call surface)
//!
//! # Architecture
//! All external events funnel into the bridge's single signal context:
//! interrupt associations and the armed tick deadline both deliver there.
//! One wake then runs, in order: raised interrupt handlers, due timers, the
//! broadcast task dispatch, the work-queue drain, and the re-arm of the
//! next timer deadline. Everything happens on one logical thread; no two
//! driver callbacks ever overlap.
//!
//! # Testing Strategy
//! - Integration tests: whole-stack flows on the mock substrate
//!   (enumeration with quota failures, wildcard binding, interrupts,
//!   timers, deferred work, sockets)

#![no_std]

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use core::cell::RefCell;

use thiserror::Error;

pub use dekit_bus::{
    find_match, BoundDevice, BusDriver, BusError, BusRegistry, CommandFlags, DeviceHandle,
    DeviceList, DriverHandle, IdTableEntry, IrqDispatch, ANY_DEVICE,
};
pub use dekit_exec::{Bridge, Scheduler, TaskId, TaskOutcome, WorkId, WorkKind, WorkQueue};
pub use dekit_net::{
    FamilyCtor, FamilyId, NetError, ProtocolTable, SockState, SockType, Socket, WaitQueueId,
};
pub use dekit_substrate::{
    BusHandle, DeviceCap, ExecContext, HubHandle, MapAttrs, MappedRange, PlatformBus, SignalHub,
    SubstrateError, Tick, TickHandle, TickSource,
};
pub use dekit_timer::{Timer, TimerId};

/// Error types for environment assembly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnvError {
    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

pub type Result<T> = core::result::Result<T, EnvError>;

/// The assembled driver environment
///
/// Construction enumerates the brokered devices once and wires every
/// subsystem to the bridge's signal context. Driver-facing handles are
/// cheap clones; closures capture what they need.
pub struct DriverEnv {
    context: ExecContext,
    bridge: Bridge,
    sched: Scheduler,
    work: WorkQueue,
    timer: Timer,
    devices: DeviceList,
    registry: BusRegistry,
    irq: IrqDispatch,
    net: ProtocolTable,
    delayed: RefCell<BTreeMap<WorkId, TimerId>>,
}

impl DriverEnv {
    pub fn new(bus: BusHandle, hub: HubHandle, tick: TickHandle) -> Result<Self> {
        let context = ExecContext::new();

        let bridge = Bridge::new(hub, context.clone())?;
        let sched = Scheduler::new(context.clone());
        let work = WorkQueue::new(context.clone());
        let timer = Timer::new(tick, bridge.signal(), context.clone());

        let devices = DeviceList::enumerate(&bus)?;
        let registry = BusRegistry::new(bus.clone(), context.clone());
        let irq = IrqDispatch::new(bus, bridge.signal(), context.clone());

        let net = ProtocolTable::new(context.clone());
        let wake_bridge = bridge.clone();
        net.set_wake_hook(Rc::new(move || wake_bridge.submit()));

        log::debug!("driver environment up, {} devices enumerated", devices.len());

        Ok(Self {
            context,
            bridge,
            sched,
            work,
            timer,
            devices,
            registry,
            irq,
            net,
            delayed: RefCell::new(BTreeMap::new()),
        })
    }

    /// Assemble on one platform object implementing all three substrate
    /// traits, the usual shape of both the real glue and the mock
    pub fn with_platform<P>(platform: Rc<RefCell<P>>) -> Result<Self>
    where
        P: PlatformBus + SignalHub + TickSource + 'static,
    {
        let bus: BusHandle = platform.clone();
        let hub: HubHandle = platform.clone();
        let tick: TickHandle = platform;
        Self::new(bus, hub, tick)
    }

    pub fn context(&self) -> ExecContext {
        self.context.clone()
    }

    pub fn bridge(&self) -> Bridge {
        self.bridge.clone()
    }

    pub fn tasks(&self) -> Scheduler {
        self.sched.clone()
    }

    pub fn work(&self) -> WorkQueue {
        self.work.clone()
    }

    pub fn timer(&self) -> Timer {
        self.timer.clone()
    }

    pub fn registry(&self) -> BusRegistry {
        self.registry.clone()
    }

    pub fn irq_dispatch(&self) -> IrqDispatch {
        self.irq.clone()
    }

    pub fn net(&self) -> ProtocolTable {
        self.net.clone()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Spawn a task and kick a wake so it runs
    pub fn spawn(&self, entry: impl FnMut() -> TaskOutcome + 'static) -> TaskId {
        let id = self.sched.spawn(entry);
        self.bridge.submit();
        id
    }

    /// Match a driver against the enumerated devices; see
    /// `BusRegistry::register_driver`
    pub fn register_driver(&self, driver: DriverHandle) -> Result<bool> {
        Ok(self.registry.register_driver(driver, &self.devices)?)
    }

    /// Claim an interrupt line for a handler; the line must belong to a
    /// bound device
    pub fn request_irq(&self, line: u32, handler: impl FnMut() + 'static) -> Result<()> {
        Ok(self.irq.request_irq(&self.registry, line, handler)?)
    }

    pub fn release_irq(&self, line: u32) -> Result<()> {
        Ok(self.irq.release_irq(line)?)
    }

    /// Reverse lookup of a bound device from the capability a driver holds
    pub fn device(&self, cap: DeviceCap) -> Option<DeviceHandle> {
        self.registry.lookup(cap)
    }

    fn bound(&self, cap: DeviceCap) -> Result<DeviceHandle> {
        self.registry
            .lookup(cap)
            .ok_or(EnvError::Bus(BusError::NotBound { slot: cap.slot() }))
    }

    pub fn config_read8(&self, cap: DeviceCap, offset: u16) -> Result<u8> {
        Ok(self.bound(cap)?.borrow().config_read8(offset)?)
    }

    pub fn config_read16(&self, cap: DeviceCap, offset: u16) -> Result<u16> {
        Ok(self.bound(cap)?.borrow().config_read16(offset)?)
    }

    pub fn config_read32(&self, cap: DeviceCap, offset: u16) -> Result<u32> {
        Ok(self.bound(cap)?.borrow().config_read32(offset)?)
    }

    pub fn config_write8(&self, cap: DeviceCap, offset: u16, value: u8) -> Result<()> {
        Ok(self.bound(cap)?.borrow().config_write8(offset, value)?)
    }

    pub fn config_write16(&self, cap: DeviceCap, offset: u16, value: u16) -> Result<()> {
        Ok(self.bound(cap)?.borrow().config_write16(offset, value)?)
    }

    pub fn config_write32(&self, cap: DeviceCap, offset: u16, value: u32) -> Result<()> {
        Ok(self.bound(cap)?.borrow().config_write32(offset, value)?)
    }

    /// Map a claimed device's memory resource locally
    pub fn map_resource(&self, cap: DeviceCap, index: usize) -> Result<MappedRange> {
        Ok(self.bound(cap)?.borrow_mut().map_resource(index)?)
    }

    /// Elapsed ticks of the timeout session
    pub fn ticks(&self) -> Tick {
        self.timer.now()
    }

    /// Enqueue a registered work item; drained at the next wake
    pub fn schedule_work(&self, work: WorkId) -> bool {
        self.work.schedule(work)
    }

    /// Enqueue a registered work item `delay` ticks from now
    ///
    /// The expiry is carried by a timer owned by the environment; the wake
    /// that fires it also drains the queue.
    pub fn schedule_delayed_work(&self, work: WorkId, delay: Tick) {
        let timer_id = {
            let mut delayed = self.delayed.borrow_mut();
            match delayed.get(&work) {
                Some(&id) => id,
                None => {
                    let queue = self.work.clone();
                    let id = self.timer.register(move || {
                        queue.schedule(work);
                    });
                    delayed.insert(work, id);
                    id
                }
            }
        };
        self.timer.schedule(timer_id, delay);
        self.timer.schedule_next();
    }

    /// Handle one wake of the bridge's signal context
    ///
    /// Order matters: interrupt handlers first (they arm timers and enqueue
    /// work), then due timers, then the broadcast dispatch, then the work
    /// drain, and finally the re-arm of the next deadline.
    pub fn handle_wake(&self) {
        self.irq.dispatch_raised();
        self.timer.expire();
        self.sched.dispatch_all();
        self.work.drain();
        self.timer.schedule_next();
    }

    /// Consume one pending wake, if any
    pub fn run_once(&self) -> bool {
        if self.bridge.pending_wake() {
            self.handle_wake();
            return true;
        }
        false
    }

    /// Drain wakes until the signal channel is quiet
    ///
    /// Test harness entry; the production loop blocks on the hub instead of
    /// returning.
    pub fn run_until_idle(&self) {
        while self.run_once() {}
    }
}
