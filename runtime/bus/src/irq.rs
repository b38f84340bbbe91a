//! Interrupt dispatch
//!
//! A driver requests an interrupt by line number. The line must belong to a
//! device that is already bound; the bound wrappers are linear-scanned for
//! the owner, then the broker's interrupt capability is obtained with signal
//! delivery pointed at the bridge's context. Raised lines are drained at
//! each wake and their handlers run from the dispatch context, never from
//! the signal path.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use core::cell::RefCell;

use dekit_substrate::{BusHandle, ContextKind, ExecContext, IrqCap, SignalId};

use crate::registry::BusRegistry;
use crate::{BusError, Result};

type IrqFn = Rc<RefCell<dyn FnMut()>>;

struct IrqBinding {
    cap: IrqCap,
    handler: IrqFn,
}

struct IrqInner {
    lines: BTreeMap<u32, IrqBinding>,
}

/// Interrupt-line to handler association
#[derive(Clone)]
pub struct IrqDispatch {
    inner: Rc<RefCell<IrqInner>>,
    bus: BusHandle,
    notify: SignalId,
    context: ExecContext,
}

impl IrqDispatch {
    /// `notify` is where interrupt signals are delivered, normally the
    /// bridge's context
    pub fn new(bus: BusHandle, notify: SignalId, context: ExecContext) -> Self {
        Self {
            inner: Rc::new(RefCell::new(IrqInner {
                lines: BTreeMap::new(),
            })),
            bus,
            notify,
            context,
        }
    }

    /// Claim `line` and associate `handler` with it
    ///
    /// Fails with `DeviceNotFound` when no bound device owns the line; no
    /// registration side effect happens in that case.
    pub fn request_irq(
        &self,
        registry: &BusRegistry,
        line: u32,
        handler: impl FnMut() + 'static,
    ) -> Result<()> {
        self.context.assert_not_signal();

        if self.inner.borrow().lines.contains_key(&line) {
            return Err(BusError::LineBusy { line });
        }

        let dev = registry
            .by_irq_line(line)
            .ok_or(BusError::DeviceNotFound { line })?;
        let cap = dev.borrow().cap();

        let irq = self.bus.borrow_mut().request_irq(cap, self.notify)?;
        self.inner.borrow_mut().lines.insert(
            line,
            IrqBinding {
                cap: irq,
                handler: Rc::new(RefCell::new(handler)),
            },
        );
        log::debug!("interrupt line {line} claimed");
        Ok(())
    }

    /// Drop the handler association and give the capability back
    pub fn release_irq(&self, line: u32) -> Result<()> {
        self.context.assert_not_signal();
        let binding = self
            .inner
            .borrow_mut()
            .lines
            .remove(&line)
            .ok_or(BusError::NoHandler { line })?;
        self.bus.borrow_mut().release_irq(binding.cap)?;
        Ok(())
    }

    pub fn handler_count(&self) -> usize {
        self.inner.borrow().lines.len()
    }

    /// Run the handler of every line raised since the last wake
    ///
    /// Handlers execute synchronously under the dispatch context, one after
    /// the other; the mutual-exclusion invariant holds throughout.
    pub fn dispatch_raised(&self) {
        let raised = self.bus.borrow_mut().pending_irqs();
        for line in raised {
            let handler = self
                .inner
                .borrow()
                .lines
                .get(&line)
                .map(|b| Rc::clone(&b.handler));
            match handler {
                Some(handler) => {
                    let _guard = self.context.enter(ContextKind::Task);
                    (&mut *handler.borrow_mut())();
                }
                // released after the signal was already in flight
                None => log::debug!("interrupt on line {line} without handler"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::IdTableEntry;
    use crate::registry::{BusDriver, DeviceList};
    use crate::device::BoundDevice;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::cell::Cell;
    use dekit_substrate::{MockDevice, MockPlatform, SignalHub};

    struct ClaimAll {
        table: Vec<IdTableEntry>,
    }

    impl BusDriver for ClaimAll {
        fn name(&self) -> &'static str {
            "claim-all"
        }
        fn id_table(&self) -> &[IdTableEntry] {
            &self.table
        }
        fn probe(&mut self, _dev: &mut BoundDevice, _matched: &IdTableEntry) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        platform: Rc<RefCell<MockPlatform>>,
        registry: BusRegistry,
        irq: IrqDispatch,
    }

    fn fixture() -> Fixture {
        let mut mock = MockPlatform::new();
        mock.add_device(MockDevice::new(0x8086, 0x100e, 0x02_00_00).irq(11));
        let platform = Rc::new(RefCell::new(mock));
        let notify = platform.borrow_mut().alloc_context().unwrap();

        let context = ExecContext::new();
        let registry = BusRegistry::new(platform.clone(), context.clone());
        let irq = IrqDispatch::new(platform.clone(), notify, context);

        let handle: BusHandle = platform.clone();
        let devices = DeviceList::enumerate(&handle).unwrap();
        let driver = Rc::new(RefCell::new(ClaimAll {
            table: vec![IdTableEntry::exact(0x8086, 0x100e)],
        }));
        registry.register_driver(driver, &devices).unwrap();

        Fixture {
            platform,
            registry,
            irq,
        }
    }

    #[test]
    fn test_unowned_line_is_rejected_without_side_effect() {
        let f = fixture();

        let result = f.irq.request_irq(&f.registry, 42, || {});
        assert_eq!(result, Err(BusError::DeviceNotFound { line: 42 }));
        assert_eq!(f.irq.handler_count(), 0);
        assert_eq!(f.platform.borrow().irq_binding_count(), 0);
    }

    #[test]
    fn test_request_dispatch_release() {
        let f = fixture();
        let hits = Rc::new(Cell::new(0));

        let h = Rc::clone(&hits);
        f.irq
            .request_irq(&f.registry, 11, move || h.set(h.get() + 1))
            .unwrap();
        assert_eq!(f.irq.handler_count(), 1);

        f.platform.borrow_mut().raise_irq(11);
        f.irq.dispatch_raised();
        assert_eq!(hits.get(), 1);

        // nothing pending: dispatch is a no-op
        f.irq.dispatch_raised();
        assert_eq!(hits.get(), 1);

        f.irq.release_irq(11).unwrap();
        assert_eq!(f.platform.borrow().irq_binding_count(), 0);
        assert!(!f.platform.borrow_mut().raise_irq(11));
    }

    #[test]
    fn test_double_request_is_rejected() {
        let f = fixture();
        f.irq.request_irq(&f.registry, 11, || {}).unwrap();
        assert_eq!(
            f.irq.request_irq(&f.registry, 11, || {}),
            Err(BusError::LineBusy { line: 11 })
        );
    }

    #[test]
    fn test_release_without_request() {
        let f = fixture();
        assert_eq!(f.irq.release_irq(11), Err(BusError::NoHandler { line: 11 }));
    }
}
