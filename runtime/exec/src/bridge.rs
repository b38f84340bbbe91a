//! Notification bridge
//!
//! Binds the component to exactly one signal context and turns deliveries
//! into scheduler wake-ups. The wake is deliberately coarse: one multiplexed
//! signal source cannot say who it was for, so every ready task re-examines
//! its condition on each delivery. `submit()` synthesizes a wake so code can
//! signal a manually completed operation without a genuine external event.

use dekit_substrate::{ExecContext, HubHandle, Result, SignalId};

#[derive(Clone)]
pub struct Bridge {
    hub: HubHandle,
    signal: SignalId,
    context: ExecContext,
}

impl Bridge {
    /// Allocate the component's signal context
    ///
    /// Constructed once by the top-level assembly; everything that needs a
    /// wake shares this instance.
    pub fn new(hub: HubHandle, context: ExecContext) -> Result<Self> {
        let signal = hub.borrow_mut().alloc_context()?;
        Ok(Self {
            hub,
            signal,
            context,
        })
    }

    /// The signal context wakes are delivered to
    ///
    /// Interrupt associations and the tick source are pointed at this id so
    /// that every external event funnels into the same broadcast.
    pub fn signal(&self) -> SignalId {
        self.signal
    }

    /// Synthesize a wake-up
    ///
    /// Legal from any context; this is the one operation the signal
    /// delivery path may perform.
    pub fn submit(&self) {
        self.hub.borrow_mut().submit(self.signal);
    }

    /// Consume the next pending wake, if any
    ///
    /// Signals for foreign contexts are not ours to handle; they are logged
    /// and dropped.
    pub fn pending_wake(&self) -> bool {
        self.context.assert_not_signal();
        loop {
            match self.hub.borrow_mut().poll() {
                None => return false,
                Some(sig) if sig == self.signal => return true,
                Some(stray) => log::warn!("dropping stray signal {}", stray.raw()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use core::cell::RefCell;
    use dekit_substrate::MockPlatform;

    #[test]
    fn test_submit_and_pending_wake() {
        let hub: HubHandle = Rc::new(RefCell::new(MockPlatform::new()));
        let bridge = Bridge::new(hub, ExecContext::new()).unwrap();

        assert!(!bridge.pending_wake());
        bridge.submit();
        bridge.submit(); // coalesces
        assert!(bridge.pending_wake());
        assert!(!bridge.pending_wake());
    }

    #[test]
    fn test_stray_signals_are_dropped() {
        let platform = Rc::new(RefCell::new(MockPlatform::new()));
        let bridge = Bridge::new(platform.clone(), ExecContext::new()).unwrap();

        {
            use dekit_substrate::SignalHub;
            let mut hub = platform.borrow_mut();
            let stray = hub.alloc_context().unwrap();
            hub.submit(stray);
        }

        assert!(!bridge.pending_wake());
        bridge.submit();
        assert!(bridge.pending_wake());
    }
}
