//! Asynchronous signal channel
//!
//! The substrate delivers exactly one kind of asynchronous event: a signal to
//! a previously allocated context. Deliveries to the same context coalesce;
//! a context is either pending or not, there is no count.

use crate::Result;

/// Identifier of one allocated signal context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalId(u32);

impl SignalId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// The component's single multiplexed signal channel
pub trait SignalHub {
    /// Allocate a fresh signal context
    fn alloc_context(&mut self) -> Result<SignalId>;

    /// Raise a signal on `id`
    ///
    /// This is the only substrate operation that is legal from the signal
    /// delivery path itself; it never touches runtime state.
    fn submit(&mut self, id: SignalId);

    /// Dequeue the next delivered signal, if any
    fn poll(&mut self) -> Option<SignalId>;
}
