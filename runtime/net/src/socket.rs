//! Generic socket objects and their wait queues
//!
//! A socket always carries a wait-queue handle; waiters parked on it are
//! woken through the bridge's coarse broadcast, so the wake hook is wired
//! up by the assembly layer. Sockets are destroyed by explicit free, which
//! returns the wait-queue slot to the pool.

use alloc::rc::Rc;

use crate::{NetError, Result, MAX_WAIT_QUEUES};

/// Socket type, numbered the way ported code passes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SockType {
    Stream = 1,
    Datagram = 2,
    Raw = 3,
    Seqpacket = 5,
}

impl SockType {
    /// Validate a raw type value from ported code
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            1 => Ok(SockType::Stream),
            2 => Ok(SockType::Datagram),
            3 => Ok(SockType::Raw),
            5 => Ok(SockType::Seqpacket),
            _ => Err(NetError::InvalidType { raw }),
        }
    }
}

/// Protocol state of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockState {
    Idle,
    Listening,
    Connected,
    /// The peer initiated a shutdown; blocking calls must give up
    ClosePending,
}

/// Handle to one slot of the wait-queue pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitQueueId(usize);

impl WaitQueueId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Bounded pool of wait-queue slots
///
/// The pool exists so socket allocation has a genuinely fallible second
/// step; waking a queue funnels into the bridge broadcast through the hook.
pub(crate) struct WaitQueuePool {
    occupied: [bool; MAX_WAIT_QUEUES],
    in_use: usize,
    wake_hook: Option<Rc<dyn Fn()>>,
}

impl WaitQueuePool {
    pub(crate) fn new() -> Self {
        Self {
            occupied: [false; MAX_WAIT_QUEUES],
            in_use: 0,
            wake_hook: None,
        }
    }

    pub(crate) fn set_wake_hook(&mut self, hook: Rc<dyn Fn()>) {
        self.wake_hook = Some(hook);
    }

    pub(crate) fn alloc(&mut self) -> Result<WaitQueueId> {
        match self.occupied.iter().position(|used| !used) {
            Some(index) => {
                self.occupied[index] = true;
                self.in_use += 1;
                Ok(WaitQueueId(index))
            }
            None => Err(NetError::OutOfWaitQueues {
                capacity: MAX_WAIT_QUEUES,
            }),
        }
    }

    pub(crate) fn free(&mut self, id: WaitQueueId) {
        assert!(self.occupied[id.0], "double free of wait queue slot");
        self.occupied[id.0] = false;
        self.in_use -= 1;
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }

    pub(crate) fn wake(&self, _id: WaitQueueId) {
        if let Some(hook) = &self.wake_hook {
            (**hook)();
        }
    }
}

/// Generic socket object
///
/// Created by a family constructor through the registry, destroyed by
/// explicit free; never reachable half-constructed.
#[derive(Debug, PartialEq, Eq)]
pub struct Socket {
    stype: SockType,
    pub state: SockState,
    pub protocol: u32,
    wq: WaitQueueId,
}

impl Socket {
    pub(crate) fn new(stype: SockType, wq: WaitQueueId) -> Self {
        Self {
            stype,
            state: SockState::Idle,
            protocol: 0,
            wq,
        }
    }

    pub fn stype(&self) -> SockType {
        self.stype
    }

    pub fn wait_queue(&self) -> WaitQueueId {
        self.wq
    }

    pub fn shutdown_pending(&self) -> bool {
        self.state == SockState::ClosePending
    }

    /// Gate for blocking operations
    pub fn check_state(&self) -> Result<()> {
        if self.shutdown_pending() {
            return Err(NetError::ShutdownPending);
        }
        Ok(())
    }
}
