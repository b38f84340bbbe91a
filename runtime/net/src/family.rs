//! Protocol-family table and socket creation
//!
//! Families register once under a small bounded integer id and are never
//! removed. Creation validates the request, allocates the generic socket
//! plus wait queue, then hands the socket to the family's constructor; a
//! constructor error is propagated verbatim and the allocation is undone.

use alloc::rc::Rc;
use core::cell::RefCell;

use dekit_substrate::ExecContext;

use crate::socket::{SockType, Socket, WaitQueueId, WaitQueuePool};
use crate::{NetError, Result, MAX_FAMILIES};

/// Small bounded integer id of a protocol family
pub type FamilyId = usize;

/// Socket constructor a family registers
///
/// Fills in the protocol side of a freshly allocated socket; its error is
/// handed to the caller of `create` unmodified.
pub type FamilyCtor = Rc<dyn Fn(&mut Socket, u32) -> Result<()>>;

struct TableInner {
    families: [Option<FamilyCtor>; MAX_FAMILIES],
    wait_queues: WaitQueuePool,
}

/// Fixed-capacity protocol registry and socket factory
#[derive(Clone)]
pub struct ProtocolTable {
    inner: Rc<RefCell<TableInner>>,
    context: ExecContext,
}

impl ProtocolTable {
    pub fn new(context: ExecContext) -> Self {
        Self {
            inner: Rc::new(RefCell::new(TableInner {
                families: core::array::from_fn(|_| None),
                wait_queues: WaitQueuePool::new(),
            })),
            context,
        }
    }

    /// Wire wait-queue wake-ups into the bridge broadcast
    pub fn set_wake_hook(&self, hook: Rc<dyn Fn()>) {
        self.inner.borrow_mut().wait_queues.set_wake_hook(hook);
    }

    /// Register `ctor` under `family`
    ///
    /// An out-of-range id fails without mutating the table. Families are
    /// never removed; re-registration replaces the constructor.
    pub fn register_family(&self, family: FamilyId, ctor: FamilyCtor) -> Result<()> {
        self.context.assert_not_signal();
        if family >= MAX_FAMILIES {
            log::error!("protocol family {family} >= capacity {MAX_FAMILIES}");
            return Err(NetError::FamilyOutOfRange {
                family,
                capacity: MAX_FAMILIES,
            });
        }
        let mut inner = self.inner.borrow_mut();
        if inner.families[family].is_some() {
            log::warn!("protocol family {family} re-registered");
        }
        inner.families[family] = Some(ctor);
        log::info!("registered protocol family {family}");
        Ok(())
    }

    /// Families live for the component's lifetime; the call exists for
    /// ported teardown paths and reports the stub outcome
    pub fn unregister_family(&self, family: FamilyId) -> Result<()> {
        self.context.assert_not_signal();
        if family >= MAX_FAMILIES {
            return Err(NetError::FamilyOutOfRange {
                family,
                capacity: MAX_FAMILIES,
            });
        }
        Err(NetError::NotSupported)
    }

    pub fn family_count(&self) -> usize {
        self.inner
            .borrow()
            .families
            .iter()
            .filter(|f| f.is_some())
            .count()
    }

    /// Wait-queue slots currently owned by live sockets
    pub fn wait_queue_count(&self) -> usize {
        self.inner.borrow().wait_queues.in_use()
    }

    /// Wake the waiters parked on `wq`
    pub fn wake(&self, wq: WaitQueueId) {
        self.inner.borrow().wait_queues.wake(wq);
    }

    /// Allocate a generic socket and its wait queue as one transaction
    fn sock_alloc(&self, stype: SockType) -> Result<Socket> {
        let mut inner = self.inner.borrow_mut();
        let wq = inner.wait_queues.alloc()?;
        Ok(Socket::new(stype, wq))
    }

    /// Create a socket through the family's registered constructor
    ///
    /// Family and type are validated before dispatch; the constructor's
    /// error comes back unmodified, with the fresh allocation undone.
    pub fn create(&self, family: FamilyId, stype: SockType, protocol: u32) -> Result<Socket> {
        self.context.assert_not_signal();
        if family >= MAX_FAMILIES {
            return Err(NetError::FamilyOutOfRange {
                family,
                capacity: MAX_FAMILIES,
            });
        }
        let ctor = self.inner.borrow().families[family]
            .clone()
            .ok_or(NetError::UnknownFamily { family })?;

        let mut sock = self.sock_alloc(stype)?;
        sock.protocol = protocol;
        if let Err(err) = (*ctor)(&mut sock, protocol) {
            self.free(sock);
            return Err(err);
        }
        Ok(sock)
    }

    /// `create` for ported code that passes the socket type as a raw value
    pub fn create_raw(&self, family: FamilyId, raw_type: u32, protocol: u32) -> Result<Socket> {
        let stype = SockType::from_raw(raw_type)?;
        self.create(family, stype, protocol)
    }

    /// Allocate a bare socket without family dispatch, for endpoints the
    /// stack builds internally
    pub fn create_lite(&self, stype: SockType) -> Result<Socket> {
        self.context.assert_not_signal();
        self.sock_alloc(stype)
    }

    /// Destroy a socket and return its wait-queue slot
    pub fn free(&self, sock: Socket) {
        self.inner
            .borrow_mut()
            .wait_queues
            .free(sock.wait_queue());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    fn table() -> ProtocolTable {
        ProtocolTable::new(ExecContext::new())
    }

    fn ok_ctor() -> FamilyCtor {
        Rc::new(|sock, _proto| {
            sock.state = crate::SockState::Idle;
            Ok(())
        })
    }

    #[test]
    fn test_out_of_range_registration_leaves_table_unchanged() {
        let table = table();
        table.register_family(2, ok_ctor()).unwrap();

        let result = table.register_family(MAX_FAMILIES, ok_ctor());
        assert_eq!(
            result,
            Err(NetError::FamilyOutOfRange {
                family: MAX_FAMILIES,
                capacity: MAX_FAMILIES
            })
        );
        assert_eq!(table.family_count(), 1);
    }

    #[test]
    fn test_unregister_is_a_stub() {
        let table = table();
        table.register_family(2, ok_ctor()).unwrap();

        assert_eq!(table.unregister_family(2), Err(NetError::NotSupported));
        assert_eq!(table.family_count(), 1);
    }

    #[test]
    fn test_create_through_registered_family() {
        let table = table();
        table.register_family(2, ok_ctor()).unwrap();

        let sock = table.create(2, SockType::Stream, 6).unwrap();
        assert_eq!(sock.stype(), SockType::Stream);
        assert_eq!(sock.protocol, 6);
        assert_eq!(table.wait_queue_count(), 1);

        table.free(sock);
        assert_eq!(table.wait_queue_count(), 0);
    }

    #[test]
    fn test_unknown_family_leaves_no_allocation() {
        let table = table();
        for _ in 0..8 {
            assert_eq!(
                table.create(3, SockType::Datagram, 0),
                Err(NetError::UnknownFamily { family: 3 })
            );
        }
        assert_eq!(table.wait_queue_count(), 0);
    }

    #[test]
    fn test_constructor_error_propagates_verbatim_and_rolls_back() {
        let table = table();
        let calls = Rc::new(Cell::new(0));

        let c = Rc::clone(&calls);
        table
            .register_family(
                4,
                Rc::new(move |_sock, _proto| {
                    c.set(c.get() + 1);
                    Err(NetError::Protocol("address family blackholed"))
                }),
            )
            .unwrap();

        for _ in 0..8 {
            assert_eq!(
                table.create(4, SockType::Raw, 0),
                Err(NetError::Protocol("address family blackholed"))
            );
        }
        assert_eq!(calls.get(), 8);
        assert_eq!(table.wait_queue_count(), 0);
    }

    #[test]
    fn test_create_raw_validates_type_first() {
        let table = table();
        table.register_family(2, ok_ctor()).unwrap();

        assert_eq!(
            table.create_raw(2, 7, 0),
            Err(NetError::InvalidType { raw: 7 })
        );
        let sock = table.create_raw(2, 2, 17).unwrap();
        assert_eq!(sock.stype(), SockType::Datagram);
        table.free(sock);
    }

    #[test]
    fn test_create_lite_skips_dispatch() {
        let table = table();
        let sock = table.create_lite(SockType::Stream).unwrap();
        assert_eq!(table.wait_queue_count(), 1);
        table.free(sock);
    }

    #[test]
    fn test_wake_hook_fires() {
        let table = table();
        let woken = Rc::new(Cell::new(0));

        let w = Rc::clone(&woken);
        table.set_wake_hook(Rc::new(move || w.set(w.get() + 1)));

        let sock = table.create_lite(SockType::Datagram).unwrap();
        table.wake(sock.wait_queue());
        table.wake(sock.wait_queue());
        assert_eq!(woken.get(), 2);
        table.free(sock);
    }
}
