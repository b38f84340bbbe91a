//! Timer subsystem
//!
//! # Purpose
//! Gives ported driver code its familiar tick-based timers: arm a callback
//! for an expiry tick, delete it, query the counter. Underneath there is no
//! periodic interrupt; the subsystem keeps the pending set ordered and arms
//! the substrate's tick source for exactly the next deadline, so the
//! component sleeps until something is actually due.
//!
//! # Integration Points
//! - Depends on: dekit-substrate (tick source, signal context)
//! - Provides to: dekit-env, ported driver code
//!
//! # Architecture
//! The tick counter is polled on demand from the tick source; nothing here
//! assumes a periodic update. All expiry comparisons go through signed
//! differences so counter wraparound cannot misorder deadlines. At most one
//! entry is pending per timer identity: re-adding a pending timer updates
//! its expiry in place.
//!
//! # Testing Strategy
//! - Unit tests: dedup on re-add, deletion reporting, wraparound ordering,
//!   ascending firing
//! - Integration tests: armed-deadline wake-ups through dekit-env

#![no_std]

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use dekit_substrate::{ContextKind, ExecContext, SignalId, Tick, TickHandle};

/// Identity of a registered timer; never reused
pub type TimerId = u64;

/// Wraparound-safe "a expires before b"
///
/// Decided by the sign of the difference, never by `<`; two deadlines more
/// than half the counter range apart would compare wrongly either way, but
/// real timeouts are nowhere near that.
#[inline]
pub fn tick_before(a: Tick, b: Tick) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

/// Wraparound-safe "expiry has been reached at now"
#[inline]
pub fn tick_reached(now: Tick, expiry: Tick) -> bool {
    (now.wrapping_sub(expiry) as i64) >= 0
}

type TimerFn = Rc<RefCell<dyn FnMut()>>;

struct TimerEntry {
    expiry: Tick,
    pending: bool,
    callback: TimerFn,
}

struct TimerInner {
    entries: BTreeMap<TimerId, TimerEntry>,
    next_id: TimerId,
}

/// Shared handle to the pending-timer set
#[derive(Clone)]
pub struct Timer {
    inner: Rc<RefCell<TimerInner>>,
    tick: TickHandle,
    notify: SignalId,
    context: ExecContext,
}

impl Timer {
    /// `notify` is the signal context armed deadlines are delivered to,
    /// normally the bridge's
    pub fn new(tick: TickHandle, notify: SignalId, context: ExecContext) -> Self {
        Self {
            inner: Rc::new(RefCell::new(TimerInner {
                entries: BTreeMap::new(),
                next_id: 0,
            })),
            tick,
            notify,
            context,
        }
    }

    /// Register a timer callback; it stays inert until `add` or `schedule`
    pub fn register(&self, callback: impl FnMut() + 'static) -> TimerId {
        self.context.assert_not_signal();
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(
            id,
            TimerEntry {
                expiry: 0,
                pending: false,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        id
    }

    /// Drop a timer entirely, pending or not
    pub fn unregister(&self, id: TimerId) -> bool {
        self.context.assert_not_signal();
        self.inner.borrow_mut().entries.remove(&id).is_some()
    }

    /// Arm the timer for `expiry`
    ///
    /// Re-adding a pending timer updates its expiry in place; there is
    /// never more than one pending entry per timer.
    pub fn add(&self, id: TimerId, expiry: Tick) {
        self.context.assert_not_signal();
        let mut inner = self.inner.borrow_mut();
        match inner.entries.get_mut(&id) {
            Some(entry) => {
                entry.expiry = expiry;
                entry.pending = true;
            }
            None => log::warn!("add of unregistered timer {id}"),
        }
    }

    /// Disarm the timer; reports whether it was actually pending
    pub fn del(&self, id: TimerId) -> bool {
        self.context.assert_not_signal();
        let mut inner = self.inner.borrow_mut();
        match inner.entries.get_mut(&id) {
            Some(entry) if entry.pending => {
                entry.pending = false;
                true
            }
            _ => false,
        }
    }

    /// Arm the timer `delay` ticks from now
    pub fn schedule(&self, id: TimerId, delay: Tick) {
        let expiry = self.now().wrapping_add(delay);
        self.add(id, expiry);
    }

    pub fn pending(&self, id: TimerId) -> bool {
        self.inner
            .borrow()
            .entries
            .get(&id)
            .is_some_and(|e| e.pending)
    }

    /// Current tick counter, polled from the tick source
    pub fn now(&self) -> Tick {
        self.tick.borrow().now()
    }

    /// Earliest pending expiry, in wraparound order
    pub fn next_deadline(&self) -> Option<Tick> {
        self.inner
            .borrow()
            .entries
            .values()
            .filter(|e| e.pending)
            .map(|e| e.expiry)
            .reduce(|min, e| if tick_before(e, min) { e } else { min })
    }

    /// (Re)arm the tick source for the next deadline
    ///
    /// With nothing pending the source is disarmed; there is no periodic
    /// tick to keep alive.
    pub fn schedule_next(&self) {
        match self.next_deadline() {
            Some(deadline) => self.tick.borrow_mut().arm(deadline, self.notify),
            None => self.tick.borrow_mut().disarm(),
        }
    }

    /// Fire every entry due at the current tick, in ascending expiry order
    ///
    /// The pending flag is cleared before the callback runs, so a callback
    /// may re-arm its own timer; such a re-arm is picked up by the next
    /// wake, not fired in this pass. Callers re-arm via `schedule_next`
    /// afterwards.
    pub fn expire(&self) {
        let now = self.now();
        let mut due: Vec<(Tick, TimerId)> = {
            let inner = self.inner.borrow();
            inner
                .entries
                .iter()
                .filter(|(_, e)| e.pending && tick_reached(now, e.expiry))
                .map(|(&id, e)| (e.expiry, id))
                .collect()
        };
        due.sort_by(|a, b| {
            if a.0 == b.0 {
                a.1.cmp(&b.1)
            } else if tick_before(a.0, b.0) {
                core::cmp::Ordering::Less
            } else {
                core::cmp::Ordering::Greater
            }
        });

        for (_, id) in due {
            let callback = {
                let mut inner = self.inner.borrow_mut();
                match inner.entries.get_mut(&id) {
                    // deleted by an earlier callback in this pass
                    Some(entry) if entry.pending => {
                        entry.pending = false;
                        Some(Rc::clone(&entry.callback))
                    }
                    _ => None,
                }
            };
            if let Some(cb) = callback {
                let _guard = self.context.enter(ContextKind::Task);
                (&mut *cb.borrow_mut())();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use dekit_substrate::{MockPlatform, SignalHub};

    fn timer_on(mock: MockPlatform) -> (Timer, Rc<RefCell<MockPlatform>>) {
        let platform = Rc::new(RefCell::new(mock));
        let notify = platform.borrow_mut().alloc_context().unwrap();
        let timer = Timer::new(platform.clone(), notify, ExecContext::new());
        (timer, platform)
    }

    fn timer() -> (Timer, Rc<RefCell<MockPlatform>>) {
        timer_on(MockPlatform::new())
    }

    #[test]
    fn test_readd_updates_in_place() {
        let (timer, _) = timer();
        let id = timer.register(|| {});

        timer.add(id, 5);
        timer.add(id, 10);

        assert!(timer.pending(id));
        assert_eq!(timer.next_deadline(), Some(10));
    }

    #[test]
    fn test_del_reports_pending() {
        let (timer, _) = timer();
        let id = timer.register(|| {});

        assert!(!timer.del(id));
        timer.add(id, 5);
        assert!(timer.del(id));
        assert!(!timer.del(id));
        assert_eq!(timer.next_deadline(), None);
    }

    #[test]
    fn test_next_deadline_across_wraparound() {
        let (timer, _) = timer_on(MockPlatform::new().with_tick_origin(Tick::MAX - 10));
        let near = timer.register(|| {});
        let far = timer.register(|| {});

        // `far` lies beyond the wrap point; naive `<` would call it first
        timer.add(near, Tick::MAX - 5);
        timer.add(far, 3);

        assert_eq!(timer.next_deadline(), Some(Tick::MAX - 5));
        assert!(timer.del(near));
        assert_eq!(timer.next_deadline(), Some(3));
    }

    #[test]
    fn test_expire_fires_ascending() {
        let (timer, platform) = timer();
        let order = Rc::new(RefCell::new(alloc::vec::Vec::new()));

        let mut ids = alloc::vec::Vec::new();
        for label in ['c', 'a', 'b'] {
            let o = Rc::clone(&order);
            ids.push(timer.register(move || o.borrow_mut().push(label)));
        }
        timer.add(ids[0], 30); // c
        timer.add(ids[1], 10); // a
        timer.add(ids[2], 20); // b

        platform.borrow_mut().advance_ticks(25);
        timer.expire();

        assert_eq!(*order.borrow(), ['a', 'b']);
        assert!(timer.pending(ids[0]));
        assert!(!timer.pending(ids[1]));
    }

    #[test]
    fn test_callback_may_rearm_itself() {
        let (timer, platform) = timer();
        let runs = Rc::new(Cell::new(0));

        let id_cell = Rc::new(Cell::new(0));
        let r = Rc::clone(&runs);
        let t = timer.clone();
        let id_inner = Rc::clone(&id_cell);
        let id = timer.register(move || {
            r.set(r.get() + 1);
            t.schedule(id_inner.get(), 10);
        });
        id_cell.set(id);

        timer.schedule(id, 10);
        platform.borrow_mut().advance_ticks(10);
        timer.expire();
        assert_eq!(runs.get(), 1);
        // the re-arm is pending for the next deadline, not fired in-pass
        assert!(timer.pending(id));
        assert_eq!(timer.next_deadline(), Some(20));

        platform.borrow_mut().advance_ticks(10);
        timer.expire();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn test_schedule_next_arms_minimum() {
        let (timer, platform) = timer();
        let fired = Rc::new(Cell::new(false));

        let f = Rc::clone(&fired);
        let id = timer.register(move || f.set(true));
        timer.schedule(id, 7);
        timer.schedule_next();

        // nothing before the deadline
        platform.borrow_mut().advance_ticks(6);
        assert!(platform.borrow_mut().poll().is_none());

        platform.borrow_mut().advance_ticks(1);
        assert!(platform.borrow_mut().poll().is_some());
        timer.expire();
        assert!(fired.get());
    }

    #[test]
    fn test_schedule_next_disarms_when_idle() {
        let (timer, platform) = timer();
        let id = timer.register(|| {});
        timer.schedule(id, 5);
        timer.schedule_next();
        timer.del(id);
        timer.schedule_next();

        platform.borrow_mut().advance_ticks(10);
        assert!(platform.borrow_mut().poll().is_none());
    }

    #[test]
    fn test_callback_deleting_later_entry() {
        let (timer, platform) = timer();
        let victim_ran = Rc::new(Cell::new(false));

        let ids = Rc::new(Cell::new(0));
        let t = timer.clone();
        let ids2 = Rc::clone(&ids);
        let killer = timer.register(move || {
            t.del(ids2.get());
        });
        let v = Rc::clone(&victim_ran);
        let victim = timer.register(move || v.set(true));
        ids.set(victim);

        timer.add(killer, 5);
        timer.add(victim, 6);
        platform.borrow_mut().advance_ticks(10);
        timer.expire();

        assert!(!victim_ran.get());
    }
}
