//! Deferred work queue
//!
//! One FIFO for all deferred-work flavors a monolithic kernel knows: plain
//! work, delayed work (armed through the timer by the assembly layer) and
//! tasklets. Scheduling is idempotent through the per-item pending flag.
//! The drain clears the flag before invoking the callback, so an item may
//! legally re-enqueue itself, and keeps going until the queue is empty --
//! work enqueued during the pass is processed in the same pass.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::Rc;
use core::cell::RefCell;

use dekit_substrate::{ContextKind, ExecContext};

/// Identity of a registered work item; never reused
pub type WorkId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Normal,
    Delayed,
    Tasklet,
}

type WorkFn = Rc<RefCell<dyn FnMut()>>;

struct WorkItem {
    kind: WorkKind,
    pending: bool,
    callback: WorkFn,
}

struct WorkInner {
    items: BTreeMap<WorkId, WorkItem>,
    fifo: VecDeque<WorkId>,
    next_id: WorkId,
    draining: bool,
}

/// Shared handle to the work queue
#[derive(Clone)]
pub struct WorkQueue {
    inner: Rc<RefCell<WorkInner>>,
    context: ExecContext,
}

impl WorkQueue {
    pub fn new(context: ExecContext) -> Self {
        Self {
            inner: Rc::new(RefCell::new(WorkInner {
                items: BTreeMap::new(),
                fifo: VecDeque::new(),
                next_id: 0,
                draining: false,
            })),
            context,
        }
    }

    /// Register a work item; it runs whenever `schedule` enqueues it
    pub fn register(&self, kind: WorkKind, callback: impl FnMut() + 'static) -> WorkId {
        self.context.assert_not_signal();
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.items.insert(
            id,
            WorkItem {
                kind,
                pending: false,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        id
    }

    /// Drop a work item; a queued-but-not-yet-drained entry is skipped
    pub fn unregister(&self, id: WorkId) -> bool {
        self.context.assert_not_signal();
        self.inner.borrow_mut().items.remove(&id).is_some()
    }

    /// Enqueue the item unless it is already pending
    ///
    /// Returns whether the item was enqueued; enqueuing an already-pending
    /// item is a no-op, an unknown id is logged and ignored.
    pub fn schedule(&self, id: WorkId) -> bool {
        self.context.assert_not_signal();
        let mut inner = self.inner.borrow_mut();
        match inner.items.get_mut(&id) {
            Some(item) if item.pending => false,
            Some(item) => {
                item.pending = true;
                inner.fifo.push_back(id);
                true
            }
            None => {
                log::warn!("schedule of unregistered work item {id}");
                false
            }
        }
    }

    pub fn pending(&self, id: WorkId) -> bool {
        self.inner
            .borrow()
            .items
            .get(&id)
            .is_some_and(|item| item.pending)
    }

    pub fn kind(&self, id: WorkId) -> Option<WorkKind> {
        self.inner.borrow().items.get(&id).map(|item| item.kind)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().fifo.is_empty()
    }

    /// Pop and run items until the queue is empty
    ///
    /// Invoked once per broadcast. Items enqueued by a running callback are
    /// drained in the same pass, not deferred to the next wake.
    pub fn drain(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            assert!(!inner.draining, "re-entrant work drain");
            inner.draining = true;
        }

        loop {
            let callback = {
                let mut inner = self.inner.borrow_mut();
                loop {
                    match inner.fifo.pop_front() {
                        None => break None,
                        Some(id) => {
                            if let Some(item) = inner.items.get_mut(&id) {
                                item.pending = false;
                                break Some(Rc::clone(&item.callback));
                            }
                            // unregistered while queued; skip
                        }
                    }
                }
            };

            match callback {
                None => break,
                Some(cb) => {
                    let _guard = self.context.enter(ContextKind::Task);
                    (&mut *cb.borrow_mut())();
                }
            }
        }

        self.inner.borrow_mut().draining = false;
    }
}
