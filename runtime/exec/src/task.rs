//! Cooperative run-to-completion scheduler
//!
//! Tasks are closures that run until they finish or voluntarily yield; there
//! is no preemption because the substrate has none and ported driver code
//! assumes none. A task waiting on a condition blocks and is re-readied by
//! the next broadcast, where it re-examines the condition itself; there is
//! no targeted wake.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use dekit_substrate::{ContextKind, ExecContext};

/// Identity of a spawned task; never reused
pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Blocked,
    Finished,
}

/// What a task run ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Stay ready; run again on the next broadcast
    Yield,
    /// Park until the next broadcast re-readies all blocked tasks
    Block,
    /// Natural completion; the task is removed
    Finish,
}

type TaskFn = Box<dyn FnMut() -> TaskOutcome>;

struct TaskEntry {
    state: TaskState,
    /// Taken out of the slot while the task runs
    entry: Option<TaskFn>,
}

struct SchedInner {
    tasks: BTreeMap<TaskId, TaskEntry>,
    next_id: TaskId,
    dispatching: bool,
}

/// Shared handle to the task set
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<RefCell<SchedInner>>,
    context: ExecContext,
}

impl Scheduler {
    pub fn new(context: ExecContext) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SchedInner {
                tasks: BTreeMap::new(),
                next_id: 0,
                dispatching: false,
            })),
            context,
        }
    }

    /// Add a task; it first runs on the next broadcast
    pub fn spawn(&self, entry: impl FnMut() -> TaskOutcome + 'static) -> TaskId {
        self.context.assert_not_signal();
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.tasks.insert(
            id,
            TaskEntry {
                state: TaskState::Ready,
                entry: Some(Box::new(entry)),
            },
        );
        id
    }

    /// Explicitly remove a task
    ///
    /// Removing a task that finished or was already removed is a defined
    /// no-op returning `false`, so teardown paths stay idempotent.
    pub fn remove(&self, id: TaskId) -> bool {
        self.context.assert_not_signal();
        self.inner.borrow_mut().tasks.remove(&id).is_some()
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.inner.borrow().tasks.get(&id).map(|e| e.state)
    }

    pub fn task_count(&self) -> usize {
        self.inner.borrow().tasks.len()
    }

    pub fn has_ready(&self) -> bool {
        self.inner
            .borrow()
            .tasks
            .values()
            .any(|e| e.state == TaskState::Ready)
    }

    /// Broadcast dispatch
    ///
    /// Re-readies every blocked task, then runs each ready task once, to
    /// completion or voluntary yield. Tasks spawned during the pass run on
    /// the next broadcast. Dispatch never nests; a task calling back into
    /// dispatch would break the mutual-exclusion invariant and panics.
    pub fn dispatch_all(&self) {
        let ids: Vec<TaskId> = {
            let mut inner = self.inner.borrow_mut();
            assert!(!inner.dispatching, "re-entrant task dispatch");
            inner.dispatching = true;

            for entry in inner.tasks.values_mut() {
                if entry.state == TaskState::Blocked {
                    entry.state = TaskState::Ready;
                }
            }
            inner
                .tasks
                .iter()
                .filter(|(_, e)| e.state == TaskState::Ready)
                .map(|(&id, _)| id)
                .collect()
        };

        for id in ids {
            let mut entry_fn = {
                let mut inner = self.inner.borrow_mut();
                match inner.tasks.get_mut(&id) {
                    Some(e) if e.state == TaskState::Ready => match e.entry.take() {
                        Some(f) => f,
                        None => continue,
                    },
                    // removed meanwhile
                    _ => continue,
                }
            };

            let outcome = {
                let _guard = self.context.enter(ContextKind::Task);
                entry_fn()
            };

            let mut inner = self.inner.borrow_mut();
            let finished = match inner.tasks.get_mut(&id) {
                // the task removed itself while running
                None => false,
                Some(e) => match outcome {
                    TaskOutcome::Yield => {
                        e.state = TaskState::Ready;
                        e.entry = Some(entry_fn);
                        false
                    }
                    TaskOutcome::Block => {
                        e.state = TaskState::Blocked;
                        e.entry = Some(entry_fn);
                        false
                    }
                    TaskOutcome::Finish => {
                        e.state = TaskState::Finished;
                        true
                    }
                },
            };
            if finished {
                inner.tasks.remove(&id);
            }
        }

        self.inner.borrow_mut().dispatching = false;
    }
}
