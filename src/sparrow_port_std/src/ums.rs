//! Cooperative user-mode scheduling of host threads.
//!
//! Every kernel context (each task, plus the pump, which doubles as the
//! interrupt and idle context) is backed by a host thread, and exactly one
//! of them runs at a time: whoever currently matches `Core::active`. A
//! context transfers control by storing the new `Ctx` and waking the
//! others; everybody else sits in [`Engine::wait_for_turn`].
//!
//! This emulates a single-CPU target faithfully enough for kernel
//! semantics: preemption can only be observed at the points where real
//! hardware would take an interrupt (the explicit transfer points).
use std::any::Any;
use std::sync::{Condvar, Mutex};

pub(crate) type ThreadId = usize;

/// A schedulable host-thread context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ctx {
    /// The pump: bootstraps the kernel, runs interrupt handlers, performs
    /// dispatch, and advances simulated time while the system is idle.
    Pump,
    /// The backing thread for a task.
    Task(ThreadId),
}

pub(crate) struct Core {
    /// The context currently allowed to run.
    pub(crate) active: Ctx,

    /// The CPU Lock flag (the simulated interrupt mask).
    pub(crate) cpu_lock: bool,

    /// A tick interrupt is pending.
    pub(crate) tick_pending: bool,

    /// A dispatch (context switch request) is pending.
    pub(crate) dispatch_pending: bool,

    /// The system is shutting down; the pump exits its loop.
    pub(crate) shutdown: bool,

    /// A panic captured from a task thread, to be propagated out of
    /// `port_boot`.
    pub(crate) panic_payload: Option<Box<dyn Any + Send>>,

    /// The backing thread of the task chosen by the last dispatch, if any.
    pub(crate) task_thread: Option<ThreadId>,

    /// Allocator for `ThreadId`s.
    pub(crate) next_thread_id: ThreadId,
}

pub(crate) struct Engine {
    core: Mutex<Core>,
    cv: Condvar,
}

impl Engine {
    pub(crate) const fn new() -> Self {
        Self {
            core: Mutex::new(Core {
                active: Ctx::Pump,
                cpu_lock: false,
                tick_pending: false,
                dispatch_pending: false,
                shutdown: false,
                panic_payload: None,
                task_thread: None,
                next_thread_id: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Run a closure with the core state locked.
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        let mut core = self.core.lock().unwrap();
        f(&mut core)
    }

    /// Run a closure with the core state locked, then wake every context so
    /// they can re-examine `active`.
    pub(crate) fn with_core_and_notify<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        let mut core = self.core.lock().unwrap();
        let result = f(&mut core);
        drop(core);
        self.cv.notify_all();
        result
    }

    /// Block until `me` becomes the active context.
    ///
    /// Task-thread contexts never wake up from this after a shutdown; the
    /// process (or the test) simply ends without them.
    pub(crate) fn wait_for_turn(&self, me: Ctx) {
        let mut core = self.core.lock().unwrap();
        while core.active != me {
            core = self.cv.wait(core).unwrap();
        }
    }

    /// Hand the processor to `target` and block until control returns to
    /// `me`.
    pub(crate) fn switch_to(&self, target: Ctx, me: Ctx) {
        log::trace!("switch {me:?} -> {target:?}");
        let mut core = self.core.lock().unwrap();
        debug_assert_eq!(core.active, me);
        core.active = target;
        drop(core);
        self.cv.notify_all();
        self.wait_for_turn(me);
    }
}
