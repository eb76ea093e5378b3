//! Simulator port of the Sparrow kernel for hosted environments.
//!
//! Each kernel task is backed by a host thread, and a dedicated *pump*
//! context (the thread that called [`port_boot`]) plays the roles the
//! hardware would otherwise play: it runs the tick interrupt handler and
//! the dispatcher, and it is the idle context.
//!
//! # Simulated time
//!
//! The tick counter does not follow the wall clock. A tick interrupt is
//! delivered when
//!
//!  - a task calls [`pend_tick`], which behaves as if the tick interrupt
//!    fired at that exact point, or
//!  - the system goes idle while a timed event is outstanding - the pump
//!    then delivers ticks back-to-back until some task becomes Ready.
//!
//! This makes every timed scenario exactly reproducible: a task sleeping
//! for `n` ticks wakes up at exactly `tick + n`, regardless of host
//! scheduling. If the system goes idle with no timed event outstanding, the
//! pump panics, as nothing could ever run again.
use std::cell::Cell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use sparrow_kernel::{utils::Init, KernelTraits, PortThreading, PortToKernel, System, TaskCb};
use spin::Mutex as SpinMutex;

mod ums;

use ums::{Ctx, Engine, ThreadId};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate sparrow_kernel;
/// Used by test harnesses
#[doc(hidden)]
pub extern crate env_logger;

/// Implemented on a system type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortTaskState = TaskState>
{
    fn port_state() -> &'static State;
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    /// A thread not managed by the port (e.g., the test harness).
    Unknown,
    /// The pump: boot, interrupt handlers, dispatch, idle.
    Interrupt,
    /// The backing thread for a task.
    Task,
}

std::thread_local! {
    /// The current thread's role. It's assigned when the port takes control
    /// of a thread.
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);

    /// The [`ThreadId`] of the current task-backing thread.
    static CURRENT_THREAD: Cell<Option<ThreadId>> = Cell::new(None);
}

/// The panic payload used to unwind and terminate a task-backing thread
/// when its task exits.
struct ExitToken;

/// The task's state in the port-side task state machine.
///
/// This field is expected to be accessed with the simulated CPU running the
/// accessor, so `SpinMutex` is sufficient (no real contention is possible).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Tsm {
    /// The task's context state is not initialized. The kernel has to call
    /// `initialize_task_state` first before choosing this task to run.
    Uninit,
    /// The task's context state is initialized but hasn't started running.
    Dormant,
    /// The task is backed by a live host thread.
    Running(ThreadId),
}

/// The port-specific per-task state.
#[derive(Debug)]
pub struct TaskState {
    tsm: SpinMutex<Tsm>,
}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            tsm: SpinMutex::new(Tsm::Uninit),
        }
    }
}

impl Init for TaskState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation
/// of the corresponding trait methods of
/// [`PortThreading`](sparrow_kernel::PortThreading).
#[doc(hidden)]
pub struct State {
    engine: Engine,
}

/// The pump's decision of what to do next.
enum Action {
    Tick,
    Dispatch,
    RunTask(ThreadId),
    Idle,
    Shutdown,
    Panic(Box<dyn std::any::Any + Send>),
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            engine: Engine::new(),
        }
    }

    /// Boot the kernel and run the pump loop. Returns when a task calls
    /// [`shutdown`]; panics raised in task threads are propagated.
    pub fn port_boot<Traits: PortInstance>(&'static self) {
        THREAD_ROLE.with(|role| role.set(ThreadRole::Interrupt));
        log::trace!("port_boot");

        // Safety: We are the port, calling this exactly once before any
        // tick is delivered
        unsafe { <Traits as PortToKernel>::boot() };

        loop {
            let action = self.engine.with_core(|core| {
                debug_assert_eq!(core.active, Ctx::Pump);
                if let Some(payload) = core.panic_payload.take() {
                    Action::Panic(payload)
                } else if core.shutdown {
                    Action::Shutdown
                } else if core.tick_pending {
                    core.tick_pending = false;
                    Action::Tick
                } else if core.dispatch_pending {
                    core.dispatch_pending = false;
                    Action::Dispatch
                } else if let Some(thread_id) = core.task_thread {
                    Action::RunTask(thread_id)
                } else {
                    Action::Idle
                }
            });

            match action {
                Action::Panic(payload) => resume_unwind(payload),
                Action::Shutdown => break,
                Action::Tick => {
                    log::trace!("timer_tick");
                    // Safety: CPU Lock inactive, interrupt (pump) context
                    unsafe { <Traits as PortToKernel>::timer_tick() };
                }
                Action::Dispatch => self.dispatch::<Traits>(),
                Action::RunTask(thread_id) => {
                    self.engine.switch_to(Ctx::Task(thread_id), Ctx::Pump);
                }
                Action::Idle => {
                    // Simulated time flies while the system is idle
                    match System::<Traits>::earliest_deadline().unwrap() {
                        Some(_) => self.engine.with_core(|core| core.tick_pending = true),
                        None => panic!(
                            "system deadlocked: every task is blocked \
                             and no timed event is outstanding"
                        ),
                    }
                }
            }
        }

        log::trace!("port_boot: shutdown complete");
        THREAD_ROLE.with(|role| role.set(ThreadRole::Unknown));
    }

    /// Let the kernel choose the next task to run and note its backing
    /// thread, spawning one if the task has never run.
    fn dispatch<Traits: PortInstance>(&'static self) {
        self.engine.with_core(|core| {
            debug_assert!(!core.cpu_lock);
            core.cpu_lock = true;
        });

        // Safety: CPU Lock active
        let running_task = unsafe { <Traits as PortToKernel>::choose_running_task() };

        self.engine.with_core(|core| core.cpu_lock = false);

        let task_thread = running_task.map(|task| {
            let mut tsm = task.port_task_state.tsm.lock();
            match *tsm {
                Tsm::Running(thread_id) => thread_id,
                Tsm::Dormant => {
                    let thread_id = self.spawn_task_thread::<Traits>(task);
                    log::trace!("spawned thread {thread_id} for task {task:p}");
                    *tsm = Tsm::Running(thread_id);
                    thread_id
                }
                Tsm::Uninit => unreachable!("chosen task has no initialized context"),
            }
        });

        if let Some(task) = running_task {
            log::trace!("dispatching task {task:p}");
        } else {
            log::trace!("dispatching the idle context");
        }

        self.engine.with_core(|core| core.task_thread = task_thread);
    }

    fn spawn_task_thread<Traits: PortInstance>(
        &'static self,
        task: &'static TaskCb<Traits>,
    ) -> ThreadId {
        let thread_id = self.engine.with_core(|core| {
            let thread_id = core.next_thread_id;
            core.next_thread_id += 1;
            thread_id
        });

        let min_stack = 64 * 1024;
        std::thread::Builder::new()
            .stack_size(task.attr.stack_size.max(min_stack))
            .spawn(move || {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Task));
                CURRENT_THREAD.with(|id| id.set(Some(thread_id)));

                // Wait for the first dispatch to us
                self.engine.wait_for_turn(Ctx::Task(thread_id));

                let result = catch_unwind(AssertUnwindSafe(|| {
                    log::debug!("task {task:p} is now running");

                    (task.attr.entry_point)(task.attr.entry_param);

                    // The task body returned; remove the task from the
                    // kernel's control.
                    // Safety: Nothing on this stack needs cleanup
                    let _ = unsafe { System::<Traits>::exit_task() };
                    unreachable!();
                }));

                match result {
                    // `exit_and_dispatch` terminates the thread by
                    // unwinding with `ExitToken`
                    Err(payload) if payload.is::<ExitToken>() => {
                        log::trace!("thread {thread_id} exited cleanly");
                    }
                    Err(payload) => {
                        // Propagate the panic through `port_boot`
                        log::error!("task {task:p} panicked");
                        self.engine.with_core_and_notify(|core| {
                            core.panic_payload = Some(payload);
                            core.shutdown = true;
                            core.active = Ctx::Pump;
                        });
                    }
                    Ok(never) => never,
                }
            })
            .expect("failed to spawn a task thread");

        thread_id
    }

    pub unsafe fn yield_cpu<Traits: PortInstance>(&'static self) {
        log::trace!("yield_cpu");
        debug_assert!(!self.is_cpu_lock_active());

        match THREAD_ROLE.with(|role| role.get()) {
            ThreadRole::Task => {
                let me = Ctx::Task(CURRENT_THREAD.with(|id| id.get()).unwrap());
                self.engine.with_core(|core| core.dispatch_pending = true);
                self.engine.switch_to(Ctx::Pump, me);
            }
            // From the pump (interrupt or boot processing), the dispatch
            // happens when the current handler finishes
            _ => self.engine.with_core(|core| core.dispatch_pending = true),
        }
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance>(
        &'static self,
        task: &'static TaskCb<Traits>,
    ) -> ! {
        log::trace!("exit_and_dispatch({task:p})");

        // Dissociate this thread from the task so that the task can be
        // activated again
        *task.port_task_state.tsm.lock() = Tsm::Uninit;

        self.engine.with_core_and_notify(|core| {
            debug_assert!(core.cpu_lock);
            core.cpu_lock = false;
            core.dispatch_pending = true;
            core.active = Ctx::Pump;
        });

        // Unwind to the thread entry wrapper, which knows this token
        std::panic::panic_any(ExitToken);
    }

    pub unsafe fn enter_cpu_lock(&'static self) {
        log::trace!("enter_cpu_lock");
        self.engine.with_core(|core| {
            assert!(!core.cpu_lock);
            core.cpu_lock = true;
        });
    }

    pub unsafe fn try_enter_cpu_lock(&'static self) -> bool {
        self.engine.with_core(|core| {
            if core.cpu_lock {
                false
            } else {
                core.cpu_lock = true;
                true
            }
        })
    }

    pub unsafe fn leave_cpu_lock(&'static self) {
        log::trace!("leave_cpu_lock");
        let pending = self.engine.with_core(|core| {
            assert!(core.cpu_lock);
            core.cpu_lock = false;
            core.tick_pending || core.dispatch_pending
        });

        // A preemption point: pending interrupts are taken here, like on
        // real hardware when the interrupt mask is lifted
        if pending
            && THREAD_ROLE.with(|role| role.get()) == ThreadRole::Task
            && !std::thread::panicking()
        {
            let me = Ctx::Task(CURRENT_THREAD.with(|id| id.get()).unwrap());
            self.engine.switch_to(Ctx::Pump, me);
        }
    }

    pub unsafe fn initialize_task_state<Traits: PortInstance>(
        &'static self,
        task: &'static TaskCb<Traits>,
    ) {
        log::trace!("initialize_task_state({task:p})");
        let mut tsm = task.port_task_state.tsm.lock();
        match *tsm {
            Tsm::Dormant => {}
            Tsm::Uninit => {
                *tsm = Tsm::Dormant;
            }
            Tsm::Running(_) => unreachable!("reinitializing a live task context"),
        }
    }

    pub fn is_cpu_lock_active(&'static self) -> bool {
        self.engine.with_core(|core| core.cpu_lock)
    }

    pub fn is_task_context(&'static self) -> bool {
        THREAD_ROLE.with(|role| role.get()) == ThreadRole::Task
    }

    pub fn is_interrupt_context(&'static self) -> bool {
        THREAD_ROLE.with(|role| role.get()) == ThreadRole::Interrupt
    }

    fn pend_tick(&'static self) {
        match THREAD_ROLE.with(|role| role.get()) {
            ThreadRole::Task => {
                // The tick interrupt fires right here, preempting the task
                let me = Ctx::Task(CURRENT_THREAD.with(|id| id.get()).unwrap());
                self.engine.with_core(|core| core.tick_pending = true);
                self.engine.switch_to(Ctx::Pump, me);
            }
            _ => {
                self.engine
                    .with_core_and_notify(|core| core.tick_pending = true);
            }
        }
    }

    fn shutdown(&'static self) {
        log::trace!("shutdown requested");
        self.engine.with_core_and_notify(|core| {
            core.shutdown = true;
            core.active = Ctx::Pump;
        });
    }
}

/// Boot the kernel for the given system type and run it until a task calls
/// [`shutdown`]. The calling thread becomes the interrupt/idle context.
///
/// Panics raised in task threads are propagated out of this function.
pub fn port_boot<Traits: PortInstance>() {
    Traits::port_state().port_boot::<Traits>()
}

/// Deliver a tick interrupt. Called from a task, this behaves as if the
/// periodic tick fired at exactly this point of execution.
pub fn pend_tick<Traits: PortInstance>() {
    log::trace!("pend_tick");
    Traits::port_state().pend_tick()
}

/// Initiate shutdown: [`port_boot`] returns once the calling task's thread
/// has parked. This function does not return when called from a task.
pub fn shutdown<Traits: PortInstance>() -> ! {
    Traits::port_state().shutdown();

    // This thread is never scheduled again
    loop {
        std::thread::park();
    }
}

/// Implement [`PortThreading`](sparrow_kernel::PortThreading) and
/// [`PortInstance`] on a system type, backed by a fresh port state
/// singleton.
#[macro_export]
macro_rules! use_port {
    (unsafe impl PortThreading for $sys:ty) => {
        const _: () = {
            use $crate::sparrow_kernel::{PortThreading, TaskCb};
            use $crate::{PortInstance, State, TaskState};

            static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $sys {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            unsafe impl PortThreading for $sys {
                type PortTaskState = TaskState;

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu::<Self>() }
                }

                unsafe fn exit_and_dispatch(task: &'static TaskCb<Self>) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(task) }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock() }
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock() }
                }

                unsafe fn initialize_task_state(task: &'static TaskCb<Self>) {
                    unsafe { PORT_STATE.initialize_task_state::<Self>(task) }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_task_context() -> bool {
                    PORT_STATE.is_task_context()
                }

                fn is_interrupt_context() -> bool {
                    PORT_STATE.is_interrupt_context()
                }
            }
        };
    };
}
