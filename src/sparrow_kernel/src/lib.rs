//! The Sparrow RTOS kernel
//!
//! A preemptive, priority-based scheduler and the synchronization and timing
//! primitives layered directly on top of it, for small single-CPU embedded
//! targets. The kernel performs no dynamic allocation: every object is
//! statically allocated by its owner, lists are intrusive, and blocking
//! operations carry their cancellation state on the blocked task's stack.
//!
//! The kernel is generic over a system type implementing [`PortThreading`]
//! (the architecture layer: CPU Lock, context switch requests) and
//! [`KernelCfg`] (static configuration: priority levels, tick frequency,
//! round-robin quantum). The port drives the kernel through [`PortToKernel`].
//!
//! # Scheduling model
//!
//! Priorities are `u8`; numerically larger values are more urgent, and level
//! 0 is conventionally reserved for the idle position. The running task is
//! always the most urgent Runnable task; tasks of equal effective priority
//! run in FIFO order and rotate when their round-robin quantum is exhausted.
//! Preemption happens whenever a scheduler operation or the tick interrupt
//! makes a more urgent task Runnable.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

use core::{fmt, marker::PhantomData};

pub mod utils;
mod cfg;
pub mod error;
mod klock;
pub mod mutex;
pub mod queue;
pub mod semaphore;
#[cfg(feature = "signals")]
pub mod signal;
pub mod task;
pub mod timeout;
pub mod timer;
mod wait;

/// Used by [`configure_kernel!`].
#[doc(hidden)]
pub extern crate arrayvec;

pub use crate::{
    error::{Errno, Result},
    task::{TaskAttr, TaskCb},
    timer::{TimerAttr, TimerCb},
};

use crate::{klock::CpuLockCell, utils::intrusive_list::StaticListHead, utils::Init};

/// Absolute time, expressed as a count of periodic tick interrupts since
/// boot.
pub type Tick = u64;

/// Relative time, expressed in ticks.
pub type Ticks = u32;

/// Task priority. Larger values are more urgent.
pub type Priority = u8;

/// Implemented by a port on a system type to provide threading and
/// interrupt-masking functionality.
///
/// # Safety
///
/// The implementation must uphold the documented contract of each method;
/// the kernel's memory safety depends on it.
pub unsafe trait PortThreading: Sized + 'static {
    /// Port-specific per-task state stored in each [`TaskCb`]. On a bare
    /// metal port this is where the saved stack pointer lives.
    type PortTaskState: Send + Sync + Init + fmt::Debug + 'static;

    /// Request a context switch. The switch doesn't have to happen
    /// immediately; on real hardware this pends the lowest-priority
    /// interrupt, which calls [`PortToKernel::choose_running_task`] and
    /// performs the stack switch on exit.
    ///
    /// Precondition: CPU Lock inactive.
    unsafe fn yield_cpu();

    /// Terminate the current task's execution context and dispatch the next
    /// task. The kernel has already transitioned the task out of the Running
    /// state.
    ///
    /// Precondition: CPU Lock active, task context.
    unsafe fn exit_and_dispatch(task: &'static TaskCb<Self>) -> !
    where
        Self: KernelCfg;

    /// Activate CPU Lock (mask interrupts at the scheduler's critical
    /// section level).
    ///
    /// Precondition: CPU Lock inactive.
    unsafe fn enter_cpu_lock();

    /// Deactivate CPU Lock.
    ///
    /// Precondition: CPU Lock active.
    unsafe fn leave_cpu_lock();

    /// Activate CPU Lock. Return `false` if CPU Lock was already active.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Prepare the task's execution context so that it will start running
    /// from its entry point the next time it's dispatched.
    ///
    /// Precondition: CPU Lock active, the task is Dormant.
    unsafe fn initialize_task_state(task: &'static TaskCb<Self>)
    where
        Self: KernelCfg;

    /// Return `true` iff CPU Lock is active.
    fn is_cpu_lock_active() -> bool;

    /// Return `true` iff the current context is a task context.
    fn is_task_context() -> bool;

    /// Return `true` iff the current context is an interrupt context.
    fn is_interrupt_context() -> bool;
}

/// Static kernel configuration, attached to a system type by
/// [`configure_kernel!`].
///
/// # Safety
///
/// Only meant to be implemented by [`configure_kernel!`].
pub unsafe trait KernelCfg: PortThreading {
    /// The number of task priority levels, including the idle level 0.
    const NUM_TASK_PRIORITY_LEVELS: usize;

    /// The frequency of the periodic tick interrupt.
    const TICK_FREQUENCY_HZ: u32;

    /// The round-robin quantum. A Running task that exhausts this many ticks
    /// rotates behind equal-priority peers.
    const TIME_SLICE_TICKS: Ticks;

    /// The task ready queue implementation.
    type TaskReadyQueue: task::readyqueue::Queue<Self>;

    /// Backing storage for the timeout heap. Bounds the number of
    /// simultaneously pending timed operations and software timers.
    type TimeoutHeap: utils::binary_heap::HeapStorage<Item = timeout::TimeoutRef<Self>>
        + Send
        + Sync
        + fmt::Debug
        + 'static;

    /// Tasks activated automatically by [`PortToKernel::boot`].
    const STARTUP_TASKS: &'static [&'static TaskCb<Self>];

    /// Get the singleton kernel state.
    fn state() -> &'static State<Self>;
}

/// The umbrella trait the kernel implementation is written against.
pub trait KernelTraits: PortThreading + KernelCfg {}
impl<T: PortThreading + KernelCfg> KernelTraits for T {}

/// The interface the port uses to drive the kernel.
///
/// Automatically implemented on every system type with a complete
/// configuration.
pub trait PortToKernel {
    /// Initialize the kernel and activate the startup tasks. The port calls
    /// this exactly once, before delivering any tick interrupt, and then
    /// starts dispatching (the kernel will have requested a context switch
    /// via [`PortThreading::yield_cpu`] if a startup task is ready).
    ///
    /// # Safety
    ///
    /// Precondition: CPU Lock inactive, boot context.
    unsafe fn boot();

    /// Choose the next task to run and update the kernel's running-task
    /// state accordingly. Returns the chosen task, which the port transfers
    /// control to (`None` means the idle context).
    ///
    /// # Safety
    ///
    /// Precondition: CPU Lock active.
    unsafe fn choose_running_task() -> Option<&'static TaskCb<Self>>
    where
        Self: PortThreading,
        Self: KernelCfg;

    /// The handler for the periodic tick interrupt. Advances time, expires
    /// timeouts and software timers, and performs round-robin accounting.
    ///
    /// # Safety
    ///
    /// Precondition: CPU Lock inactive, interrupt context.
    unsafe fn timer_tick();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();

        for &task_cb in Self::STARTUP_TASKS {
            task::init_task(lock.borrow_mut(), task_cb);
        }

        task::unlock_cpu_and_check_preemption(lock);
    }

    unsafe fn choose_running_task() -> Option<&'static TaskCb<Self>> {
        // Safety: CPU Lock active per this method's precondition
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        task::choose_next_running_task(lock.borrow_mut());

        let running_task = Self::state().running_task.get(&*lock);

        // Keep CPU Lock active; the port releases it after the switch.
        core::mem::forget(lock);

        running_task
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Traits>();
    }
}

/// The kernel's singleton state for a system type.
///
/// Process-wide, initialized before any task runs, never destroyed.
pub struct State<Traits: KernelCfg> {
    /// The currently running task, or `None` when the system is idle.
    running_task: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// Tasks in the Ready state, segregated by effective priority.
    task_ready_queue: Traits::TaskReadyQueue,

    /// Tasks in the Suspended state, sorted by effective priority
    /// (descending), FIFO within a priority.
    suspend_list: CpuLockCell<Traits, StaticListHead<TaskCb<Traits>>>,

    /// Timekeeping and pending timeouts.
    timeout: timeout::TimeoutGlobals<Traits, Traits::TimeoutHeap>,

    /// The number of context switches performed since boot.
    context_switch_count: CpuLockCell<Traits, u64>,
}

impl<Traits: KernelTraits> Init for State<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        running_task: Init::INIT,
        task_ready_queue: Init::INIT,
        suspend_list: Init::INIT,
        timeout: timeout::TimeoutGlobals::INIT,
        context_switch_count: Init::INIT,
    };
}

// Safety: every interior-mutable field is only accessed with CPU Lock held
unsafe impl<Traits: KernelCfg> Send for State<Traits> {}
unsafe impl<Traits: KernelCfg> Sync for State<Traits> {}

impl<Traits: KernelTraits> State<Traits> {
    /// Get the currently running task.
    pub(crate) fn running_task(
        &self,
        lock: klock::CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        self.running_task.get(&*lock)
    }
}

impl<Traits: KernelTraits> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field("context_switch_count", &self.context_switch_count)
            .finish_non_exhaustive()
    }
}

/// The public system-wide operations of the kernel, scoped to a system type.
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits: KernelTraits> System<Traits> {
    /// Get the current value of the tick counter.
    pub fn tick_count() -> Result<Tick> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(timeout::tick_count(lock.borrow_mut()))
    }

    /// Get the number of context switches performed since boot.
    pub fn context_switch_count() -> Result<u64> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(Traits::state().context_switch_count.get(&*lock))
    }

    /// Get the deadline of the earliest pending timeout, if any.
    ///
    /// This is primarily for ports whose tick source can skip ahead while
    /// the system is idle.
    pub fn earliest_deadline() -> Result<Option<Tick>> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(timeout::earliest_deadline(lock.borrow_mut()))
    }

    /// Yield the processor: rotate the current task behind Ready tasks of
    /// the same effective priority, then request a context switch.
    pub fn yield_now() -> Result {
        task::yield_current_task::<Traits>()
    }

    /// Block the current task for the specified number of ticks.
    pub fn sleep_for(ticks: Ticks) -> Result {
        task::put_current_task_on_sleep_for::<Traits>(ticks)
    }

    /// Block the current task until the tick counter reaches `deadline`.
    pub fn sleep_until(deadline: Tick) -> Result {
        task::put_current_task_on_sleep_until::<Traits>(deadline)
    }

    /// Suspend the current task until another task resumes it.
    ///
    /// Returns `EINTR` if the suspension was cut short by a signal.
    pub fn suspend() -> Result {
        task::suspend_current_task::<Traits>()
    }

    /// Terminate the current task.
    ///
    /// The task's exit hook (if any) runs inside the critical section just
    /// before the final context switch. Held mutexes are handed off to their
    /// next waiters.
    ///
    /// # Safety
    ///
    /// All non-trivially-destructible state on the task's stack must have
    /// been cleaned up by the caller.
    pub unsafe fn exit_task() -> Result<core::convert::Infallible> {
        // Safety: Forwarded to the caller
        unsafe { task::exit_current_task::<Traits>() }
    }
}
