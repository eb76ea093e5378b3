//! Tasks
use core::fmt;

use crate::{
    error::{Errno, Result},
    klock, mutex, timeout,
    utils::{
        intrusive_list::{Ident, ListAccessorCell, Static},
        Init,
    },
    wait, KernelCfg, KernelTraits, PortThreading, Priority, Tick, Ticks,
};

pub mod readyqueue;
use self::readyqueue::Queue as _;

/// *Task control block* - the state data of a task.
#[repr(C)]
pub struct TaskCb<
    Traits: PortThreading + KernelCfg,
    PortTaskState: 'static = <Traits as PortThreading>::PortTaskState,
    TaskReadyQueueData: 'static = <<Traits as KernelCfg>::TaskReadyQueue as readyqueue::Queue<
        Traits,
    >>::PerTaskData,
> {
    /// Get a reference to `PortTaskState` in the task control block.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so that
    /// assembler code can refer to this easily.
    pub port_task_state: PortTaskState,

    /// The static properties of the task.
    pub attr: &'static TaskAttr<Traits>,

    /// The task's base priority.
    pub(crate) base_priority: klock::CpuLockCell<Traits, Priority>,

    /// The task's effective priority. It's calculated based on
    /// `base_priority` and may be temporarily elevated by a mutex locking
    /// protocol. Always ≥ `base_priority`.
    ///
    /// The effective priority determines the task's position within the task
    /// ready queue. You must call `TaskReadyQueue::reorder_task` after
    /// updating `effective_priority` of a task which is in the Ready state.
    pub(crate) effective_priority: klock::CpuLockCell<Traits, Priority>,

    pub(crate) st: klock::CpuLockCell<Traits, TaskSt>,

    /// The remaining portion of the round-robin quantum, in ticks.
    pub(crate) time_slice: klock::CpuLockCell<Traits, Ticks>,

    /// Allows `TaskCb` to participate in one of the task ready queue's
    /// linked lists while in the Ready state.
    pub(crate) ready_queue_data: TaskReadyQueueData,

    /// Links this task into the suspended list while in the Suspended state.
    pub(crate) suspend_link:
        klock::CpuLockCell<Traits, Option<crate::utils::intrusive_list::StaticLink<TaskCb<Traits>>>>,

    /// The wait state of the task.
    pub(crate) wait: wait::TaskWait<Traits>,

    /// The last mutex locked by the task, linking all mutexes it currently
    /// holds.
    pub(crate) last_mutex_held: klock::CpuLockCell<Traits, Option<&'static mutex::MutexCb<Traits>>>,

    /// Pending and masked signal sets.
    #[cfg(feature = "signals")]
    pub(crate) sig: crate::signal::TaskSignalState<Traits>,
}

// Safety: the interior-mutable fields are only accessed with CPU Lock held
unsafe impl<Traits: PortThreading + KernelCfg, PortTaskState: Send + Sync, TaskReadyQueueData: Send + Sync> Send
    for TaskCb<Traits, PortTaskState, TaskReadyQueueData>
{
}
unsafe impl<Traits: PortThreading + KernelCfg, PortTaskState: Send + Sync, TaskReadyQueueData: Send + Sync> Sync
    for TaskCb<Traits, PortTaskState, TaskReadyQueueData>
{
}

impl<Traits: KernelTraits> TaskCb<Traits> {
    /// Construct a `TaskCb`. The task starts out Dormant; activate it with
    /// [`TaskCb::activate`] or by listing it in the startup task list.
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new(attr: &'static TaskAttr<Traits>) -> Self {
        Self {
            port_task_state: Init::INIT,
            attr,
            base_priority: klock::CpuLockCell::new(attr.priority),
            effective_priority: klock::CpuLockCell::new(attr.priority),
            st: klock::CpuLockCell::new(TaskSt::Dormant),
            time_slice: klock::CpuLockCell::new(0),
            ready_queue_data: Init::INIT,
            suspend_link: Init::INIT,
            wait: Init::INIT,
            last_mutex_held: Init::INIT,
            #[cfg(feature = "signals")]
            sig: Init::INIT,
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("attr", self.attr)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("st", &self.st)
            .finish_non_exhaustive()
    }
}

/// The static properties of a task.
pub struct TaskAttr<Traits> {
    /// The entry point of the task.
    ///
    /// # Safety
    ///
    /// This is only meant to be used by a kernel port, as a task entry
    /// point, not by user code. Using this in other ways may cause an
    /// undefined behavior.
    pub entry_point: fn(usize),

    /// The parameter supplied for `entry_point`.
    pub entry_param: usize,

    /// The initial base priority of the task.
    pub priority: Priority,

    /// A hint for the stack size of the task. Ports back this with real
    /// storage in a port-specific way.
    pub stack_size: usize,

    /// Called inside the scheduler critical section just before the final
    /// context switch when the task exits.
    pub exit_hook: Option<fn()>,

    _phantom: core::marker::PhantomData<Traits>,
}

/// The default stack size hint for a task.
pub const DEFAULT_STACK_SIZE: usize = 4096;

impl<Traits> TaskAttr<Traits> {
    pub const fn new(entry_point: fn(usize), entry_param: usize, priority: Priority) -> Self {
        Self {
            entry_point,
            entry_param,
            priority,
            stack_size: DEFAULT_STACK_SIZE,
            exit_hook: None,
            _phantom: core::marker::PhantomData,
        }
    }

    pub const fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub const fn with_exit_hook(mut self, exit_hook: fn()) -> Self {
        self.exit_hook = Some(exit_hook);
        self
    }
}

impl<Traits> fmt::Debug for TaskAttr<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskAttr")
            .field("entry_point", &self.entry_point)
            .field("entry_param", &self.entry_param)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Task state machine
#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// The task is not started or has exited.
    Dormant,

    Ready,

    /// The task is in the Running state.
    Running,

    /// The task is blocked on a waitable object or a timed wait.
    Waiting,

    /// The task was suspended. It's linked into the kernel's suspended list.
    Suspended,
}

impl Init for TaskSt {
    const INIT: Self = Self::Dormant;
}

/// Get a `ListAccessorCell` used to access the suspended list.
macro_rules! suspend_list_accessor {
    ($key:expr) => {
        ListAccessorCell::new(
            &Traits::state().suspend_list,
            &Static,
            |task_cb: &TaskCb<Traits>| &task_cb.suspend_link,
            $key,
        )
    };
}

/// These associated functions implement the task-related portion of the
/// public kernel API.
impl<Traits: KernelTraits> TaskCb<Traits> {
    /// Start the task. Fails with `EINVAL` if the task is already started.
    pub fn activate(&'static self) -> Result {
        let lock = klock::lock_cpu::<Traits>()?;
        activate(lock, self)
    }

    /// Interrupt any ongoing blocking operation of this task, making it
    /// return `EINTR`.
    ///
    /// Fails with `EINVAL` if the task is not currently blocked.
    pub fn interrupt(&'static self) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        wait::interrupt_task(lock.borrow_mut(), self, Err(Errno::Interrupted))?;

        // The task is now awake, check dispatch
        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Suspend the task. The task must be Runnable (`EINVAL` otherwise).
    pub fn suspend(&'static self) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;

        match self.st.get(&*lock) {
            TaskSt::Running => {
                // Suspending the current task suspends the caller
                debug_assert!(core::ptr::eq(
                    Traits::state().running_task(lock.borrow_mut()).unwrap(),
                    self
                ));
                suspend_current_task_inner(lock)
            }
            TaskSt::Ready => {
                let pri = self.effective_priority.get(&*lock);
                // Safety: the task is linked into the ready queue with `pri`
                unsafe {
                    Traits::state().task_ready_queue.remove_task(
                        lock.borrow_mut().into(),
                        self,
                        pri,
                    );
                }
                transition_to_suspended(lock.borrow_mut(), self);
                Ok(())
            }
            _ => Err(Errno::Invalid),
        }
    }

    /// Resume the task. The task must be Suspended (`EINVAL` otherwise).
    pub fn resume(&'static self) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if self.st.get(&*lock) != TaskSt::Suspended {
            return Err(Errno::Invalid);
        }

        suspend_list_accessor!(lock.borrow_mut()).remove(Ident(self));
        self.wait.set_wait_result(lock.borrow_mut(), Ok(()));

        // Safety: the task was Suspended, so its execution context is valid
        unsafe { make_ready(lock.borrow_mut(), self) };

        unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get the task's base priority.
    pub fn priority(&'static self) -> Result<Priority> {
        let lock = klock::lock_cpu::<Traits>()?;
        if self.st.get(&*lock) == TaskSt::Dormant {
            Err(Errno::Invalid)
        } else {
            Ok(self.base_priority.get(&*lock))
        }
    }

    /// Get the task's effective priority (base priority plus any elevation
    /// by a mutex locking protocol).
    pub fn effective_priority(&'static self) -> Result<Priority> {
        let lock = klock::lock_cpu::<Traits>()?;
        if self.st.get(&*lock) == TaskSt::Dormant {
            Err(Errno::Invalid)
        } else {
            Ok(self.effective_priority.get(&*lock))
        }
    }

    /// Change the task's base priority.
    ///
    /// Fails with `EINVAL` if `priority` is out of range, if the task is
    /// Dormant, or if raising the priority would violate the ceiling of a
    /// held or waited-for priority-protect mutex.
    pub fn set_priority(&'static self, priority: Priority) -> Result {
        let lock = klock::lock_cpu::<Traits>()?;
        set_task_base_priority(lock, self, priority)
    }
}

/// Initialize a task at boot time (activation of a startup task).
pub(super) fn init_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    if task_cb.st.get(&*lock) == TaskSt::Dormant {
        activate_core(lock.borrow_mut(), task_cb);
    }
}

/// Implements `TaskCb::activate`.
fn activate<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    task_cb: &'static TaskCb<Traits>,
) -> Result {
    if task_cb.st.get(&*lock) != TaskSt::Dormant {
        return Err(Errno::Invalid);
    }

    if task_cb.attr.priority as usize >= Traits::NUM_TASK_PRIORITY_LEVELS {
        return Err(Errno::Invalid);
    }

    activate_core(lock.borrow_mut(), task_cb);

    // If `task_cb` out-prioritizes the current task, perform a context
    // switch.
    unlock_cpu_and_check_preemption(lock);

    Ok(())
}

fn activate_core<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    // Safety: CPU Lock active, the task is in the Dormant state
    unsafe { Traits::initialize_task_state(task_cb) };

    // Reset the task priority and the round-robin quantum
    task_cb
        .base_priority
        .replace(&mut *lock, task_cb.attr.priority);
    task_cb
        .effective_priority
        .replace(&mut *lock, task_cb.attr.priority);
    task_cb
        .time_slice
        .replace(&mut *lock, Traits::TIME_SLICE_TICKS);

    #[cfg(feature = "signals")]
    crate::signal::reset(lock.borrow_mut(), task_cb);

    // Safety: The previous state is Dormant, and we just initialized the
    // task state, so this is safe
    unsafe { make_ready(lock, task_cb) };
}

/// Transition the task into the Ready state. This function doesn't do any
/// proper cleanup for a previous state. If the previous state is `Dormant`,
/// the caller must initialize the task state first by calling
/// `initialize_task_state`.
pub(super) unsafe fn make_ready<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    // Make the task Ready
    task_cb.st.replace(&mut *lock, TaskSt::Ready);

    // Insert the task to the ready queue.
    //
    // Safety: `task_cb` is not in the ready queue
    unsafe {
        Traits::state()
            .task_ready_queue
            .push_back_task(lock.into(), task_cb);
    }
}

/// Relinquish CPU Lock. After that, if there's a task that ought to execute
/// in lieu of the current task, call `Port::yield_cpu`.
///
/// System services that transition a task into the Ready state should call
/// this before returning to the caller.
pub(super) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
) {
    let prev_task_priority = running_task_priority(lock.borrow_mut());

    let has_preempting_task = match prev_task_priority {
        Some(pri) => Traits::state()
            .task_ready_queue
            .has_ready_task_above(lock.borrow_mut().into(), pri),
        // The current task is no longer schedulable; any Ready task (or the
        // idle context) takes over
        None => true,
    };

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_task {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// The effective priority of the currently running task, or `None` if there
/// is no running task or it's not in the Running state anymore.
fn running_task_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> Option<Priority> {
    let running_task = Traits::state().running_task(lock.borrow_mut());
    if let Some(task) = running_task {
        if task.st.get(&*lock) == TaskSt::Running {
            Some(task.effective_priority.get(&*lock))
        } else {
            None
        }
    } else {
        None
    }
}

/// Implements `PortToKernel::choose_running_task`.
#[inline]
pub(super) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<Traits>,
) {
    // The priority of `running_task`
    let prev_running_task = Traits::state().running_task(lock.borrow_mut());
    let prev_task_priority = running_task_priority(lock.borrow_mut());

    // Decide the next task to run
    let decision = Traits::state()
        .task_ready_queue
        .pop_front_task(lock.borrow_mut().into(), prev_task_priority);

    let next_running_task = match decision {
        readyqueue::ScheduleDecision::SwitchTo(task) => task,

        // There's no task willing to take over the current one, and the
        // current one can still run.
        readyqueue::ScheduleDecision::Keep => {
            debug_assert!(prev_task_priority.is_some());
            return;
        }
    };

    if let Some(task) = next_running_task {
        // Transition `next_running_task` into the Running state
        task.st.replace(&mut *lock, TaskSt::Running);

        if ptr_from_option_ref(prev_running_task) == task {
            // Skip the remaining steps if `task == prev_running_task`
            return;
        }
    } else if prev_running_task.is_none() {
        // Idle, and stays idle
        return;
    }

    // `prev_running_task` now loses the control of the processor.
    if let Some(running_task) = prev_running_task {
        match running_task.st.get(&*lock) {
            TaskSt::Running => {
                // Preempted: transition `prev_running_task` into Ready at
                // the front of its band - it was runnable before its
                // equal-priority peers and keeps its turn.
                running_task.st.replace(&mut *lock, TaskSt::Ready);
                // Safety: The previous state is Running, so this is safe
                unsafe {
                    Traits::state()
                        .task_ready_queue
                        .push_front_task(lock.borrow_mut().into(), running_task);
                }
            }
            TaskSt::Waiting | TaskSt::Suspended | TaskSt::Dormant => {
                // `prev_running_task` already left the Running state.
            }
            TaskSt::Ready => {
                // `prev_running_task` was already rotated into the ready
                // queue (round-robin or `yield_now`).
            }
        }
    }

    Traits::state()
        .running_task
        .replace(&mut *lock, next_running_task);

    let switches = Traits::state().context_switch_count.get(&*lock);
    Traits::state()
        .context_switch_count
        .replace(&mut *lock, switches + 1);
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}

/// Transition the currently running task into the Waiting state. Returns
/// when woken up.
///
/// The current context must be a task context (this function doesn't check
/// that).
pub(super) fn wait_until_woken_up<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    debug_assert!(Traits::is_task_context());

    // Transition the current task to Waiting
    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();
    assert_eq!(running_task.st.get(&*lock), TaskSt::Running);
    running_task.st.replace(&mut *lock, TaskSt::Waiting);

    park_running_task(lock, running_task);
}

/// Relinquish the processor until `running_task` (the caller's task, which
/// has already been transitioned out of the Running state) is chosen to run
/// again.
fn park_running_task<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    running_task: &'static TaskCb<Traits>,
) {
    loop {
        // Temporarily release the CPU Lock before calling `yield_cpu`
        // Safety: (1) We don't access resources protected by CPU Lock.
        //         (2) We currently have CPU Lock.
        //         (3) We will re-acquire a CPU Lock before returning from
        //             this function.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Re-acquire a CPU Lock
        unsafe { Traits::enter_cpu_lock() };

        if *running_task.st.read(&*lock) == TaskSt::Running {
            break;
        }
    }
}

/// Implements `System::yield_now`.
pub(super) fn yield_current_task<Traits: KernelTraits>() -> Result {
    if !Traits::is_task_context() {
        return Err(Errno::Invalid);
    }
    let mut lock = klock::lock_cpu::<Traits>()?;

    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    // Rotate the task to the back of its priority band
    // Safety: The previous state is Running
    unsafe { make_ready(lock.borrow_mut(), running_task) };

    unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Round-robin accounting, called by the tick handler with each tick.
///
/// When the running task's quantum is exhausted and another Ready task
/// occupies the same effective-priority band, the running task rotates to
/// the band's tail. Rotation never crosses bands.
pub(super) fn handle_time_slice<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    if Traits::TIME_SLICE_TICKS == 0 {
        return;
    }

    let running_task = match Traits::state().running_task(lock.borrow_mut()) {
        Some(task) if task.st.get(&*lock) == TaskSt::Running => task,
        _ => return,
    };

    let remaining = running_task.time_slice.get(&*lock).saturating_sub(1);
    running_task.time_slice.replace(&mut *lock, remaining);

    if remaining > 0 {
        return;
    }

    // Quantum exhausted; refill it
    running_task
        .time_slice
        .replace(&mut *lock, Traits::TIME_SLICE_TICKS);

    let pri = running_task.effective_priority.get(&*lock);
    if Traits::state()
        .task_ready_queue
        .has_ready_task_at(lock.borrow_mut().into(), pri)
    {
        // Safety: The previous state is Running
        unsafe { make_ready(lock.borrow_mut(), running_task) };
    }
}

/// Implements `System::suspend`.
pub(super) fn suspend_current_task<Traits: KernelTraits>() -> Result {
    if !Traits::is_task_context() {
        return Err(Errno::Invalid);
    }
    let lock = klock::lock_cpu::<Traits>()?;
    suspend_current_task_inner(lock)
}

fn suspend_current_task_inner<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result {
    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    transition_to_suspended(lock.borrow_mut(), running_task);
    park_running_task(lock.borrow_mut(), running_task);

    // `Ok(())` if resumed normally, `Err(Interrupted)` if woken by a signal
    running_task.wait.wait_result(lock.borrow_mut())
}

/// Move a task (whose previous state is Running or Ready, already detached
/// from the ready queue) onto the suspended list.
fn transition_to_suspended<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    task_cb.st.replace(&mut *lock, TaskSt::Suspended);
    task_cb.wait.set_wait_result(lock.borrow_mut(), Ok(()));

    insert_into_suspend_list(lock, task_cb);
}

/// Insert a Suspended task into the suspended list, keeping it sorted by
/// effective priority (descending), FIFO within a priority.
fn insert_into_suspend_list<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    let pri = task_cb.effective_priority.get(&*lock);

    let mut accessor = suspend_list_accessor!(lock.borrow_mut());
    let mut insert_at = None;
    let mut cursor = accessor.back();
    while let Some(at) = cursor {
        let at_pri = *accessor.pool()[at]
            .effective_priority
            .read(&**accessor.cell_key());
        if at_pri < pri {
            insert_at = Some(at);
            cursor = accessor.prev(at);
        } else {
            break;
        }
    }
    accessor.insert(Ident(task_cb), insert_at);
}

/// Reposition a Suspended task within the suspended list after a change in
/// its effective priority.
pub(crate) fn reposition_in_suspend_list<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    debug_assert_eq!(task_cb.st.get(&*lock), TaskSt::Suspended);

    suspend_list_accessor!(lock.borrow_mut()).remove(Ident(task_cb));
    insert_into_suspend_list(lock, task_cb);
}

/// Remove a task from the suspended list and make it Ready, delivering
/// `wait_result` as the outcome of a `System::suspend` call (if the task was
/// suspended that way).
pub(crate) fn unsuspend_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    wait_result: Result,
) {
    debug_assert_eq!(task_cb.st.get(&*lock), TaskSt::Suspended);

    suspend_list_accessor!(lock.borrow_mut()).remove(Ident(task_cb));
    task_cb.wait.set_wait_result(lock.borrow_mut(), wait_result);
    task_cb
        .time_slice
        .replace(&mut *lock, Traits::TIME_SLICE_TICKS);

    // Safety: the task was Suspended, so its execution context is valid
    unsafe { make_ready(lock, task_cb) };
}

/// Implements `System::exit_task`.
pub(super) unsafe fn exit_current_task<Traits: KernelTraits>(
) -> Result<core::convert::Infallible> {
    if !Traits::is_task_context() {
        return Err(Errno::Invalid);
    }

    // If CPU Lock is inactive, activate it.
    let mut lock = unsafe {
        if !Traits::is_cpu_lock_active() {
            Traits::enter_cpu_lock();
        }
        klock::assume_cpu_lock::<Traits>()
    };

    let running_task = Traits::state().running_task(lock.borrow_mut()).unwrap();

    // Abandon mutexes, handing each one to its next waiter (if any)
    mutex::abandon_held_mutexes(lock.borrow_mut(), running_task);
    debug_assert!(running_task.last_mutex_held.get(&*lock).is_none());

    // The termination hook runs inside the critical section just before the
    // forced context switch
    if let Some(hook) = running_task.attr.exit_hook {
        hook();
    }

    // Transition the current task to Dormant
    assert_eq!(running_task.st.get(&*lock), TaskSt::Running);
    running_task.st.replace(&mut *lock, TaskSt::Dormant);

    // Erase `running_task`; the dispatch performed by `exit_and_dispatch`
    // accounts for the context switch
    Traits::state().running_task.replace(&mut *lock, None);

    core::mem::forget(lock);

    // Safety: (1) The user of `exit_task` acknowledges that all preexisting
    // data on the task stack will be invalidated and has promised that this
    // will not cause any UBs. (2) CPU Lock active
    unsafe {
        Traits::exit_and_dispatch(running_task);
    }
}

/// Implements `System::sleep_until`.
pub(super) fn put_current_task_on_sleep_until<Traits: KernelTraits>(deadline: Tick) -> Result {
    if !Traits::is_task_context() {
        return Err(Errno::Invalid);
    }
    let mut lock = klock::lock_cpu::<Traits>()?;

    // Wait until woken up by timeout
    match wait::wait_no_queue_until(lock.borrow_mut(), wait::WaitPayload::Sleep, deadline) {
        Ok(_) => unreachable!(),
        Err(Errno::TimedOut) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Implements `System::sleep_for`.
pub(super) fn put_current_task_on_sleep_for<Traits: KernelTraits>(ticks: Ticks) -> Result {
    if !Traits::is_task_context() {
        return Err(Errno::Invalid);
    }
    let mut lock = klock::lock_cpu::<Traits>()?;

    let deadline = timeout::tick_count(lock.borrow_mut()) + ticks as Tick;
    match wait::wait_no_queue_until(lock.borrow_mut(), wait::WaitPayload::Sleep, deadline) {
        Ok(_) => unreachable!(),
        Err(Errno::TimedOut) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Implements `TaskCb::set_priority`.
fn set_task_base_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    task_cb: &'static TaskCb<Traits>,
    base_priority: Priority,
) -> Result {
    // Validate the given priority
    if base_priority as usize >= Traits::NUM_TASK_PRIORITY_LEVELS {
        return Err(Errno::Invalid);
    }

    let st = task_cb.st.get(&*lock);

    if st == TaskSt::Dormant {
        return Err(Errno::Invalid);
    }

    let old_base_priority = task_cb.base_priority.get(&*lock);

    if old_base_priority == base_priority {
        return Ok(());
    }

    // Fail with `EINVAL` if the operation would violate the ceiling of the
    // locking protocol used in any of the held or waited mutexes. The check
    // is only needed when raising the priority.
    if base_priority > old_base_priority {
        if !mutex::do_held_mutexes_allow_new_task_base_priority(
            lock.borrow_mut(),
            task_cb,
            base_priority,
        ) {
            return Err(Errno::Invalid);
        }

        let waited_mutex = wait::with_current_wait_payload(lock.borrow_mut(), task_cb, |payload| {
            if let Some(&wait::WaitPayload::Mutex(mutex_cb)) = payload {
                Some(mutex_cb)
            } else {
                None
            }
        });
        if let Some(waited_mutex) = waited_mutex {
            if !mutex::does_mutex_allow_task_base_priority(
                lock.borrow_mut(),
                waited_mutex,
                base_priority,
            ) {
                return Err(Errno::Invalid);
            }
        }
    }

    // Recalculate `effective_priority` according to the locking protocol of
    // held mutexes
    task_cb.base_priority.replace(&mut *lock, base_priority);
    update_effective_priority(lock.borrow_mut(), task_cb);

    // - If `st == TaskSt::Running` and the priority was lowered, the task
    //   could be preempted by a task in the Ready state.
    // - If `st == TaskSt::Ready` and the priority was raised, it could
    //   preempt the currently running task.
    // - If `st == TaskSt::Waiting`, the change may have propagated along an
    //   inheritance chain to a Ready task.
    unlock_cpu_and_check_preemption(lock);

    Ok(())
}

/// Recompute a task's effective priority from its base priority and held
/// mutexes, repositioning it in whatever priority-ordered structure it
/// currently occupies. Propagates along the priority-inheritance chain if
/// the task is itself waiting for an inheritance-protocol mutex.
pub(crate) fn update_effective_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mut task_cb: &'static TaskCb<Traits>,
) {
    loop {
        let base_priority = task_cb.base_priority.get(&*lock);
        let effective_priority =
            mutex::evaluate_task_effective_priority(lock.borrow_mut(), task_cb, base_priority);
        let old_effective_priority = task_cb
            .effective_priority
            .replace(&mut *lock, effective_priority);

        if old_effective_priority == effective_priority {
            return;
        }

        match task_cb.st.get(&*lock) {
            TaskSt::Ready => {
                // Move the task within the ready queue
                //
                // Safety: `task_cb` was previously inserted to the ready
                // queue with `old_effective_priority`.
                unsafe {
                    Traits::state().task_ready_queue.reorder_task(
                        lock.borrow_mut().into(),
                        task_cb,
                        effective_priority,
                        old_effective_priority,
                    );
                }
                return;
            }
            TaskSt::Running | TaskSt::Dormant => return,
            TaskSt::Suspended => {
                reposition_in_suspend_list(lock.borrow_mut(), task_cb);
                return;
            }
            TaskSt::Waiting => {
                // Reposition the task in the wait queue it's waiting on
                wait::reorder_wait_of_task(lock.borrow_mut(), task_cb);

                // If the task is waiting for a priority-inheritance mutex,
                // the mutex owner's effective priority depends on this
                // task's; continue along the chain.
                let waited_mutex =
                    wait::with_current_wait_payload(lock.borrow_mut(), task_cb, |payload| {
                        if let Some(&wait::WaitPayload::Mutex(mutex_cb)) = payload {
                            Some(mutex_cb)
                        } else {
                            None
                        }
                    });
                let next = waited_mutex.and_then(|mutex_cb| {
                    mutex::inheritance_donation_target(lock.borrow_mut(), mutex_cb)
                });
                match next {
                    Some(owner) => task_cb = owner,
                    None => return,
                }
            }
        }
    }
}
