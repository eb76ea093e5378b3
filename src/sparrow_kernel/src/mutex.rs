//! Mutexes
//!
//! A mutex combines a *type* (what happens on relocking and misuse) with a
//! *locking protocol* (how contention affects the owner's effective
//! priority):
//!
//!  - [`MutexProtocol::None`]: contention has no effect on priorities.
//!  - [`MutexProtocol::Inherit`]: while tasks are blocked on the mutex, the
//!    owner's effective priority is at least the most urgent waiter's
//!    (classic transitive priority inheritance).
//!  - [`MutexProtocol::Protect`]: holding the mutex raises the owner to the
//!    mutex's priority ceiling; locking with a base priority above the
//!    ceiling is an error.
//!
//! On unlock, ownership transfers directly to the most urgent oldest
//! waiter; the rendezvous is completed by the unlocking side.
use core::fmt;

use crate::{
    error::{Errno, Result},
    klock, task,
    task::{readyqueue::Queue as _, TaskCb, TaskSt},
    timeout,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelCfg, KernelTraits, PortThreading, Priority, Tick, Ticks,
};

/// What happens when the owner locks a mutex again, and whether unlocking
/// by a non-owner is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexType {
    /// Relocking by the owner deadlocks the task.
    Normal,
    /// Relocking by the owner fails with `EDEADLK`.
    ErrorChecking,
    /// The mutex counts recursive locks by the owner.
    Recursive,
}

/// The locking protocol of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    /// No priority adjustment.
    None,
    /// Priority inheritance.
    Inherit,
    /// Priority protection with the given ceiling.
    Protect(Priority),
}

/// *Mutex control block* - the state data of a mutex.
pub struct MutexCb<Traits: PortThreading + KernelCfg> {
    mutex_type: MutexType,

    protocol: MutexProtocol,

    /// The task that currently owns the mutex lock.
    pub(crate) owning_task: klock::CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// The number of additional (recursive) locks held by the owner.
    recursion_count: klock::CpuLockCell<Traits, u16>,

    pub(crate) wait_queue: WaitQueue<Traits>,

    /// The next element in the singly-linked list headed by
    /// `TaskCb::last_mutex_held`, containing all mutexes currently held by
    /// the owning task.
    pub(crate) prev_mutex_held: klock::CpuLockCell<Traits, Option<&'static Self>>,
}

// Safety: the interior-mutable fields are only accessed with CPU Lock held
unsafe impl<Traits: PortThreading + KernelCfg> Send for MutexCb<Traits> {}
unsafe impl<Traits: PortThreading + KernelCfg> Sync for MutexCb<Traits> {}

impl<Traits: PortThreading + KernelCfg> MutexCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new(mutex_type: MutexType, protocol: MutexProtocol) -> Self {
        Self {
            mutex_type,
            protocol,
            owning_task: klock::CpuLockCell::new(None),
            recursion_count: klock::CpuLockCell::new(0),
            wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
            prev_mutex_held: klock::CpuLockCell::new(None),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("mutex_type", &self.mutex_type)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// The outcome of the non-blocking portion of a lock attempt.
enum Precheck {
    /// The lock was acquired (or the recursion count was bumped).
    Acquired,
    /// The mutex is held by another task (or by the caller, for a
    /// `Normal`-type mutex).
    MustWait,
}

impl<Traits: KernelTraits> MutexCb<Traits> {
    /// Acquire the mutex, blocking until it becomes available.
    pub fn lock(&'static self) -> Result {
        let mut lock = self.lock_prologue()?;

        match self.precheck(lock.borrow_mut())? {
            Precheck::Acquired => Ok(()),
            Precheck::MustWait => {
                self.prepare_to_wait(lock.borrow_mut());
                self.wait_queue
                    .wait(lock.borrow_mut(), WaitPayload::Mutex(self))
            }
        }
    }

    /// Acquire the mutex without blocking. Fails with `EBUSY` if the mutex
    /// is held by another task.
    pub fn try_lock(&'static self) -> Result {
        let mut lock = self.lock_prologue()?;

        match self.precheck(lock.borrow_mut())? {
            Precheck::Acquired => Ok(()),
            Precheck::MustWait => Err(Errno::Busy),
        }
    }

    /// Acquire the mutex, giving up with `ETIMEDOUT` when the tick counter
    /// reaches `deadline`.
    pub fn lock_until(&'static self, deadline: Tick) -> Result {
        let mut lock = self.lock_prologue()?;

        match self.precheck(lock.borrow_mut())? {
            Precheck::Acquired => Ok(()),
            Precheck::MustWait => {
                self.prepare_to_wait(lock.borrow_mut());
                self.wait_queue
                    .wait_until(lock.borrow_mut(), WaitPayload::Mutex(self), deadline)
            }
        }
    }

    /// Acquire the mutex, giving up with `ETIMEDOUT` after `ticks` ticks.
    pub fn lock_for(&'static self, ticks: Ticks) -> Result {
        let mut lock = self.lock_prologue()?;

        match self.precheck(lock.borrow_mut())? {
            Precheck::Acquired => Ok(()),
            Precheck::MustWait => {
                let deadline = timeout::tick_count(lock.borrow_mut()) + ticks as Tick;
                self.prepare_to_wait(lock.borrow_mut());
                self.wait_queue
                    .wait_until(lock.borrow_mut(), WaitPayload::Mutex(self), deadline)
            }
        }
    }

    /// Release the mutex. Only the owner may unlock; `EPERM` otherwise.
    pub fn unlock(&'static self) -> Result {
        let mut lock = self.lock_prologue()?;
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();

        if ptr_from_option_ref(self.owning_task.get(&*lock)) != task as *const _ {
            // The current task does not currently own the mutex.
            return Err(Errno::NotOwner);
        }

        if self.mutex_type == MutexType::Recursive {
            let count = self.recursion_count.get(&*lock);
            if count > 0 {
                self.recursion_count.replace(&mut *lock, count - 1);
                return Ok(());
            }
        }

        // Remove `self` from the list of the mutexes held by the task
        remove_from_held_list(lock.borrow_mut(), task, self);

        // Lower the task's effective priority if this mutex was inflating it
        task::update_effective_priority(lock.borrow_mut(), task);

        // Hand the ownership to the next waiter (if any)
        unlock_mutex_unchecked(lock.borrow_mut(), self);

        // The handed-off waiter (or a task unblocked by the priority drop)
        // may preempt us
        task::unlock_cpu_and_check_preemption(lock);

        Ok(())
    }

    /// Get a flag indicating whether the mutex is currently held.
    pub fn is_locked(&'static self) -> Result<bool> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.owning_task.get(&*lock).is_some())
    }

    /// The common entry validation of every mutex operation: mutexes are
    /// ownership-based and therefore task-context only.
    fn lock_prologue(&'static self) -> Result<klock::CpuLockGuard<Traits>> {
        if !Traits::is_task_context() {
            return Err(Errno::Invalid);
        }
        klock::lock_cpu::<Traits>()
    }

    /// Check the error conditions of a lock attempt and acquire the mutex if
    /// it's free.
    fn precheck(&'static self, mut lock: klock::CpuLockTokenRefMut<'_, Traits>) -> Result<Precheck> {
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();

        // A priority-protect mutex can't be locked by a task whose base
        // priority is above the ceiling, and the ceiling itself must be a
        // valid priority
        if let MutexProtocol::Protect(ceiling) = self.protocol {
            if ceiling as usize >= Traits::NUM_TASK_PRIORITY_LEVELS
                || task.base_priority.get(&*lock) > ceiling
            {
                return Err(Errno::Invalid);
            }
        }

        if ptr_from_option_ref(self.owning_task.get(&*lock)) == task as *const _ {
            return match self.mutex_type {
                MutexType::Recursive => {
                    let count = self.recursion_count.get(&*lock);
                    if count == u16::MAX {
                        Err(Errno::Again)
                    } else {
                        self.recursion_count.replace(&mut *lock, count + 1);
                        Ok(Precheck::Acquired)
                    }
                }
                MutexType::ErrorChecking => Err(Errno::Deadlock),
                // A `Normal` mutex lets the owner deadlock against itself
                MutexType::Normal => Ok(Precheck::MustWait),
            };
        }

        if self.owning_task.get(&*lock).is_none() {
            lock_core(lock.borrow_mut(), self, task);
            task::update_effective_priority(lock.borrow_mut(), task);
            Ok(Precheck::Acquired)
        } else {
            Ok(Precheck::MustWait)
        }
    }

    /// Donate the calling task's effective priority along the ownership
    /// chain before blocking on this mutex.
    fn prepare_to_wait(&'static self, mut lock: klock::CpuLockTokenRefMut<'_, Traits>) {
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        let waiter_priority = task.effective_priority.get(&*lock);

        donate_priority(lock, self, waiter_priority);
    }
}

/// Give the ownership of the mutex to `task`.
///
/// The task must be in the Running or Waiting state.
fn lock_core<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    task: &'static TaskCb<Traits>,
) {
    debug_assert!(matches!(
        task.st.get(&*lock),
        TaskSt::Running | TaskSt::Waiting
    ));
    debug_assert!(mutex_cb.owning_task.get(&*lock).is_none());

    mutex_cb.owning_task.replace(&mut *lock, Some(task));
    mutex_cb.recursion_count.replace(&mut *lock, 0);

    // Push `mutex_cb` to the list of the mutexes held by the task.
    let prev_mutex_held = task.last_mutex_held.replace(&mut *lock, Some(mutex_cb));
    mutex_cb.prev_mutex_held.replace(&mut *lock, prev_mutex_held);
}

/// Remove `mutex_cb` from the list of mutexes held by `task`.
fn remove_from_held_list<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    let prev = mutex_cb.prev_mutex_held.replace(&mut *lock, None);

    if ptr_from_option_ref(task.last_mutex_held.get(&*lock)) == mutex_cb as *const _ {
        task.last_mutex_held.replace(&mut *lock, prev);
        return;
    }

    // `mutex_cb` is somewhere in the middle of the held list
    let mut cursor = task.last_mutex_held.get(&*lock);
    while let Some(m) = cursor {
        let next = m.prev_mutex_held.get(&*lock);
        if ptr_from_option_ref(next) == mutex_cb as *const _ {
            m.prev_mutex_held.replace(&mut *lock, prev);
            return;
        }
        cursor = next;
    }

    debug_assert!(false, "mutex not in the held list");
}

/// Wake up the next waiter of the mutex, transferring the ownership to it,
/// or mark the mutex unowned.
///
/// This method may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` (or something similar) as needed.
fn unlock_mutex_unchecked<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    mutex_cb.owning_task.replace(&mut *lock, None);

    // Check if there's any other task waiting on the mutex
    if let Some(next_task) = mutex_cb.wait_queue.first_waiting_task(lock.borrow_mut()) {
        // Give the ownership of the mutex to `next_task`
        lock_core(lock.borrow_mut(), mutex_cb, next_task);

        // Wake up the next waiter
        assert!(mutex_cb.wait_queue.wake_up_one(lock.borrow_mut()));

        // The new owner's effective priority may rise (remaining waiters
        // under priority inheritance, or a priority-protect ceiling)
        task::update_effective_priority(lock.borrow_mut(), next_task);
    }
}

/// Abandon all mutexes held by the task, waking up the next waiters of the
/// mutexes (if any).
///
/// This method doesn't restore the task's effective priority.
///
/// This method may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` (or something similar) as needed.
pub(crate) fn abandon_held_mutexes<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let mut maybe_mutex_cb = task.last_mutex_held.replace(&mut *lock, None);
    while let Some(mutex_cb) = maybe_mutex_cb {
        maybe_mutex_cb = mutex_cb.prev_mutex_held.replace(&mut *lock, None);
        unlock_mutex_unchecked(lock.borrow_mut(), mutex_cb);
    }
}

/// Reevaluate the task's effective priority from its base priority and the
/// locking protocols of its held mutexes, and return the result. (This
/// method doesn't update [`TaskCb::effective_priority`].)
pub(crate) fn evaluate_task_effective_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    base_priority: Priority,
) -> Priority {
    let mut effective_priority = base_priority;
    let mut maybe_mutex_cb = task.last_mutex_held.get(&*lock);

    while let Some(mutex_cb) = maybe_mutex_cb {
        match mutex_cb.protocol {
            MutexProtocol::Protect(ceiling) => {
                effective_priority = effective_priority.max(ceiling);
            }
            MutexProtocol::Inherit => {
                if let Some(waiter) = mutex_cb.wait_queue.first_waiting_task(lock.borrow_mut()) {
                    effective_priority =
                        effective_priority.max(waiter.effective_priority.get(&*lock));
                }
            }
            MutexProtocol::None => {}
        }

        maybe_mutex_cb = mutex_cb.prev_mutex_held.get(&*lock);
    }

    effective_priority
}

/// Check if the task's held mutexes are all compatible with the new task
/// base priority according to the mutexes' locking protocols.
///
/// The check is only needed when raising the priority.
pub(crate) fn do_held_mutexes_allow_new_task_base_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    new_base_priority: Priority,
) -> bool {
    let mut maybe_mutex_cb = task.last_mutex_held.get(&*lock);
    while let Some(mutex_cb) = maybe_mutex_cb {
        if !does_mutex_allow_task_base_priority(lock.borrow_mut(), mutex_cb, new_base_priority) {
            return false;
        }

        maybe_mutex_cb = mutex_cb.prev_mutex_held.get(&*lock);
    }
    true
}

/// Check if the specified mutex, which is currently held or waited for by a
/// task, is compatible with the given task base priority according to the
/// mutex's locking protocol.
pub(crate) fn does_mutex_allow_task_base_priority<Traits: KernelTraits>(
    _lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    new_base_priority: Priority,
) -> bool {
    if let MutexProtocol::Protect(ceiling) = mutex_cb.protocol {
        if new_base_priority > ceiling {
            return false;
        }
    }

    true
}

/// If `mutex_cb` uses priority inheritance, the task its waiters donate
/// their priority to (the current owner).
pub(crate) fn inheritance_donation_target<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) -> Option<&'static TaskCb<Traits>> {
    if mutex_cb.protocol == MutexProtocol::Inherit {
        mutex_cb.owning_task.get(&*lock)
    } else {
        None
    }
}

/// A waiter left `mutex_cb`'s wait queue without acquiring the mutex
/// (timeout or signal). Deflate the owner's inherited priority accordingly.
pub(crate) fn on_waiter_removed<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    if mutex_cb.protocol != MutexProtocol::Inherit {
        return;
    }

    if let Some(owner) = mutex_cb.owning_task.get(&*lock) {
        task::update_effective_priority(lock, owner);
    }
}

/// Transitively raise the effective priority of the owners along the
/// inheritance chain starting at `mutex_cb` to at least `waiter_priority`.
///
/// Called right before the calling task enqueues itself as a waiter of
/// `mutex_cb` (classic chained priority inheritance).
fn donate_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    waiter_priority: Priority,
) {
    let mut maybe_mutex = Some(mutex_cb);

    while let Some(m) = maybe_mutex {
        if m.protocol != MutexProtocol::Inherit {
            return;
        }

        let owner = if let Some(owner) = m.owning_task.get(&*lock) {
            owner
        } else {
            return;
        };

        if owner.effective_priority.get(&*lock) >= waiter_priority {
            return;
        }

        let old_priority = owner
            .effective_priority
            .replace(&mut *lock, waiter_priority);

        match owner.st.get(&*lock) {
            TaskSt::Ready => {
                // Safety: `owner` is linked to the ready queue with
                // `old_priority`
                unsafe {
                    Traits::state().task_ready_queue.reorder_task(
                        lock.borrow_mut().into(),
                        owner,
                        waiter_priority,
                        old_priority,
                    );
                }
                return;
            }
            TaskSt::Running | TaskSt::Dormant => return,
            TaskSt::Suspended => {
                task::reposition_in_suspend_list(lock.borrow_mut(), owner);
                return;
            }
            TaskSt::Waiting => {
                crate::wait::reorder_wait_of_task(lock.borrow_mut(), owner);

                // If the owner is itself waiting for an inheritance-protocol
                // mutex, keep donating along the chain.
                maybe_mutex =
                    crate::wait::with_current_wait_payload(lock.borrow_mut(), owner, |payload| {
                        if let Some(&WaitPayload::Mutex(next)) = payload {
                            Some(next)
                        } else {
                            None
                        }
                    });
            }
        }
    }
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}
