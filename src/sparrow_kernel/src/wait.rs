//! Wait objects and wait queues: the kernel's blocking protocol.
//!
//! A blocking primitive describes *what it's waiting for* with a [`Wait`]
//! object constructed on the blocking task's stack. The object carries a
//! [`WaitPayload`] with whatever the waking side needs to complete the
//! operation on the waiter's behalf (e.g., the memory locations to move a
//! queue element between). The rendezvous is completed by the *waking* side,
//! inside the scheduler critical section; the woken task merely reads the
//! stored result. This is what allows interrupt-context code (software
//! timers, ISRs) to hand data to blocked tasks safely.
use core::{fmt, ops, ptr::NonNull};

use crate::{
    error::{Errno, Result},
    klock::{CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    mutex, task,
    task::{TaskCb, TaskSt},
    timeout,
    utils::{
        intrusive_list::{self, ListAccessorCell},
        Init,
    },
    KernelCfg, KernelTraits, PortThreading, Priority, Tick,
};

// Type definitions and trait implementations for wait lists
// ---------------------------------------------------------------------------

/// A reference to a [`Wait`].
pub(crate) struct WaitRef<Traits: PortThreading + KernelCfg>(NonNull<Wait<Traits>>);

// Safety: `Wait` is `Send + Sync`
unsafe impl<Traits: PortThreading + KernelCfg> Send for WaitRef<Traits> {}
unsafe impl<Traits: PortThreading + KernelCfg> Sync for WaitRef<Traits> {}

impl<Traits: PortThreading + KernelCfg> Clone for WaitRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading + KernelCfg> Copy for WaitRef<Traits> {}

impl<Traits: PortThreading + KernelCfg> fmt::Debug for WaitRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WaitRef").field(&self.0).finish()
    }
}

impl<Traits: PortThreading + KernelCfg> PartialEq for WaitRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: PortThreading + KernelCfg> Eq for WaitRef<Traits> {}

use self::unsafe_static::UnsafeStatic;
mod unsafe_static {
    use super::*;

    pub(crate) struct UnsafeStatic {
        _nonexhaustive: (),
    }

    impl UnsafeStatic {
        /// Construct an `UnsafeStatic`.
        ///
        /// # Safety
        ///
        /// All pointees to be accessed through the constructed `UnsafeStatic`
        /// must be valid.
        pub(crate) const unsafe fn new() -> &'static Self {
            &Self { _nonexhaustive: () }
        }
    }

    impl<Traits: PortThreading + KernelCfg> ops::Index<WaitRef<Traits>> for UnsafeStatic {
        type Output = Wait<Traits>;

        fn index(&self, index: WaitRef<Traits>) -> &Self::Output {
            // Safety: See `wait_queue_accessor`.
            unsafe { &*index.0.as_ptr() }
        }
    }
}

/// Get a `ListAccessorCell` used to access a wait queue.
///
/// # Safety
///
/// All elements of `$list` must be extant.
macro_rules! wait_queue_accessor {
    ($list:expr, $key:expr) => {
        ListAccessorCell::new(
            $list,
            UnsafeStatic::new(),
            |wait: &Wait<_>| &wait.link,
            $key,
        )
    };
}

// ---------------------------------------------------------------------------

/// *A wait object* describing *which task* is waiting on *what condition*.
///
/// # Lifetime
///
/// This object is constructed by `WaitQueue::wait` on a waiting task's
/// stack, and only survives until the method returns. This means that `Wait`
/// can expire only when the waiting task is not waiting anymore.
pub(crate) struct Wait<Traits: PortThreading + KernelCfg> {
    /// The task that is waiting for something.
    task: &'static TaskCb<Traits>,

    /// Forms a linked list headed by `wait_queue.waits`.
    link: CpuLockCell<Traits, Option<intrusive_list::Link<WaitRef<Traits>>>>,

    /// The containing [`WaitQueue`], if any.
    wait_queue: Option<&'static WaitQueue<Traits>>,

    payload: WaitPayload<Traits>,
}

/// Describes what the waking side must do to complete the wait operation,
/// specific to each waitable object type.
///
/// The raw pointers point into the waiting task's stack frame, which is
/// guaranteed to outlive the Waiting state.
pub(crate) enum WaitPayload<Traits: PortThreading + KernelCfg> {
    /// Waiting for a semaphore token. The poster grants the token by merely
    /// waking the task.
    Semaphore,

    /// Waiting for the ownership of a mutex. The unlocking task transfers
    /// the ownership before waking the waiter.
    Mutex(&'static mutex::MutexCb<Traits>),

    /// Waiting for room in a queue. The waking side moves `size` bytes out
    /// of `src` (into a queue slot or directly into a popper's memory).
    QueueSend {
        src: NonNull<u8>,
        size: usize,
        prio: Priority,
    },

    /// Waiting for a queue element. The waking side moves `size` bytes into
    /// `dst` and stores the element's priority to `out_prio`.
    QueueRecv {
        dst: NonNull<u8>,
        size: usize,
        out_prio: NonNull<Priority>,
    },

    /// A pure timed wait.
    Sleep,

    /// Waiting for any signal in `set`. The raiser stores the consumed
    /// signal number to `out_signo`.
    #[cfg(feature = "signals")]
    SignalWait { set: u32, out_signo: NonNull<u8> },
}

/// A queue of wait objects ([`Wait`]) waiting on a particular waitable
/// object.
pub(crate) struct WaitQueue<Traits: PortThreading + KernelCfg> {
    /// Wait objects waiting on the waitable object associated with this
    /// instance of `WaitQueue`. The waiting tasks (`Wait::task`) must be in
    /// the Waiting state.
    ///
    /// All elements of this linked list must be valid.
    waits: CpuLockCell<Traits, intrusive_list::ListHead<WaitRef<Traits>>>,

    order: QueueOrder,
}

impl<Traits: PortThreading + KernelCfg> Init for WaitQueue<Traits> {
    const INIT: Self = Self::new(QueueOrder::TaskPriority);
}

/// Specifies the sorting order of a wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueOrder {
    /// The wait queue is processed in a FIFO order.
    #[allow(dead_code)]
    Fifo,
    /// The wait queue is processed in a task priority order (most urgent
    /// first). Tasks with the same priorities follow a FIFO order.
    TaskPriority,
}

/// The wait state of a task.
pub(crate) struct TaskWait<Traits: PortThreading + KernelCfg> {
    /// The wait object describing the ongoing Waiting state of the task.
    /// Should be `None` iff the task is not in the Waiting state.
    ///
    /// The pointee must be valid.
    current_wait: CpuLockCell<Traits, Option<WaitRef<Traits>>>,

    /// The result of the last wait operation. Set by a wake-upper. Returned
    /// by [`WaitQueue::wait`] (and `System::suspend`).
    wait_result: CpuLockCell<Traits, Result>,
}

impl<Traits: PortThreading + KernelCfg> Init for TaskWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        current_wait: Init::INIT,
        wait_result: CpuLockCell::new(Ok(())),
    };
}

impl<Traits: KernelTraits> TaskWait<Traits> {
    pub(crate) fn set_wait_result(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        result: Result,
    ) {
        self.wait_result.replace(&mut *lock, result);
    }

    pub(crate) fn wait_result(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Result {
        self.wait_result.get(&*lock)
    }
}

impl<Traits: PortThreading + KernelCfg> WaitQueue<Traits> {
    /// Construct a `WaitQueue`.
    pub(crate) const fn new(order: QueueOrder) -> Self {
        Self {
            waits: CpuLockCell::new(intrusive_list::ListHead::new()),
            order,
        }
    }
}

impl<Traits: PortThreading + KernelCfg> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitQueue").field("order", &self.order).finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Insert a wait object pertaining to the currently running task to
    /// `self`, transitioning the task into the Waiting state.
    ///
    /// The current context must be a task context (this function doesn't
    /// check that).
    ///
    /// Returns the wait result: `Ok(())` for an unblock request (the waking
    /// side has completed the rendezvous), `Err(Interrupted)` for a signal.
    pub(crate) fn wait(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
    ) -> Result {
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        let wait = Wait {
            task,
            link: CpuLockCell::new(None),
            wait_queue: Some(self),
            payload,
        };

        self.wait_inner(lock, &wait)
    }

    /// As [`Self::wait`], but gives up with `Err(TimedOut)` when the tick
    /// counter reaches `deadline` before the wait completes.
    ///
    /// The timeout and a concurrent waker race inside the scheduler critical
    /// section, so exactly one of them completes the wait.
    pub(crate) fn wait_until(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
        deadline: Tick,
    ) -> Result {
        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        let wait = Wait {
            task,
            link: CpuLockCell::new(None),
            wait_queue: Some(self),
            payload,
        };

        let timeout = core::pin::pin!(timeout::Timeout::new(
            wake_task_on_timeout::<Traits>,
            task as *const TaskCb<Traits> as usize,
        )
        .with_expiration_at(deadline));
        let timeout = timeout.into_ref();

        timeout::insert_timeout(lock.borrow_mut(), timeout);

        // The guard unregisters the timeout on every exit path, including
        // the one where a waker completed the wait before the deadline.
        let mut guard = timeout::TimeoutGuard {
            timeout,
            lock: lock.borrow_mut(),
        };
        self.wait_inner(guard.lock.borrow_mut(), &wait)
    }

    /// The core portion of `Self::wait`.
    fn wait_inner(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        wait: &Wait<Traits>,
    ) -> Result {
        let task = wait.task;
        let wait_ref = WaitRef(wait.into());

        debug_assert!(core::ptr::eq(
            wait.task,
            Traits::state().running_task(lock.borrow_mut()).unwrap()
        ));
        debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

        // Insert `wait_ref` into `self.waits`
        self.insert_wait(lock.borrow_mut(), wait_ref);

        // Set `task.current_wait`
        task.wait.current_wait.replace(&mut *lock, Some(wait_ref));

        // Transition the task into Waiting. This statement will complete
        // when the task is woken up.
        task::wait_until_woken_up(lock.borrow_mut());

        // `wait_ref` should have been removed from the wait queue by a
        // wake-upper
        assert!(wait.link.read(&*lock).is_none());
        assert!(task.wait.current_wait.get(&*lock).is_none());

        // Return the wait result
        task.wait.wait_result.get(&*lock)
    }

    /// Insert `wait_ref` into `self.waits`, respecting `self.order`.
    fn insert_wait(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, wait_ref: WaitRef<Traits>) {
        // Safety: All elements of `self.waits` are extant.
        let mut accessor = unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) };

        let insert_at = match self.order {
            QueueOrder::Fifo => {
                // FIFO order - insert at the back
                None
            }
            QueueOrder::TaskPriority => {
                // Safety: `wait_ref` points to a valid `Wait`
                let cur_task_pri = *unsafe { wait_ref.0.as_ref() }
                    .task
                    .effective_priority
                    .read(&**accessor.cell_key());
                let mut insert_at = None;
                let mut cursor = accessor.back();
                while let Some(at) = cursor {
                    // Should the new wait object be inserted at this or an
                    // earlier position?
                    let at_pri = *accessor.pool()[at]
                        .task
                        .effective_priority
                        .read(&**accessor.cell_key());
                    if at_pri < cur_task_pri {
                        // If so, update `insert_at`. Continue searching
                        // because there might be a viable position that is
                        // even earlier.
                        insert_at = Some(at);
                        cursor = accessor.prev(at);
                    } else {
                        break;
                    }
                }
                insert_at
            }
        };
        accessor.insert(wait_ref, insert_at);
    }

    /// Wake up up to one waiting task, completing its wait with `Ok(())`.
    /// Returns `true` if it has successfully woken up a task.
    ///
    /// This method may make a task Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(crate) fn wake_up_one(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.wake_up_one_with(lock.borrow_mut(), |_, _| ()).is_some()
    }

    /// Wake up up to one waiting task, calling `f` with the wait object's
    /// payload before the task is made Ready. `f` performs the
    /// object-specific part of the rendezvous (e.g., moving a queue
    /// element) inside the critical section.
    ///
    /// This method may make a task Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(crate) fn wake_up_one_with<R>(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        f: impl FnOnce(CpuLockTokenRefMut<'_, Traits>, &WaitPayload<Traits>) -> R,
    ) -> Option<R> {
        // Get the first wait object
        // Safety: All elements of `self.waits` are extant.
        let wait_ref =
            unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) }.pop_front()?;

        // Safety: `wait_ref` points to a valid `Wait` because `wait_ref` was
        // in `self.waits` at the beginning of this function call.
        let wait = unsafe { wait_ref.0.as_ref() };

        debug_assert!(core::ptr::eq(wait.wait_queue.unwrap(), self));

        let result = f(lock.borrow_mut(), &wait.payload);

        complete_wait(lock.borrow_mut(), wait, Ok(()));

        Some(result)
    }

    /// The task which will be woken up by the next call to
    /// [`Self::wake_up_one`].
    pub(crate) fn first_waiting_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        // Safety: All elements of `self.waits` are extant.
        let accessor = unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) };
        let wait_ref = accessor.front()?;

        // Safety: `wait_ref` is in `self.waits`, so the pointee is valid
        Some(unsafe { wait_ref.0.as_ref() }.task)
    }

    pub(crate) fn is_empty(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        // Safety: All elements of `self.waits` are extant.
        unsafe { wait_queue_accessor!(&self.waits, lock.borrow_mut()) }.is_empty()
    }
}

/// The timeout callback for timed waits. `param` is the address of the
/// waiting `TaskCb`.
fn wake_task_on_timeout<Traits: KernelTraits>(
    _timeout: timeout::TimeoutRef<Traits>,
    param: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    // Safety: The `Timeout` holding this callback is unregistered by
    // `TimeoutGuard` before the `TaskCb`'s owner could ever invalidate it
    // (task control blocks are static anyway)
    let task = unsafe { &*(param as *const TaskCb<Traits>) };

    // If the task has already been woken up by a regular waker, this is a
    // no-op; the races are resolved by the critical section we're in.
    let _ = interrupt_task(lock.borrow_mut(), task, Err(Errno::TimedOut));

    lock
}

/// Call the given closure with a reference to the current wait payload
/// object of the specified task as the closure's parameter.
///
/// The wait object might get deallocated when the task starts running. This
/// function allows access to the wait object while ensuring the reference to
/// the wait object doesn't escape from the scope.
pub(crate) fn with_current_wait_payload<Traits: KernelTraits, R>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &TaskCb<Traits>,
    f: impl FnOnce(Option<&WaitPayload<Traits>>) -> R,
) -> R {
    let wait_ref = task_cb.wait.current_wait.get(&*lock.borrow_mut());

    // Safety: `wait_ref` must point to an existing `Wait`
    let payload = wait_ref.map(|r| &unsafe { &*r.0.as_ptr() }.payload);

    f(payload)
}

/// Insert a wait object pertaining to the currently running task but not
/// pertaining to any wait queue, transitioning the task into the Waiting
/// state, and arm a timeout for `deadline`.
///
/// The wait can end by the timeout (`Err(TimedOut)`) or by
/// [`interrupt_task`] (e.g., `Err(Interrupted)` for a signal).
pub(crate) fn wait_no_queue_until<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload<Traits>,
    deadline: Tick,
) -> Result {
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
    let wait = Wait {
        task,
        link: CpuLockCell::new(None),
        wait_queue: None,
        payload,
    };

    let timeout = core::pin::pin!(timeout::Timeout::new(
        wake_task_on_timeout::<Traits>,
        task as *const TaskCb<Traits> as usize,
    )
    .with_expiration_at(deadline));
    let timeout = timeout.into_ref();

    timeout::insert_timeout(lock.borrow_mut(), timeout);

    let mut guard = timeout::TimeoutGuard {
        timeout,
        lock: lock.borrow_mut(),
    };
    wait_no_queue_inner(guard.lock.borrow_mut(), &wait)
}

/// Insert a wait object pertaining to the currently running task but not
/// pertaining to any wait queue, transitioning the task into the Waiting
/// state.
///
/// The only way to end such a wait operation is [`interrupt_task`].
#[cfg(feature = "signals")]
pub(crate) fn wait_no_queue<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload<Traits>,
) -> Result {
    let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
    let wait = Wait {
        task,
        link: CpuLockCell::new(None),
        wait_queue: None,
        payload,
    };

    wait_no_queue_inner(lock, &wait)
}

/// The core portion of [`wait_no_queue_until`].
fn wait_no_queue_inner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    wait: &Wait<Traits>,
) -> Result {
    let task = wait.task;
    let wait_ref = WaitRef(wait.into());

    debug_assert!(core::ptr::eq(
        wait.task,
        Traits::state().running_task(lock.borrow_mut()).unwrap()
    ));
    debug_assert!(wait.wait_queue.is_none());
    debug_assert!(wait.link.read(&*lock).is_none());

    // Set `task.current_wait`
    task.wait.current_wait.replace(&mut *lock, Some(wait_ref));

    // Transition the task into Waiting. This statement will complete when
    // the task is woken up.
    task::wait_until_woken_up(lock.borrow_mut());

    // `wait_ref` should have been removed from `current_wait` by a
    // wake-upper
    assert!(task.wait.current_wait.get(&*lock).is_none());

    // Return the wait result
    task.wait.wait_result.get(&*lock)
}

/// Deassociate the specified wait object from its waiting task
/// (`wait.task`) and wake up the task.
///
/// This method doesn't remove `wait` from `WaitQueue::waits`.
///
/// This method may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    wait: &Wait<Traits>,
    wait_result: Result,
) {
    let task_cb = wait.task;

    // Clear `TaskWait::current_wait`
    assert_eq!(
        *task_cb.wait.current_wait.read(&*lock),
        Some(WaitRef(wait.into()))
    );
    task_cb.wait.current_wait.replace(&mut *lock, None);

    // Set a wait result
    task_cb.wait.wait_result.replace(&mut *lock, wait_result);

    assert_eq!(task_cb.st.get(&*lock), TaskSt::Waiting);

    // An unblocked task starts with a fresh round-robin quantum
    task_cb
        .time_slice
        .replace(&mut *lock, Traits::TIME_SLICE_TICKS);

    // Make the task Ready
    //
    // Safety: The task is in the Waiting state, meaning the task state is
    // valid and ready to resume from the point where it was previously
    // interrupted. A proper clean up for exiting the Waiting state is
    // already done as well.
    unsafe { task::make_ready(lock, task_cb) };
}

/// Interrupt any ongoing wait operation of the task, storing
/// `wait_result` as the outcome of the interrupted blocking call.
///
/// This also covers Suspended tasks, for which an `Err(Interrupted)` result
/// cuts the suspension short.
///
/// This method may make the task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
///
/// Returns `Err(EINVAL)` if the task is not in the Waiting or Suspended
/// state.
pub(crate) fn interrupt_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    wait_result: Result,
) -> Result {
    match task_cb.st.get(&*lock) {
        TaskSt::Waiting => {
            // Interrupt the ongoing wait operation.
            let wait_ref = task_cb.wait.current_wait.get(&*lock);

            // The task is in the Waiting state, so `wait_ref` must be
            // `Some(_)`
            let wait_ref = wait_ref.unwrap();

            // Safety: ... and `wait_ref` must point to an existing `Wait`
            let wait = unsafe { wait_ref.0.as_ref() };

            // Remove `wait` from the wait queue it belongs to
            if let Some(wait_queue) = wait.wait_queue {
                unsafe { wait_queue_accessor!(&wait_queue.waits, lock.borrow_mut()) }
                    .remove(wait_ref);
            }

            let cancelled_mutex = match (wait_result, &wait.payload) {
                (Err(_), &WaitPayload::Mutex(mutex_cb)) => Some(mutex_cb),
                _ => None,
            };

            // Wake up the task
            complete_wait(lock.borrow_mut(), wait, wait_result);

            // A waiter's departure may deflate the inherited priority of the
            // mutex owner
            if let Some(mutex_cb) = cancelled_mutex {
                mutex::on_waiter_removed(lock.borrow_mut(), mutex_cb);
            }

            Ok(())
        }
        TaskSt::Suspended => {
            task::unsuspend_task(lock, task_cb, wait_result);
            Ok(())
        }
        _ => Err(Errno::Invalid),
    }
}

/// Reposition the task's wait object within its wait queue after a change
/// in the task's effective priority.
pub(crate) fn reorder_wait_of_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task_cb: &TaskCb<Traits>,
) {
    let wait_ref = if let Some(wait_ref) = task_cb.wait.current_wait.get(&*lock) {
        wait_ref
    } else {
        return;
    };

    // Safety: `wait_ref` points to an existing `Wait`
    let wait = unsafe { wait_ref.0.as_ref() };

    if let Some(wait_queue) = wait.wait_queue {
        if wait_queue.order == QueueOrder::TaskPriority {
            unsafe { wait_queue_accessor!(&wait_queue.waits, lock.borrow_mut()) }
                .remove(wait_ref);
            wait_queue.insert_wait(lock, wait_ref);
        }
    }
}
