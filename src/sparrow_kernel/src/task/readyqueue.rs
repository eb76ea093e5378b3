//! Task ready queue implementation (internal use only).
//!
//! **This module is exempt from the API stability guarantee.**
use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::TaskCb,
    utils::{
        intrusive_list::{Ident, ListAccessorCell, Static, StaticLink, StaticListHead},
        Init, PrioBitmap,
    },
    KernelCfg, KernelTraits, PortThreading, Priority,
};
use core::fmt;

/// Represents a task ready queue, which tracks the Ready tasks, segregated
/// and selected by effective priority (larger = more urgent).
///
/// This trait is not intended to be implemented on custom types.
pub trait Queue<Traits>: Send + Sync + Init + fmt::Debug + 'static + private::Sealed {
    type PerTaskData: Send + Sync + Init + fmt::Debug + 'static;

    /// Return a flag indicating whether there's a Ready task whose effective
    /// priority is more urgent than `priority`.
    fn has_ready_task_above(&self, ctx: Ctx<'_, Traits>, priority: Priority) -> bool
    where
        Traits: KernelTraits;

    /// Return a flag indicating whether there's a Ready task whose effective
    /// priority is exactly `priority`.
    fn has_ready_task_at(&self, ctx: Ctx<'_, Traits>, priority: Priority) -> bool
    where
        Traits: KernelTraits;

    /// Insert the specified task `task_cb` to the ready queue.
    ///
    /// `task_cb` is inserted at the back of its effective priority band:
    /// tasks of equal effective priority run in FIFO order.
    ///
    /// # Safety
    ///
    /// This method will cause an undefined behavior if `task_cb` is already
    /// included in the queue.
    unsafe fn push_back_task(&self, ctx: Ctx<'_, Traits>, task_cb: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits;

    /// Insert the specified task `task_cb` at the front of its effective
    /// priority band. Used for a preempted Running task, which keeps its
    /// turn relative to equal-priority peers.
    ///
    /// # Safety
    ///
    /// This method will cause an undefined behavior if `task_cb` is already
    /// included in the queue.
    unsafe fn push_front_task(&self, ctx: Ctx<'_, Traits>, task_cb: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits;

    /// Choose the next task to schedule based on `prev_task_priority`, the
    /// effective priority of the current task (or `None` if there's no
    /// schedulable current task, in which case this method always returns
    /// `SwitchTo(_)`).
    ///
    /// If this method returns `SwitchTo(Some(task))`, `task` is removed from
    /// the queue. `Keep` means the current task should continue to run.
    fn pop_front_task(
        &self,
        ctx: Ctx<'_, Traits>,
        prev_task_priority: Option<Priority>,
    ) -> ScheduleDecision<&'static TaskCb<Traits>>
    where
        Traits: KernelTraits;

    /// Reposition the specified task within the ready queue after a change
    /// in its effective priority from `old_effective_priority` to
    /// `effective_priority`. The task is re-inserted at the back of its new
    /// priority band.
    ///
    /// The caller should ensure `old_effective_priority` is not identical to
    /// `effective_priority`.
    ///
    /// # Safety
    ///
    /// This method will cause an undefined behavior if `task_cb` is not
    /// included in the queue or was lastly inserted to the queue with an
    /// effective priority that is not identical to `old_effective_priority`.
    unsafe fn reorder_task(
        &self,
        ctx: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        effective_priority: Priority,
        old_effective_priority: Priority,
    ) where
        Traits: KernelTraits;

    /// Remove the specified task from the ready queue.
    ///
    /// # Safety
    ///
    /// This method will cause an undefined behavior if `task_cb` is not
    /// included in the queue or was lastly inserted to the queue with an
    /// effective priority that is not identical to `effective_priority`.
    unsafe fn remove_task(
        &self,
        ctx: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        effective_priority: Priority,
    ) where
        Traits: KernelTraits;
}

/// Implements [the sealed trait pattern], which protects [`Queue`] against
/// downstream implementations.
///
/// [the sealed trait pattern]: https://rust-lang.github.io/api-guidelines/future-proofing.html
mod private {
    pub trait Sealed {}
}

/// The result type of [`Queue::pop_front_task`].
pub enum ScheduleDecision<T> {
    /// The kernel should not perform a context switch and should continue to
    /// schedule the current task.
    Keep,
    /// The kernel should perform a context switch to the specified task.
    SwitchTo(Option<T>),
}

/// The context type for [`Queue`].
pub struct Ctx<'a, Traits: KernelTraits> {
    pub(super) lock: CpuLockTokenRefMut<'a, Traits>,
}

impl<'a, Traits: KernelTraits> From<CpuLockTokenRefMut<'a, Traits>> for Ctx<'a, Traits> {
    #[inline]
    fn from(lock: CpuLockTokenRefMut<'a, Traits>) -> Self {
        Self { lock }
    }
}

/// The ready queue implementation that uses a set of queues segregated by
/// the priorities of contained tasks.
pub struct BitmapQueue<
    Traits: PortThreading + KernelCfg,
    PortTaskState: 'static,
    Bitmap: 'static,
    const LEN: usize,
> {
    /// The set of segregated task ready queues, in which each queue stores
    /// the list of Ready tasks at the corresponding priority.
    ///
    /// Invariant: `queues[i].first.is_some() == bitmap.get(i)`
    queues: [CpuLockCell<Traits, StaticListHead<BitmapQueueTaskCb<Traits, PortTaskState>>>; LEN],

    /// The task ready bitmap, in which each bit indicates whether the
    /// segregated queue corresponding to that bit contains a task or not.
    bitmap: CpuLockCell<Traits, Bitmap>,
}

impl<
        Traits: PortThreading + KernelCfg,
        PortTaskState: 'static,
        Bitmap: 'static + Init,
        const LEN: usize,
    > Init for BitmapQueue<Traits, PortTaskState, Bitmap, LEN>
{
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        queues: Init::INIT,
        bitmap: Init::INIT,
    };
}

type BitmapQueueTaskCb<Traits, PortTaskState> =
    TaskCb<Traits, PortTaskState, BitmapQueuePerTaskData<Traits, PortTaskState>>;

pub struct BitmapQueuePerTaskData<Traits: PortThreading + KernelCfg, PortTaskState: 'static> {
    link: CpuLockCell<Traits, Option<StaticLink<BitmapQueueTaskCb<Traits, PortTaskState>>>>,
}

impl<Traits: PortThreading + KernelCfg, PortTaskState: 'static> Init
    for BitmapQueuePerTaskData<Traits, PortTaskState>
{
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { link: Init::INIT };
}

impl<Traits: KernelTraits, PortTaskState: 'static> fmt::Debug
    for BitmapQueuePerTaskData<Traits, PortTaskState>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BitmapQueuePerTaskData").finish_non_exhaustive()
    }
}

// Safety: the contents are only accessible with CPU Lock held
unsafe impl<Traits: PortThreading + KernelCfg, PortTaskState, Bitmap, const LEN: usize> Send
    for BitmapQueue<Traits, PortTaskState, Bitmap, LEN>
{
}
unsafe impl<Traits: PortThreading + KernelCfg, PortTaskState, Bitmap, const LEN: usize> Sync
    for BitmapQueue<Traits, PortTaskState, Bitmap, LEN>
{
}
unsafe impl<Traits: PortThreading + KernelCfg, PortTaskState> Send
    for BitmapQueuePerTaskData<Traits, PortTaskState>
{
}
unsafe impl<Traits: PortThreading + KernelCfg, PortTaskState> Sync
    for BitmapQueuePerTaskData<Traits, PortTaskState>
{
}

/// Get a `ListAccessorCell` used to access a task ready queue.
macro_rules! list_accessor {
    ($head:expr, $key:expr) => {
        ListAccessorCell::new($head, &Static, |task_cb| &task_cb.ready_queue_data.link, $key)
    };
}

impl<Traits: KernelTraits, Bitmap: PrioBitmap, const LEN: usize> Queue<Traits>
    for BitmapQueue<Traits, <Traits as PortThreading>::PortTaskState, Bitmap, LEN>
where
    Traits: KernelCfg<TaskReadyQueue = Self>,
{
    type PerTaskData = BitmapQueuePerTaskData<Traits, <Traits as PortThreading>::PortTaskState>;

    #[inline]
    fn has_ready_task_above(&self, Ctx { lock }: Ctx<'_, Traits>, priority: Priority) -> bool {
        match self.bitmap.read(&*lock).find_set() {
            Some(top) => top > priority as usize,
            None => false,
        }
    }

    #[inline]
    fn has_ready_task_at(&self, Ctx { lock }: Ctx<'_, Traits>, priority: Priority) -> bool {
        self.bitmap.read(&*lock).get(priority as usize)
    }

    #[inline]
    unsafe fn push_back_task(
        &self,
        Ctx { mut lock }: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
    ) {
        let pri = *task_cb.effective_priority.read(&*lock) as usize;

        list_accessor!(&self.queues[pri], lock.borrow_mut()).push_back(Ident(task_cb));

        // Update `bitmap` accordingly
        self.bitmap.write(&mut *lock).set(pri);
    }

    #[inline]
    unsafe fn push_front_task(
        &self,
        Ctx { mut lock }: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
    ) {
        let pri = *task_cb.effective_priority.read(&*lock) as usize;

        list_accessor!(&self.queues[pri], lock.borrow_mut()).push_front(Ident(task_cb));

        self.bitmap.write(&mut *lock).set(pri);
    }

    #[inline]
    fn pop_front_task(
        &self,
        Ctx { mut lock }: Ctx<'_, Traits>,
        prev_task_priority: Option<Priority>,
    ) -> ScheduleDecision<&'static TaskCb<Traits>> {
        // The priority of the most urgent Ready task, if any
        let next_task_priority = self.bitmap.read(&*lock).find_set();

        match (prev_task_priority, next_task_priority) {
            // The current task can continue to run.
            (Some(prev), Some(next)) if next <= prev as usize => ScheduleDecision::Keep,
            (Some(_), None) => ScheduleDecision::Keep,

            // There's a task to take over, or no schedulable task at all.
            (_, Some(next)) => {
                // Take the first task from the ready queue corresponding to
                // `next`
                let mut accessor = list_accessor!(&self.queues[next], lock.borrow_mut());
                // There must be at least one element, because the bitmap
                // indicated so
                let task = accessor.pop_front().unwrap().0;

                // Update `bitmap` accordingly
                if accessor.is_empty() {
                    self.bitmap.write(&mut *lock).clear(next);
                }

                ScheduleDecision::SwitchTo(Some(task))
            }
            (None, None) => ScheduleDecision::SwitchTo(None),
        }
    }

    #[inline]
    unsafe fn reorder_task(
        &self,
        Ctx { mut lock }: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        effective_priority: Priority,
        old_effective_priority: Priority,
    ) {
        debug_assert_ne!(effective_priority, old_effective_priority);

        // Safety: `task_cb` is linked to the list for `old_effective_priority`
        unsafe {
            self.remove_task(lock.borrow_mut().into(), task_cb, old_effective_priority);
        }

        let pri = effective_priority as usize;
        list_accessor!(&self.queues[pri], lock.borrow_mut()).push_back(Ident(task_cb));
        self.bitmap.write(&mut *lock).set(pri);
    }

    #[inline]
    unsafe fn remove_task(
        &self,
        Ctx { mut lock }: Ctx<'_, Traits>,
        task_cb: &'static TaskCb<Traits>,
        effective_priority: Priority,
    ) {
        let pri = effective_priority as usize;
        let empty = {
            let mut accessor = list_accessor!(&self.queues[pri], lock.borrow_mut());
            accessor.remove(Ident(task_cb));
            accessor.is_empty()
        };

        if empty {
            self.bitmap.write(&mut *lock).clear(pri);
        }
    }
}

impl<
        Traits: PortThreading + KernelCfg,
        PortTaskState: 'static,
        Bitmap: 'static,
        const LEN: usize,
    > fmt::Debug for BitmapQueue<Traits, PortTaskState, Bitmap, LEN>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("BitmapQueue { .. }")
    }
}

impl<Traits: KernelTraits, Bitmap: PrioBitmap, const LEN: usize> private::Sealed
    for BitmapQueue<Traits, <Traits as PortThreading>::PortTaskState, Bitmap, LEN>
where
    Traits: KernelCfg<TaskReadyQueue = Self>,
{
}
