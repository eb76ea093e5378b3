//! Message and FIFO queues, typed and raw
//!
//! All four queue flavors share one bounded core ([`QueueCb`]): a free-slot
//! list plus an ordered used-entry list over statically sized slot storage.
//! Message queues order elements by (descending priority, arrival order);
//! FIFO queues ignore priority.
//!
//! # Rendezvous
//!
//! When an operation finds a blocked task on the *opposite* waiter list, the
//! element bypasses the buffer entirely: the bytes are moved directly
//! between the two tasks' memory regions, inside the scheduler critical
//! section, by the side performing the wake-up. A pop from a non-empty
//! buffer additionally refills the freed slot from the first blocked
//! pusher. Capacity-0 queues therefore degenerate to a pure rendezvous
//! channel. This is what makes the `try_*` variants safe to call from the
//! tick interrupt and software timer actions.
use core::{cell::UnsafeCell, fmt, mem, mem::MaybeUninit, ptr, ptr::NonNull};

use arrayvec::ArrayVec;

use crate::{
    error::{Errno, Result},
    klock, task, timeout,
    utils::Init,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelCfg, KernelTraits, PortThreading, Priority, Tick, Ticks,
};

/// How the used-entry list is ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discipline {
    /// Strict arrival order.
    Fifo,
    /// Descending element priority, arrival order within a priority.
    Priority,
}

/// How long an operation may wait for its precondition.
enum Mode {
    NonBlocking,
    Blocking,
    Until(Tick),
}

/// An element held in the buffer: its priority and the slot storing its
/// payload bytes.
#[derive(Debug, Clone, Copy)]
struct Entry {
    prio: Priority,
    slot: usize,
}

/// The slot bookkeeping of a queue.
struct QueueState<const CAP: usize> {
    /// Slots that were used and freed, available for reuse.
    free: ArrayVec<usize, CAP>,

    /// The elements currently buffered. `used[0]` is the next element to be
    /// popped.
    used: ArrayVec<Entry, CAP>,

    /// The high-water mark of slot allocation. Slots
    /// `next_never_used..CAP` have never been part of `free` or `used`.
    next_never_used: usize,
}

impl<const CAP: usize> QueueState<CAP> {
    fn alloc_slot(&mut self) -> Option<usize> {
        self.free.pop().or_else(|| {
            if self.next_never_used < CAP {
                let slot = self.next_never_used;
                self.next_never_used += 1;
                Some(slot)
            } else {
                None
            }
        })
    }

    fn insert_entry(&mut self, discipline: Discipline, entry: Entry) {
        let at = match discipline {
            Discipline::Fifo => self.used.len(),
            Discipline::Priority => self
                .used
                .iter()
                .position(|e| e.prio < entry.prio)
                .unwrap_or(self.used.len()),
        };
        self.used.insert(at, entry);
    }
}

/// The state data shared by all queue flavors.
struct QueueCb<Traits: PortThreading + KernelCfg, const CAP: usize> {
    discipline: Discipline,

    /// The distance between consecutive slots in the backing storage.
    stride: usize,

    /// The exact size of an element. For raw queues this is a runtime
    /// attribute (≤ `stride`); for typed queues it equals `stride`.
    item_size: usize,

    state: klock::CpuLockCell<Traits, QueueState<CAP>>,

    /// Tasks blocked because the queue was full.
    pusher_wait_queue: WaitQueue<Traits>,

    /// Tasks blocked because the queue was empty.
    popper_wait_queue: WaitQueue<Traits>,
}

// Safety: the interior-mutable fields are only accessed with CPU Lock held
unsafe impl<Traits: PortThreading + KernelCfg, const CAP: usize> Send for QueueCb<Traits, CAP> {}
unsafe impl<Traits: PortThreading + KernelCfg, const CAP: usize> Sync for QueueCb<Traits, CAP> {}

impl<Traits: PortThreading + KernelCfg, const CAP: usize> QueueCb<Traits, CAP> {
    #[allow(clippy::declare_interior_mutable_const)]
    const fn new(discipline: Discipline, stride: usize, item_size: usize) -> Self {
        Self {
            discipline,
            stride,
            item_size,
            state: klock::CpuLockCell::new(QueueState {
                free: ArrayVec::new_const(),
                used: ArrayVec::new_const(),
                next_never_used: 0,
            }),
            pusher_wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
            popper_wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
        }
    }
}

impl<Traits: KernelTraits, const CAP: usize> QueueCb<Traits, CAP> {
    #[inline]
    fn slot_ptr(&self, storage: *mut u8, slot: usize) -> *mut u8 {
        storage.wrapping_add(slot * self.stride)
    }

    /// The push algorithm over raw element bytes. `src` must point to
    /// `self.item_size` valid bytes that stay valid for the duration of the
    /// call (including while blocked).
    fn push_inner(
        &'static self,
        storage: *mut u8,
        prio: Priority,
        src: *const u8,
        mode: Mode,
    ) -> Result {
        if matches!(mode, Mode::Blocking | Mode::Until(_)) && !Traits::is_task_context() {
            return Err(Errno::Invalid);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        let size = self.item_size;

        // A task blocked in `pop` takes the element directly, skipping the
        // buffer
        let served = self
            .popper_wait_queue
            .wake_up_one_with(lock.borrow_mut(), |_, payload| match payload {
                WaitPayload::QueueRecv {
                    dst,
                    size: dst_size,
                    out_prio,
                } => {
                    debug_assert_eq!(*dst_size, size);
                    // Safety: both regions are live and `size` bytes long;
                    // the popper's stack frame outlives its Waiting state
                    unsafe {
                        ptr::copy_nonoverlapping(src, dst.as_ptr(), size);
                        out_prio.as_ptr().write(prio);
                    }
                }
                _ => unreachable!(),
            });
        if served.is_some() {
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        // Store into a buffer slot
        {
            let state = self.state.write(&mut *lock);
            if let Some(slot) = state.alloc_slot() {
                let discipline = self.discipline;
                state.insert_entry(discipline, Entry { prio, slot });
                // Safety: `slot < CAP`, and free slots are not aliased
                unsafe {
                    ptr::copy_nonoverlapping(src, self.slot_ptr(storage, slot), size);
                }
                return Ok(());
            }
        }

        // The queue is full
        let payload = WaitPayload::QueueSend {
            src: NonNull::new(src as *mut u8).unwrap(),
            size,
            prio,
        };
        match mode {
            Mode::NonBlocking => Err(Errno::Again),
            Mode::Blocking => self.pusher_wait_queue.wait(lock.borrow_mut(), payload),
            Mode::Until(deadline) => {
                self.pusher_wait_queue
                    .wait_until(lock.borrow_mut(), payload, deadline)
            }
        }
    }

    /// The pop algorithm over raw element bytes. On success, the element
    /// bytes are in `*dst` and its priority in `*out_prio`.
    fn pop_inner(
        &'static self,
        storage: *mut u8,
        dst: *mut u8,
        out_prio: *mut Priority,
        mode: Mode,
    ) -> Result {
        if matches!(mode, Mode::Blocking | Mode::Until(_)) && !Traits::is_task_context() {
            return Err(Errno::Invalid);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        let size = self.item_size;

        // Take the head element from the buffer
        let head = {
            let state = self.state.write(&mut *lock);
            if state.used.is_empty() {
                None
            } else {
                let entry = state.used.remove(0);
                state.free.push(entry.slot);
                Some(entry)
            }
        };

        if let Some(entry) = head {
            // Safety: the slot holds a valid element; `dst` is `size` bytes
            unsafe {
                ptr::copy_nonoverlapping(self.slot_ptr(storage, entry.slot), dst, size);
                *out_prio = entry.prio;
            }

            // The freed slot can now accommodate the first blocked pusher
            self.pusher_wait_queue
                .wake_up_one_with(lock.borrow_mut(), |mut lk, payload| match payload {
                    WaitPayload::QueueSend {
                        src,
                        size: src_size,
                        prio,
                    } => {
                        debug_assert_eq!(*src_size, size);
                        let state = self.state.write(&mut *lk);
                        let slot = state.alloc_slot().unwrap();
                        let discipline = self.discipline;
                        state.insert_entry(discipline, Entry { prio: *prio, slot });
                        // Safety: the pusher's stack frame outlives its
                        // Waiting state
                        unsafe {
                            ptr::copy_nonoverlapping(
                                src.as_ptr(),
                                self.slot_ptr(storage, slot),
                                size,
                            );
                        }
                    }
                    _ => unreachable!(),
                });

            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        // The buffer is empty; a blocked pusher (capacity 0, or all slots
        // spoken for) hands its element over directly
        let served = self
            .pusher_wait_queue
            .wake_up_one_with(lock.borrow_mut(), |_, payload| match payload {
                WaitPayload::QueueSend {
                    src,
                    size: src_size,
                    prio,
                } => {
                    debug_assert_eq!(*src_size, size);
                    // Safety: both regions are live and `size` bytes long
                    unsafe {
                        ptr::copy_nonoverlapping(src.as_ptr(), dst, size);
                        *out_prio = *prio;
                    }
                }
                _ => unreachable!(),
            });
        if served.is_some() {
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        // The queue is empty
        let payload = WaitPayload::QueueRecv {
            dst: NonNull::new(dst).unwrap(),
            size,
            out_prio: NonNull::new(out_prio).unwrap(),
        };
        match mode {
            Mode::NonBlocking => Err(Errno::Again),
            Mode::Blocking => self.popper_wait_queue.wait(lock.borrow_mut(), payload),
            Mode::Until(deadline) => {
                self.popper_wait_queue
                    .wait_until(lock.borrow_mut(), payload, deadline)
            }
        }
    }

    fn len(&'static self) -> Result<usize> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.state.read(&*lock).used.len())
    }

    fn deadline_after(&'static self, ticks: Ticks) -> Result<Tick> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(timeout::tick_count(lock.borrow_mut()) + ticks as Tick)
    }
}

// Typed queues
// ---------------------------------------------------------------------------

/// Move `value` through `f` as raw bytes. If `f` succeeds, the value has
/// been moved out (into a queue slot or a popper's memory); if it fails, the
/// value is dropped here.
#[inline]
fn push_by_value<T, R>(value: T, f: impl FnOnce(*const u8) -> Result<R>) -> Result<R> {
    let value = mem::ManuallyDrop::new(value);
    let result = f(&*value as *const T as *const u8);
    if result.is_err() {
        // The value was not consumed
        // Safety: `value` is initialized and not yet dropped
        unsafe { ptr::drop_in_place(&*value as *const T as *mut T) };
    }
    result
}

/// Receive an element of type `T` through `f`.
#[inline]
fn pop_by_value<T>(f: impl FnOnce(*mut u8, *mut Priority) -> Result) -> Result<(Priority, T)> {
    let mut value = MaybeUninit::<T>::uninit();
    let mut prio: Priority = 0;
    f(value.as_mut_ptr() as *mut u8, &mut prio)?;
    // Safety: on success, the waking side (or the buffer copy) fully
    // initialized `value`
    Ok((prio, unsafe { value.assume_init() }))
}

/// A bounded queue of `T` ordered by (descending priority, arrival order).
pub struct MessageQueue<Traits: PortThreading + KernelCfg, T, const CAP: usize> {
    storage: UnsafeCell<[MaybeUninit<T>; CAP]>,
    queue: QueueCb<Traits, CAP>,
}

// Safety: elements are moved between tasks under CPU Lock
unsafe impl<Traits: PortThreading + KernelCfg, T: Send, const CAP: usize> Send
    for MessageQueue<Traits, T, CAP>
{
}
unsafe impl<Traits: PortThreading + KernelCfg, T: Send, const CAP: usize> Sync
    for MessageQueue<Traits, T, CAP>
{
}

impl<Traits: PortThreading + KernelCfg, T, const CAP: usize> MessageQueue<Traits, T, CAP> {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        Self {
            storage: UnsafeCell::new(Init::INIT),
            queue: QueueCb::new(Discipline::Priority, mem::size_of::<T>(), mem::size_of::<T>()),
        }
    }

    pub const fn capacity(&self) -> usize {
        CAP
    }

    #[inline]
    fn storage_ptr(&self) -> *mut u8 {
        self.storage.get() as *mut u8
    }
}

impl<Traits: KernelTraits, T: Send + 'static, const CAP: usize> MessageQueue<Traits, T, CAP> {
    /// The number of elements currently buffered.
    pub fn len(&'static self) -> Result<usize> {
        self.queue.len()
    }

    pub fn is_empty(&'static self) -> Result<bool> {
        Ok(self.queue.len()? == 0)
    }

    /// Push an element, blocking while the queue is full.
    pub fn push(&'static self, prio: Priority, value: T) -> Result {
        push_by_value(value, |src| {
            self.queue
                .push_inner(self.storage_ptr(), prio, src, Mode::Blocking)
        })
    }

    /// Push an element without blocking; `EAGAIN` if the queue is full.
    /// ISR-safe.
    pub fn try_push(&'static self, prio: Priority, value: T) -> Result {
        push_by_value(value, |src| {
            self.queue
                .push_inner(self.storage_ptr(), prio, src, Mode::NonBlocking)
        })
    }

    /// Push an element, giving up with `ETIMEDOUT` after `ticks` ticks.
    pub fn try_push_for(&'static self, ticks: Ticks, prio: Priority, value: T) -> Result {
        let deadline = self.queue.deadline_after(ticks)?;
        self.try_push_until(deadline, prio, value)
    }

    /// Push an element, giving up with `ETIMEDOUT` when the tick counter
    /// reaches `deadline`.
    pub fn try_push_until(&'static self, deadline: Tick, prio: Priority, value: T) -> Result {
        push_by_value(value, |src| {
            self.queue
                .push_inner(self.storage_ptr(), prio, src, Mode::Until(deadline))
        })
    }

    /// Pop the most urgent oldest element, blocking while the queue is
    /// empty. Returns the element and its priority.
    pub fn pop(&'static self) -> Result<(Priority, T)> {
        pop_by_value(|dst, out_prio| {
            self.queue
                .pop_inner(self.storage_ptr(), dst, out_prio, Mode::Blocking)
        })
    }

    /// Pop an element without blocking; `EAGAIN` if the queue is empty.
    /// ISR-safe.
    pub fn try_pop(&'static self) -> Result<(Priority, T)> {
        pop_by_value(|dst, out_prio| {
            self.queue
                .pop_inner(self.storage_ptr(), dst, out_prio, Mode::NonBlocking)
        })
    }

    /// Pop an element, giving up with `ETIMEDOUT` after `ticks` ticks.
    pub fn try_pop_for(&'static self, ticks: Ticks) -> Result<(Priority, T)> {
        let deadline = self.queue.deadline_after(ticks)?;
        self.try_pop_until(deadline)
    }

    /// Pop an element, giving up with `ETIMEDOUT` when the tick counter
    /// reaches `deadline`.
    pub fn try_pop_until(&'static self, deadline: Tick) -> Result<(Priority, T)> {
        pop_by_value(|dst, out_prio| {
            self.queue
                .pop_inner(self.storage_ptr(), dst, out_prio, Mode::Until(deadline))
        })
    }

    /// Construct an element in place: directly in the destination slot, or
    /// in a blocked popper's memory during a rendezvous. Blocks while the
    /// queue is full (the element is then materialized on the caller's
    /// stack first).
    #[cfg(feature = "emplace")]
    pub fn emplace_with(&'static self, prio: Priority, ctor: impl FnOnce() -> T) -> Result {
        self.emplace_inner(prio, ctor, Mode::Blocking)
    }

    /// As [`Self::emplace_with`], but fails with `EAGAIN` instead of
    /// blocking. ISR-safe.
    #[cfg(feature = "emplace")]
    pub fn try_emplace_with(&'static self, prio: Priority, ctor: impl FnOnce() -> T) -> Result {
        self.emplace_inner(prio, ctor, Mode::NonBlocking)
    }

    #[cfg(feature = "emplace")]
    fn emplace_inner(
        &'static self,
        prio: Priority,
        ctor: impl FnOnce() -> T,
        mode: Mode,
    ) -> Result {
        if matches!(mode, Mode::Blocking | Mode::Until(_)) && !Traits::is_task_context() {
            return Err(Errno::Invalid);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;

        // Construct directly into a blocked popper's memory
        let mut ctor = Some(ctor);
        let served = self
            .queue
            .popper_wait_queue
            .wake_up_one_with(lock.borrow_mut(), |_, payload| match payload {
                WaitPayload::QueueRecv { dst, out_prio, .. } => {
                    // Safety: the popper's stack frame outlives its Waiting
                    // state and holds room for a `T`
                    unsafe {
                        ptr::write(dst.as_ptr() as *mut T, (ctor.take().unwrap())());
                        out_prio.as_ptr().write(prio);
                    }
                }
                _ => unreachable!(),
            });
        if served.is_some() {
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        // Construct directly into a buffer slot
        {
            let state = self.queue.state.write(&mut *lock);
            if let Some(slot) = state.alloc_slot() {
                state.insert_entry(Discipline::Priority, Entry { prio, slot });
                // Safety: `slot < CAP`, and free slots are not aliased
                unsafe {
                    ptr::write(
                        self.queue.slot_ptr(self.storage_ptr(), slot) as *mut T,
                        (ctor.take().unwrap())(),
                    );
                }
                return Ok(());
            }
        }

        match mode {
            Mode::NonBlocking => Err(Errno::Again),
            // The queue is full; materialize the element and push it the
            // ordinary way once room becomes available
            mode => {
                drop(lock);
                push_by_value((ctor.take().unwrap())(), |src| {
                    self.queue.push_inner(self.storage_ptr(), prio, src, mode)
                })
            }
        }
    }
}

impl<Traits: PortThreading + KernelCfg, T, const CAP: usize> fmt::Debug for MessageQueue<Traits, T, CAP> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MessageQueue").finish_non_exhaustive()
    }
}

/// A bounded queue of `T` in strict arrival order.
pub struct FifoQueue<Traits: PortThreading + KernelCfg, T, const CAP: usize> {
    storage: UnsafeCell<[MaybeUninit<T>; CAP]>,
    queue: QueueCb<Traits, CAP>,
}

// Safety: elements are moved between tasks under CPU Lock
unsafe impl<Traits: PortThreading + KernelCfg, T: Send, const CAP: usize> Send for FifoQueue<Traits, T, CAP> {}
unsafe impl<Traits: PortThreading + KernelCfg, T: Send, const CAP: usize> Sync for FifoQueue<Traits, T, CAP> {}

impl<Traits: PortThreading + KernelCfg, T, const CAP: usize> FifoQueue<Traits, T, CAP> {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        Self {
            storage: UnsafeCell::new(Init::INIT),
            queue: QueueCb::new(Discipline::Fifo, mem::size_of::<T>(), mem::size_of::<T>()),
        }
    }

    pub const fn capacity(&self) -> usize {
        CAP
    }

    #[inline]
    fn storage_ptr(&self) -> *mut u8 {
        self.storage.get() as *mut u8
    }
}

impl<Traits: KernelTraits, T: Send + 'static, const CAP: usize> FifoQueue<Traits, T, CAP> {
    /// The number of elements currently buffered.
    pub fn len(&'static self) -> Result<usize> {
        self.queue.len()
    }

    pub fn is_empty(&'static self) -> Result<bool> {
        Ok(self.queue.len()? == 0)
    }

    /// Push an element, blocking while the queue is full.
    pub fn push(&'static self, value: T) -> Result {
        push_by_value(value, |src| {
            self.queue
                .push_inner(self.storage_ptr(), 0, src, Mode::Blocking)
        })
    }

    /// Push an element without blocking; `EAGAIN` if the queue is full.
    /// ISR-safe.
    pub fn try_push(&'static self, value: T) -> Result {
        push_by_value(value, |src| {
            self.queue
                .push_inner(self.storage_ptr(), 0, src, Mode::NonBlocking)
        })
    }

    /// Push an element, giving up with `ETIMEDOUT` after `ticks` ticks.
    pub fn try_push_for(&'static self, ticks: Ticks, value: T) -> Result {
        let deadline = self.queue.deadline_after(ticks)?;
        push_by_value(value, |src| {
            self.queue
                .push_inner(self.storage_ptr(), 0, src, Mode::Until(deadline))
        })
    }

    /// Push an element, giving up with `ETIMEDOUT` when the tick counter
    /// reaches `deadline`.
    pub fn try_push_until(&'static self, deadline: Tick, value: T) -> Result {
        push_by_value(value, |src| {
            self.queue
                .push_inner(self.storage_ptr(), 0, src, Mode::Until(deadline))
        })
    }

    /// Pop the oldest element, blocking while the queue is empty.
    pub fn pop(&'static self) -> Result<T> {
        pop_by_value(|dst, out_prio| {
            self.queue
                .pop_inner(self.storage_ptr(), dst, out_prio, Mode::Blocking)
        })
        .map(|(_, value)| value)
    }

    /// Pop an element without blocking; `EAGAIN` if the queue is empty.
    /// ISR-safe.
    pub fn try_pop(&'static self) -> Result<T> {
        pop_by_value(|dst, out_prio| {
            self.queue
                .pop_inner(self.storage_ptr(), dst, out_prio, Mode::NonBlocking)
        })
        .map(|(_, value)| value)
    }

    /// Pop an element, giving up with `ETIMEDOUT` after `ticks` ticks.
    pub fn try_pop_for(&'static self, ticks: Ticks) -> Result<T> {
        let deadline = self.queue.deadline_after(ticks)?;
        self.try_pop_until(deadline)
    }

    /// Pop an element, giving up with `ETIMEDOUT` when the tick counter
    /// reaches `deadline`.
    pub fn try_pop_until(&'static self, deadline: Tick) -> Result<T> {
        pop_by_value(|dst, out_prio| {
            self.queue
                .pop_inner(self.storage_ptr(), dst, out_prio, Mode::Until(deadline))
        })
        .map(|(_, value)| value)
    }
}

impl<Traits: PortThreading + KernelCfg, T, const CAP: usize> fmt::Debug for FifoQueue<Traits, T, CAP> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FifoQueue").finish_non_exhaustive()
    }
}

// Raw queues
// ---------------------------------------------------------------------------

/// A bounded queue of raw byte elements ordered by (descending priority,
/// arrival order). The element size is a runtime attribute, at most `ITEM`
/// bytes; every operation validates its buffer against it and fails with
/// `EMSGSIZE` on mismatch, leaving the queue untouched.
pub struct RawMessageQueue<Traits: PortThreading + KernelCfg, const CAP: usize, const ITEM: usize> {
    storage: UnsafeCell<[[u8; ITEM]; CAP]>,
    queue: QueueCb<Traits, CAP>,
}

// Safety: elements are moved between tasks under CPU Lock
unsafe impl<Traits: PortThreading + KernelCfg, const CAP: usize, const ITEM: usize> Send
    for RawMessageQueue<Traits, CAP, ITEM>
{
}
unsafe impl<Traits: PortThreading + KernelCfg, const CAP: usize, const ITEM: usize> Sync
    for RawMessageQueue<Traits, CAP, ITEM>
{
}

impl<Traits: PortThreading + KernelCfg, const CAP: usize, const ITEM: usize>
    RawMessageQueue<Traits, CAP, ITEM>
{
    /// Construct a `RawMessageQueue` for elements of `item_size` bytes
    /// (`0 < item_size ≤ ITEM`).
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new(item_size: usize) -> Self {
        assert!(item_size > 0 && item_size <= ITEM);
        Self {
            storage: UnsafeCell::new([[0; ITEM]; CAP]),
            queue: QueueCb::new(Discipline::Priority, ITEM, item_size),
        }
    }

    pub const fn capacity(&self) -> usize {
        CAP
    }

    #[inline]
    fn storage_ptr(&self) -> *mut u8 {
        self.storage.get() as *mut u8
    }
}

impl<Traits: KernelTraits, const CAP: usize, const ITEM: usize> RawMessageQueue<Traits, CAP, ITEM> {
    /// The number of elements currently buffered.
    pub fn len(&'static self) -> Result<usize> {
        self.queue.len()
    }

    /// Push an element, blocking while the queue is full.
    pub fn push(&'static self, prio: Priority, data: &[u8]) -> Result {
        self.check_size(data.len())?;
        self.queue
            .push_inner(self.storage_ptr(), prio, data.as_ptr(), Mode::Blocking)
    }

    /// Push an element without blocking; `EAGAIN` if the queue is full.
    /// ISR-safe.
    pub fn try_push(&'static self, prio: Priority, data: &[u8]) -> Result {
        self.check_size(data.len())?;
        self.queue
            .push_inner(self.storage_ptr(), prio, data.as_ptr(), Mode::NonBlocking)
    }

    /// Push an element, giving up with `ETIMEDOUT` after `ticks` ticks.
    pub fn try_push_for(&'static self, ticks: Ticks, prio: Priority, data: &[u8]) -> Result {
        self.check_size(data.len())?;
        let deadline = self.queue.deadline_after(ticks)?;
        self.queue
            .push_inner(self.storage_ptr(), prio, data.as_ptr(), Mode::Until(deadline))
    }

    /// Push an element, giving up with `ETIMEDOUT` when the tick counter
    /// reaches `deadline`.
    pub fn try_push_until(&'static self, deadline: Tick, prio: Priority, data: &[u8]) -> Result {
        self.check_size(data.len())?;
        self.queue
            .push_inner(self.storage_ptr(), prio, data.as_ptr(), Mode::Until(deadline))
    }

    /// Pop the most urgent oldest element into `buffer`, blocking while the
    /// queue is empty. Returns the element's priority.
    pub fn pop(&'static self, buffer: &mut [u8]) -> Result<Priority> {
        self.check_size(buffer.len())?;
        let mut prio: Priority = 0;
        self.queue
            .pop_inner(self.storage_ptr(), buffer.as_mut_ptr(), &mut prio, Mode::Blocking)?;
        Ok(prio)
    }

    /// Pop an element without blocking; `EAGAIN` if the queue is empty.
    /// ISR-safe.
    pub fn try_pop(&'static self, buffer: &mut [u8]) -> Result<Priority> {
        self.check_size(buffer.len())?;
        let mut prio: Priority = 0;
        self.queue.pop_inner(
            self.storage_ptr(),
            buffer.as_mut_ptr(),
            &mut prio,
            Mode::NonBlocking,
        )?;
        Ok(prio)
    }

    /// Pop an element, giving up with `ETIMEDOUT` after `ticks` ticks.
    pub fn try_pop_for(&'static self, ticks: Ticks, buffer: &mut [u8]) -> Result<Priority> {
        self.check_size(buffer.len())?;
        let deadline = self.queue.deadline_after(ticks)?;
        let mut prio: Priority = 0;
        self.queue.pop_inner(
            self.storage_ptr(),
            buffer.as_mut_ptr(),
            &mut prio,
            Mode::Until(deadline),
        )?;
        Ok(prio)
    }

    /// Pop an element, giving up with `ETIMEDOUT` when the tick counter
    /// reaches `deadline`.
    pub fn try_pop_until(&'static self, deadline: Tick, buffer: &mut [u8]) -> Result<Priority> {
        self.check_size(buffer.len())?;
        let mut prio: Priority = 0;
        self.queue.pop_inner(
            self.storage_ptr(),
            buffer.as_mut_ptr(),
            &mut prio,
            Mode::Until(deadline),
        )?;
        Ok(prio)
    }

    /// Every raw operation validates the caller's buffer size against the
    /// queue's element size before touching any state.
    #[inline]
    fn check_size(&self, size: usize) -> Result {
        if size != self.queue.item_size {
            Err(Errno::MessageSize)
        } else {
            Ok(())
        }
    }
}

impl<Traits: PortThreading + KernelCfg, const CAP: usize, const ITEM: usize> fmt::Debug
    for RawMessageQueue<Traits, CAP, ITEM>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RawMessageQueue").finish_non_exhaustive()
    }
}

/// A bounded queue of raw byte elements in strict arrival order.
///
/// Shares every property of [`RawMessageQueue`] except that element
/// priorities are ignored.
pub struct RawFifoQueue<Traits: PortThreading + KernelCfg, const CAP: usize, const ITEM: usize> {
    storage: UnsafeCell<[[u8; ITEM]; CAP]>,
    queue: QueueCb<Traits, CAP>,
}

// Safety: elements are moved between tasks under CPU Lock
unsafe impl<Traits: PortThreading + KernelCfg, const CAP: usize, const ITEM: usize> Send
    for RawFifoQueue<Traits, CAP, ITEM>
{
}
unsafe impl<Traits: PortThreading + KernelCfg, const CAP: usize, const ITEM: usize> Sync
    for RawFifoQueue<Traits, CAP, ITEM>
{
}

impl<Traits: PortThreading + KernelCfg, const CAP: usize, const ITEM: usize> RawFifoQueue<Traits, CAP, ITEM> {
    /// Construct a `RawFifoQueue` for elements of `item_size` bytes
    /// (`0 < item_size ≤ ITEM`).
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new(item_size: usize) -> Self {
        assert!(item_size > 0 && item_size <= ITEM);
        Self {
            storage: UnsafeCell::new([[0; ITEM]; CAP]),
            queue: QueueCb::new(Discipline::Fifo, ITEM, item_size),
        }
    }

    pub const fn capacity(&self) -> usize {
        CAP
    }

    #[inline]
    fn storage_ptr(&self) -> *mut u8 {
        self.storage.get() as *mut u8
    }
}

impl<Traits: KernelTraits, const CAP: usize, const ITEM: usize> RawFifoQueue<Traits, CAP, ITEM> {
    /// The number of elements currently buffered.
    pub fn len(&'static self) -> Result<usize> {
        self.queue.len()
    }

    /// Push an element, blocking while the queue is full.
    pub fn push(&'static self, data: &[u8]) -> Result {
        self.check_size(data.len())?;
        self.queue
            .push_inner(self.storage_ptr(), 0, data.as_ptr(), Mode::Blocking)
    }

    /// Push an element without blocking; `EAGAIN` if the queue is full.
    /// ISR-safe.
    pub fn try_push(&'static self, data: &[u8]) -> Result {
        self.check_size(data.len())?;
        self.queue
            .push_inner(self.storage_ptr(), 0, data.as_ptr(), Mode::NonBlocking)
    }

    /// Push an element, giving up with `ETIMEDOUT` after `ticks` ticks.
    pub fn try_push_for(&'static self, ticks: Ticks, data: &[u8]) -> Result {
        self.check_size(data.len())?;
        let deadline = self.queue.deadline_after(ticks)?;
        self.queue
            .push_inner(self.storage_ptr(), 0, data.as_ptr(), Mode::Until(deadline))
    }

    /// Push an element, giving up with `ETIMEDOUT` when the tick counter
    /// reaches `deadline`.
    pub fn try_push_until(&'static self, deadline: Tick, data: &[u8]) -> Result {
        self.check_size(data.len())?;
        self.queue
            .push_inner(self.storage_ptr(), 0, data.as_ptr(), Mode::Until(deadline))
    }

    /// Pop the oldest element into `buffer`, blocking while the queue is
    /// empty.
    pub fn pop(&'static self, buffer: &mut [u8]) -> Result {
        self.check_size(buffer.len())?;
        let mut prio: Priority = 0;
        self.queue
            .pop_inner(self.storage_ptr(), buffer.as_mut_ptr(), &mut prio, Mode::Blocking)
    }

    /// Pop an element without blocking; `EAGAIN` if the queue is empty.
    /// ISR-safe.
    pub fn try_pop(&'static self, buffer: &mut [u8]) -> Result {
        self.check_size(buffer.len())?;
        let mut prio: Priority = 0;
        self.queue.pop_inner(
            self.storage_ptr(),
            buffer.as_mut_ptr(),
            &mut prio,
            Mode::NonBlocking,
        )
    }

    /// Pop an element, giving up with `ETIMEDOUT` after `ticks` ticks.
    pub fn try_pop_for(&'static self, ticks: Ticks, buffer: &mut [u8]) -> Result {
        self.check_size(buffer.len())?;
        let deadline = self.queue.deadline_after(ticks)?;
        let mut prio: Priority = 0;
        self.queue.pop_inner(
            self.storage_ptr(),
            buffer.as_mut_ptr(),
            &mut prio,
            Mode::Until(deadline),
        )
    }

    /// Pop an element, giving up with `ETIMEDOUT` when the tick counter
    /// reaches `deadline`.
    pub fn try_pop_until(&'static self, deadline: Tick, buffer: &mut [u8]) -> Result {
        self.check_size(buffer.len())?;
        let mut prio: Priority = 0;
        self.queue.pop_inner(
            self.storage_ptr(),
            buffer.as_mut_ptr(),
            &mut prio,
            Mode::Until(deadline),
        )
    }

    #[inline]
    fn check_size(&self, size: usize) -> Result {
        if size != self.queue.item_size {
            Err(Errno::MessageSize)
        } else {
            Ok(())
        }
    }
}

impl<Traits: PortThreading + KernelCfg, const CAP: usize, const ITEM: usize> fmt::Debug
    for RawFifoQueue<Traits, CAP, ITEM>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RawFifoQueue").finish_non_exhaustive()
    }
}
