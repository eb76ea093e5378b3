//! Semaphores
//!
//! A counting semaphore. When a token is posted while tasks are waiting, the
//! poster completes the rendezvous: the most urgent oldest waiter is handed
//! the token directly and the semaphore's value is never observed to change.
//! `post` and `try_wait` are ISR-safe.
use core::fmt;

use crate::{
    error::{Errno, Result},
    klock, task, timeout,
    wait::{QueueOrder, WaitPayload, WaitQueue},
    KernelCfg, KernelTraits, PortThreading, Tick, Ticks,
};

/// The value type of semaphores.
pub type SemaphoreValue = usize;

/// *Semaphore control block* - the state data of a semaphore.
pub struct SemaphoreCb<Traits: PortThreading + KernelCfg> {
    value: klock::CpuLockCell<Traits, SemaphoreValue>,
    max_value: SemaphoreValue,

    wait_queue: WaitQueue<Traits>,
}

// Safety: the interior-mutable fields are only accessed with CPU Lock held
unsafe impl<Traits: PortThreading + KernelCfg> Send for SemaphoreCb<Traits> {}
unsafe impl<Traits: PortThreading + KernelCfg> Sync for SemaphoreCb<Traits> {}

impl<Traits: PortThreading + KernelCfg> SemaphoreCb<Traits> {
    /// Construct a `SemaphoreCb` with the given initial value and the
    /// inclusive maximum value.
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new(value: SemaphoreValue, max_value: SemaphoreValue) -> Self {
        assert!(value <= max_value);
        Self {
            value: klock::CpuLockCell::new(value),
            max_value,
            wait_queue: WaitQueue::new(QueueOrder::TaskPriority),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("value", &self.value)
            .field("max_value", &self.max_value)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> SemaphoreCb<Traits> {
    /// Get the current semaphore value.
    pub fn value(&'static self) -> Result<SemaphoreValue> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.value.get(&*lock))
    }

    /// Acquire a token, blocking until one is available.
    pub fn wait(&'static self) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if !Traits::is_task_context() {
            return Err(Errno::Invalid);
        }

        if poll_core(self.value.write(&mut *lock)) {
            Ok(())
        } else {
            // The current state does not satisfy the wait condition. Start
            // waiting; the wake-upper will grant the token.
            self.wait_queue
                .wait(lock.borrow_mut(), WaitPayload::Semaphore)
        }
    }

    /// Acquire a token without blocking. Fails with `EAGAIN` if none is
    /// available. ISR-safe.
    pub fn try_wait(&'static self) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if poll_core(self.value.write(&mut *lock)) {
            Ok(())
        } else {
            Err(Errno::Again)
        }
    }

    /// Acquire a token, giving up with `ETIMEDOUT` when the tick counter
    /// reaches `deadline`.
    pub fn wait_until(&'static self, deadline: Tick) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if !Traits::is_task_context() {
            return Err(Errno::Invalid);
        }

        if poll_core(self.value.write(&mut *lock)) {
            Ok(())
        } else {
            self.wait_queue
                .wait_until(lock.borrow_mut(), WaitPayload::Semaphore, deadline)
        }
    }

    /// Acquire a token, giving up with `ETIMEDOUT` after `ticks` ticks.
    pub fn wait_for(&'static self, ticks: Ticks) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        if !Traits::is_task_context() {
            return Err(Errno::Invalid);
        }

        if poll_core(self.value.write(&mut *lock)) {
            Ok(())
        } else {
            let deadline = timeout::tick_count(lock.borrow_mut()) + ticks as Tick;
            self.wait_queue
                .wait_until(lock.borrow_mut(), WaitPayload::Semaphore, deadline)
        }
    }

    /// Release a token. If a task is waiting, the token is handed to the
    /// most urgent oldest waiter; otherwise the value is incremented.
    /// Fails with `EOVERFLOW` if the value would exceed the maximum.
    /// ISR-safe.
    pub fn post(&'static self) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if self.wait_queue.wake_up_one(lock.borrow_mut()) {
            // The rendezvous is completed by us, the poster: the woken task
            // returns with the token it was waiting for, and the semaphore
            // value stays untouched.
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        let value = self.value.get(&*lock);
        if value >= self.max_value {
            return Err(Errno::Overflow);
        }
        self.value.replace(&mut *lock, value + 1);

        Ok(())
    }
}

/// Check if the current state of a semaphore, `value`, satisfies the wait
/// condition.
///
/// If `value` satisfies the wait condition, this function updates `value`
/// and returns `true`. Otherwise, it returns `false`.
#[inline]
fn poll_core(value: &mut SemaphoreValue) -> bool {
    if *value > 0 {
        *value -= 1;
        true
    } else {
        false
    }
}
