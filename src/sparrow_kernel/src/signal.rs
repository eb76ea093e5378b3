//! Signals
//!
//! Each task carries a pending-signal bitset and a signal mask (32 signals,
//! numbered 0..32). Raising an unmasked signal at a blocked task interrupts
//! its blocking operation with `EINTR`; a task blocked in
//! [`System::sig_wait`] on a set containing the raised signal consumes it
//! instead. Signal-handler dispatch is out of the kernel's scope - only the
//! unblocking interaction is implemented here.
use core::ptr::NonNull;

use crate::{
    error::{Errno, Result},
    klock, task,
    task::{TaskCb, TaskSt},
    timeout,
    utils::Init,
    wait::{self, WaitPayload},
    KernelTraits, PortThreading, System, Tick, Ticks,
};

/// A set of signals, one bit per signal number.
pub type SignalSet = u32;

/// The number of supported signals.
pub const NUM_SIGNALS: u8 = 32;

/// The per-task signal state, stored in each [`TaskCb`].
pub(crate) struct TaskSignalState<Traits: PortThreading> {
    /// Signals raised at the task and not yet consumed.
    pending: klock::CpuLockCell<Traits, SignalSet>,

    /// Signals that do not interrupt the task's blocking operations.
    mask: klock::CpuLockCell<Traits, SignalSet>,
}

impl<Traits: PortThreading> Init for TaskSignalState<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        pending: Init::INIT,
        mask: Init::INIT,
    };
}

/// Reset the signal state on task activation.
pub(crate) fn reset<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
) {
    task_cb.sig.pending.replace(&mut *lock, 0);
    task_cb.sig.mask.replace(&mut *lock, 0);
}

impl<Traits: KernelTraits> TaskCb<Traits> {
    /// Raise a signal at this task.
    ///
    /// If the task is blocked in [`System::sig_wait`] on a set containing
    /// `signo`, the signal is consumed and delivered to it. Otherwise the
    /// signal becomes pending and, unless masked, interrupts the task's
    /// blocking operation (or suspension) with `EINTR`.
    pub fn raise(&'static self, signo: u8) -> Result {
        if signo >= NUM_SIGNALS {
            return Err(Errno::Invalid);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;

        if self.st.get(&*lock) == TaskSt::Dormant {
            return Err(Errno::Invalid);
        }

        let bit: SignalSet = 1 << signo;

        // A task blocked in `sig_wait` on a matching set consumes the
        // signal directly
        if self.st.get(&*lock) == TaskSt::Waiting {
            let delivered =
                wait::with_current_wait_payload(lock.borrow_mut(), self, |payload| {
                    match payload {
                        Some(&WaitPayload::SignalWait { set, out_signo }) if set & bit != 0 => {
                            // Safety: `out_signo` points into the waiting
                            // task's live stack frame
                            unsafe { out_signo.as_ptr().write(signo) };
                            true
                        }
                        _ => false,
                    }
                });
            if delivered {
                wait::interrupt_task(lock.borrow_mut(), self, Ok(()))?;
                task::unlock_cpu_and_check_preemption(lock);
                return Ok(());
            }
        }

        let pending = self.sig.pending.get(&*lock);
        self.sig.pending.replace(&mut *lock, pending | bit);

        // An unmasked signal cuts any blocking operation short
        if self.sig.mask.get(&*lock) & bit == 0 {
            if let TaskSt::Waiting | TaskSt::Suspended = self.st.get(&*lock) {
                wait::interrupt_task(lock.borrow_mut(), self, Err(Errno::Interrupted))?;
                task::unlock_cpu_and_check_preemption(lock);
            }
        }

        Ok(())
    }

    /// Get the task's pending-signal set.
    pub fn pending_signals(&'static self) -> Result<SignalSet> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.sig.pending.get(&*lock))
    }

    /// Get the task's signal mask.
    pub fn signal_mask(&'static self) -> Result<SignalSet> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.sig.mask.get(&*lock))
    }

    /// Replace the task's signal mask. Masked signals stay pending but do
    /// not interrupt blocking operations.
    pub fn set_signal_mask(&'static self, mask: SignalSet) -> Result {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.sig.mask.replace(&mut *lock, mask);
        Ok(())
    }
}

impl<Traits: KernelTraits> System<Traits> {
    /// Consume and return the lowest pending signal in `set`, blocking until
    /// one is raised.
    pub fn sig_wait(set: SignalSet) -> Result<u8> {
        let mut lock = Self::sig_wait_prologue()?;

        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        if let Some(signo) = take_pending(lock.borrow_mut(), task, set) {
            return Ok(signo);
        }

        let mut out_signo: u8 = 0;
        wait::wait_no_queue(
            lock.borrow_mut(),
            WaitPayload::SignalWait {
                set,
                out_signo: NonNull::from(&mut out_signo),
            },
        )?;
        Ok(out_signo)
    }

    /// Consume and return the lowest pending signal in `set` without
    /// blocking; `EAGAIN` if none is pending.
    pub fn try_sig_wait(set: SignalSet) -> Result<u8> {
        let mut lock = Self::sig_wait_prologue()?;

        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        take_pending(lock.borrow_mut(), task, set).ok_or(Errno::Again)
    }

    /// As [`Self::sig_wait`], giving up with `ETIMEDOUT` when the tick
    /// counter reaches `deadline`.
    pub fn sig_wait_until(set: SignalSet, deadline: Tick) -> Result<u8> {
        let mut lock = Self::sig_wait_prologue()?;

        let task = Traits::state().running_task(lock.borrow_mut()).unwrap();
        if let Some(signo) = take_pending(lock.borrow_mut(), task, set) {
            return Ok(signo);
        }

        let mut out_signo: u8 = 0;
        wait::wait_no_queue_until(
            lock.borrow_mut(),
            WaitPayload::SignalWait {
                set,
                out_signo: NonNull::from(&mut out_signo),
            },
            deadline,
        )?;
        Ok(out_signo)
    }

    /// As [`Self::sig_wait`], giving up with `ETIMEDOUT` after `ticks`
    /// ticks.
    pub fn sig_wait_for(set: SignalSet, ticks: Ticks) -> Result<u8> {
        let mut lock = Self::sig_wait_prologue()?;
        let deadline = timeout::tick_count(lock.borrow_mut()) + ticks as Tick;
        drop(lock);
        Self::sig_wait_until(set, deadline)
    }

    fn sig_wait_prologue() -> Result<klock::CpuLockGuard<Traits>> {
        if !Traits::is_task_context() {
            return Err(Errno::Invalid);
        }
        klock::lock_cpu::<Traits>()
    }
}

/// Consume the lowest pending signal in `set`, if any.
fn take_pending<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    set: SignalSet,
) -> Option<u8> {
    let pending = task_cb.sig.pending.get(&*lock);
    let matching = pending & set;
    if matching == 0 {
        return None;
    }

    let signo = matching.trailing_zeros() as u8;
    task_cb
        .sig
        .pending
        .replace(&mut *lock, pending & !(1 << signo));
    Some(signo)
}
