//! Software timers
//!
//! A software timer calls a user-supplied action from the tick interrupt
//! handler when its deadline is reached. One-shot timers transition to the
//! stopped state before the action runs; periodic timers re-arm themselves
//! at `deadline + period` before the action runs. Actions run at the
//! tick-interrupt priority with CPU Lock released, so they may call the
//! ISR-safe (`try_*`) kernel operations, e.g., to push into a queue or post
//! a semaphore.
use core::fmt;

use crate::{
    error::{Errno, Result},
    klock::{assume_cpu_lock, lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    timeout,
    utils::{pin::static_pin, Init},
    KernelTraits, Tick, Ticks,
};

/// The static properties of a software timer.
pub struct TimerAttr<Traits> {
    /// The function called when the timer fires.
    pub entry_point: fn(usize),

    /// The parameter supplied for `entry_point`.
    pub entry_param: usize,

    _phantom: core::marker::PhantomData<Traits>,
}

impl<Traits> TimerAttr<Traits> {
    pub const fn new(entry_point: fn(usize), entry_param: usize) -> Self {
        Self {
            entry_point,
            entry_param,
            _phantom: core::marker::PhantomData,
        }
    }
}

impl<Traits> fmt::Debug for TimerAttr<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerAttr")
            .field("entry_point", &self.entry_point)
            .field("entry_param", &self.entry_param)
            .finish_non_exhaustive()
    }
}

/// *Timer control block* - the state data of a software timer.
///
/// `TimerCb` must be placed in static storage.
#[repr(C)]
pub struct TimerCb<Traits: KernelTraits> {
    /// The timeout object for the timer.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so
    /// that the timeout handler can recover the containing `TimerCb`.
    timeout: timeout::Timeout<Traits>,

    /// The static properties of the timer.
    attr: &'static TimerAttr<Traits>,

    /// The firing interval of a periodic timer, or `None` for a one-shot
    /// timer.
    period: CpuLockCell<Traits, Option<Ticks>>,

    /// `true` iff the timer is pending (started and not yet fired or
    /// stopped).
    active: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelTraits> TimerCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new(attr: &'static TimerAttr<Traits>) -> Self {
        Self {
            timeout: timeout::Timeout::new(timer_timeout_handler::<Traits>, 0),
            attr,
            period: Init::INIT,
            active: Init::INIT,
        }
    }

    /// Start the timer as a one-shot, firing when the tick counter reaches
    /// `deadline`. If the timer is already pending, it's moved to the new
    /// deadline.
    pub fn start_at(&'static self, deadline: Tick) -> Result {
        let mut lock = lock_cpu::<Traits>()?;
        self.stop_inner(lock.borrow_mut());

        self.period.replace(&mut *lock, None);
        self.start_inner(lock.borrow_mut(), deadline);
        Ok(())
    }

    /// Start the timer, firing first when the tick counter reaches
    /// `deadline` and every `period` ticks thereafter. If the timer is
    /// already pending, it's re-armed with the new parameters.
    pub fn start_periodic_at(&'static self, deadline: Tick, period: Ticks) -> Result {
        if period == 0 {
            return Err(Errno::Invalid);
        }

        let mut lock = lock_cpu::<Traits>()?;
        self.stop_inner(lock.borrow_mut());

        self.period.replace(&mut *lock, Some(period));
        self.start_inner(lock.borrow_mut(), deadline);
        Ok(())
    }

    /// Stop the timer. Does nothing if the timer is not pending.
    pub fn stop(&'static self) -> Result {
        let mut lock = lock_cpu::<Traits>()?;
        self.stop_inner(lock.borrow_mut());
        Ok(())
    }

    /// Get a flag indicating whether the timer is pending.
    pub fn is_running(&'static self) -> Result<bool> {
        let lock = lock_cpu::<Traits>()?;
        Ok(self.active.get(&*lock))
    }

    fn start_inner(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, deadline: Tick) {
        debug_assert!(!self.active.get(&*lock.borrow_mut()));

        self.timeout.set_at_raw(lock.borrow_mut(), deadline);
        timeout::insert_timeout(lock.borrow_mut(), static_pin(&self.timeout));
        self.active.replace(&mut *lock, true);
    }

    fn stop_inner(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        if self.timeout.is_linked(lock.borrow_mut()) {
            debug_assert!(self.active.get(&*lock.borrow_mut()));
            timeout::remove_timeout(lock.borrow_mut(), &self.timeout);
        }

        self.active.replace(&mut *lock, false);
    }
}

impl<Traits: KernelTraits> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("attr", &self.attr)
            .field("period", &self.period)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// The timeout callback function for a timer. This function is registered
/// as the callback function when constructing [`TimerCb::timeout`].
fn timer_timeout_handler<Traits: KernelTraits>(
    timeout_ref: timeout::TimeoutRef<Traits>,
    _param: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    // `TimerCb` is `#[repr(C)]` with `timeout` as its first field, so the
    // expired timeout's address is the `TimerCb`'s address.
    //
    // Safety: The timeout was registered, so it must be the `timeout` field
    // of an extant, static `TimerCb`.
    let timer_cb: &'static TimerCb<Traits> =
        unsafe { &*(timeout_ref.0.as_ptr() as *const TimerCb<Traits>) };

    debug_assert!(timer_cb.active.get(&*lock));
    debug_assert!(!timer_cb.timeout.is_linked(lock.borrow_mut()));

    // Schedule the next firing or transition to the stopped state, before
    // the action runs
    if let Some(period) = timer_cb.period.get(&*lock) {
        timer_cb
            .timeout
            .adjust_expiration(lock.borrow_mut(), period as Tick);
        timeout::insert_timeout(lock.borrow_mut(), static_pin(&timer_cb.timeout));
    } else {
        timer_cb.active.replace(&mut *lock, false);
    }

    // Release CPU Lock before calling the application-provided callback
    // function
    drop(lock);

    let TimerAttr {
        entry_point,
        entry_param,
        ..
    } = timer_cb.attr;
    entry_point(*entry_param);

    // Re-acquire CPU Lock
    lock_cpu().unwrap_or_else(|_| unsafe { assume_cpu_lock() })
}
