//! Manages the tick counter and timeouts (timed events).
//!
//! Time is driven by a strictly periodic tick interrupt; the tick counter is
//! a `u64` and never wraps in practice. Outstanding timeouts are kept in a
//! binary heap ordered by (absolute deadline, insertion sequence), so
//! timeouts sharing a deadline fire in insertion order.
//!
//! A [`Timeout`] may live in static storage (software timers) or on a
//! blocked task's stack (timed waits). It's a `!Unpin` type: once registered
//! by [`insert_timeout`], it must stay in the same memory location until
//! it's unregistered. Dropping a still-registered `Timeout` is a bug;
//! `Timeout::drop` detects the violation and panics.
use core::{fmt, marker::PhantomPinned, pin::Pin, ptr::NonNull};

use crate::{
    klock::{lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    task,
    utils::binary_heap::{HeapOrder, HeapStorage, MinHeap},
    KernelTraits, Tick,
};

// ---------------------------------------------------------------------------
// Define a singleton token type to allow the mutable access to
// `Timeout::{at, seq, heap_pos}` while the heap itself is borrowed.

struct TimeoutPropTag<Traits>(Traits);

/// The key that "unlocks" [`TimeoutPropCell`].
type TimeoutPropToken<Traits> = tokenlock::UnsyncSingletonToken<TimeoutPropTag<Traits>>;
type TimeoutPropTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, TimeoutPropTag<Traits>>;

/// The keyhole type for [`TimeoutPropCell`].
type TimeoutPropKeyhole<Traits> = tokenlock::SingletonTokenId<TimeoutPropTag<Traits>>;

/// Cell type that can be accessed by [`TimeoutPropToken`].
type TimeoutPropCell<Traits, T> = tokenlock::UnsyncTokenLock<T, TimeoutPropKeyhole<Traits>>;

// ---------------------------------------------------------------------------

/// A kernel-global state for timed event management.
pub(crate) struct TimeoutGlobals<Traits, TimeoutHeap: 'static> {
    /// The number of tick interrupts since boot.
    tick_count: CpuLockCell<Traits, Tick>,

    /// The heap (priority queue) containing outstanding timeouts, sorted by
    /// (arrival time, insertion sequence), and the `TimeoutPropToken` used
    /// to access [`Timeout`]`<Traits>`'s field contents.
    heap_and_prop_token: CpuLockCell<Traits, TimeoutHeapAndPropToken<Traits, TimeoutHeap>>,

    /// The insertion sequence counter, breaking ties between timeouts with
    /// equal deadlines.
    next_seq: CpuLockCell<Traits, u64>,
}

struct TimeoutHeapAndPropToken<Traits, TimeoutHeap: 'static> {
    heap: TimeoutHeap,
    prop_token: TimeoutPropToken<Traits>,
}

impl<Traits, TimeoutHeap: HeapStorage + 'static> TimeoutGlobals<Traits, TimeoutHeap> {
    #[allow(clippy::declare_interior_mutable_const)]
    pub(crate) const INIT: Self = Self {
        tick_count: CpuLockCell::new(0),
        heap_and_prop_token: CpuLockCell::new(TimeoutHeapAndPropToken {
            heap: TimeoutHeap::EMPTY,
            // Safety: This is the only instance of `TimeoutPropToken` for
            //         this particular `Traits`.
            prop_token: unsafe { TimeoutPropToken::new_unchecked() },
        }),
        next_seq: CpuLockCell::new(0),
    };
}

impl<Traits, TimeoutHeap: fmt::Debug> fmt::Debug for TimeoutGlobals<Traits, TimeoutHeap> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutGlobals").finish_non_exhaustive()
    }
}

/// An internal utility to access `TimeoutGlobals`.
trait KernelTimeoutGlobalsExt: KernelTraits {
    fn g_timeout() -> &'static TimeoutGlobals<Self, Self::TimeoutHeap>;
}

impl<T: KernelTraits> KernelTimeoutGlobalsExt for T {
    /// Shortcut for `&Self::state().timeout`.
    #[inline(always)]
    fn g_timeout() -> &'static TimeoutGlobals<Self, Self::TimeoutHeap> {
        &Self::state().timeout
    }
}

// Timeouts
// ---------------------------------------------------------------------------

/// Value of [`Timeout::heap_pos`] indicating the timeout is not included in
/// the heap.
const HEAP_POS_NONE: usize = usize::MAX;

/// A timeout.
///
/// `Timeout` is a `!Unpin` type. Once registered by [`insert_timeout`], the
/// `Timeout` must stay in the same memory location until it's unregistered.
///
/// `Timeout` is unregistered by one of the following ways:
///
///  - On expiration, right before its callback function is called.
///  - [`remove_timeout`] can unregister a `Timeout` at any time. There is a
///    RAII guard type [`TimeoutGuard`] that does this automatically.
pub(crate) struct Timeout<Traits: KernelTraits> {
    /// The arrival time of the timeout, in ticks since boot.
    ///
    /// This is wrapped by `TimeoutPropCell` because [`DeadlineOrder`]'s
    /// methods need to access this while `TimeoutHeap` is mutably borrowed.
    at: TimeoutPropCell<Traits, Tick>,

    /// The insertion sequence number, assigned by [`insert_timeout`].
    seq: TimeoutPropCell<Traits, u64>,

    /// The position of this timeout in [`TimeoutGlobals::heap_and_prop_token`].
    ///
    /// [`HEAP_POS_NONE`] indicates this timeout is not included in the heap.
    heap_pos: TimeoutPropCell<Traits, usize>,

    /// Callback function.
    callback: TimeoutFn<Traits>,

    /// Parameter given to the callback function.
    callback_param: usize,

    /// Un-implement `Unpin`.
    _pin: PhantomPinned,
}

/// Timeout callback function.
///
/// The callback function is called with CPU Lock active in an interrupt
/// context when the associated [`Timeout`] expires. It receives a reference
/// to the expired (and already unregistered) `Timeout` and the
/// `callback_param` it was constructed with.
///
/// The callback function may wake up tasks. When it does that, it doesn't
/// have to call `unlock_cpu_and_check_preemption` or `yield_cpu` - it's
/// automatically taken care of by [`handle_tick`].
pub(crate) type TimeoutFn<Traits> =
    fn(TimeoutRef<Traits>, usize, CpuLockGuard<Traits>) -> CpuLockGuard<Traits>;

impl<Traits: KernelTraits> Drop for Timeout<Traits> {
    #[inline]
    fn drop(&mut self) {
        if *self.heap_pos.get_mut() != HEAP_POS_NONE {
            // The timeout is still in the heap. Dropping `self` now would
            // cause use-after-free. Since we don't have CPU Lock and we
            // aren't sure if we can get a hold of it, panicking is the only
            // course of action we can take. The owner of `Timeout` is
            // responsible for ensuring this does not happen.
            panic!("timeout is still linked");
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for Timeout<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("callback", &self.callback)
            .field("callback_param", &self.callback_param)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> Timeout<Traits> {
    /// Construct a `Timeout` with the expiration time set to zero.
    pub(crate) const fn new(callback: TimeoutFn<Traits>, callback_param: usize) -> Self {
        Self {
            at: TimeoutPropCell::new(TimeoutPropKeyhole::new(), 0),
            seq: TimeoutPropCell::new(TimeoutPropKeyhole::new(), 0),
            heap_pos: TimeoutPropCell::new(TimeoutPropKeyhole::new(), HEAP_POS_NONE),
            callback,
            callback_param,
            _pin: PhantomPinned,
        }
    }

    /// Set the expiration time, returning the modified instance of `self`.
    pub(crate) const fn with_expiration_at(mut self, at: Tick) -> Self {
        self.at = TimeoutPropCell::new(TimeoutPropKeyhole::new(), at);
        self
    }

    /// Get a flag indicating whether the `Timeout` is currently in the heap.
    pub(crate) fn is_linked(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        let prop_token = &Traits::g_timeout()
            .heap_and_prop_token
            .read(&*lock)
            .prop_token;

        *self.heap_pos.read(prop_token) != HEAP_POS_NONE
    }

    /// Get the raw expiration time.
    pub(crate) fn at_raw(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Tick {
        let prop_token = &Traits::g_timeout()
            .heap_and_prop_token
            .read(&*lock)
            .prop_token;

        *self.at.read(prop_token)
    }

    /// Set the raw expiration time.
    ///
    /// Must not be called while the `Timeout` is linked.
    pub(crate) fn set_at_raw(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, value: Tick) {
        debug_assert!(!self.is_linked(lock.borrow_mut()));

        let prop_token = &mut Traits::g_timeout()
            .heap_and_prop_token
            .write(&mut *lock)
            .prop_token;

        *self.at.write(prop_token) = value;
    }

    /// Advance the expiration time by `duration` ticks.
    ///
    /// Intended to be used by periodic timers before re-registering the
    /// `Timeout`.
    pub(crate) fn adjust_expiration(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        duration: Tick,
    ) {
        let prop_token = &mut Traits::g_timeout()
            .heap_and_prop_token
            .write(&mut *lock)
            .prop_token;

        let at = self.at.write(prop_token);
        *at = at.wrapping_add(duration);
    }
}

/// A reference to a [`Timeout`].
pub struct TimeoutRef<Traits: KernelTraits>(pub(crate) NonNull<Timeout<Traits>>);

// Safety: `Timeout` is `Send + Sync`
unsafe impl<Traits: KernelTraits> Send for TimeoutRef<Traits> {}
unsafe impl<Traits: KernelTraits> Sync for TimeoutRef<Traits> {}

impl<Traits: KernelTraits> Clone for TimeoutRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelTraits> Copy for TimeoutRef<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for TimeoutRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TimeoutRef").field(&self.0).finish()
    }
}

/// The heap policy for timeouts: compares by (deadline, insertion
/// sequence) and keeps [`Timeout::heap_pos`] up-to-date.
struct DeadlineOrder<'a, Traits> {
    prop_token: TimeoutPropTokenRefMut<'a, Traits>,
}

impl<Traits: KernelTraits> HeapOrder<TimeoutRef<Traits>> for DeadlineOrder<'_, Traits> {
    #[inline]
    fn precedes(&mut self, x: &TimeoutRef<Traits>, y: &TimeoutRef<Traits>) -> bool {
        // Safety: `x` and `y` are in the heap, so the pointees must be valid
        let (x, y) = unsafe { (x.0.as_ref(), y.0.as_ref()) };
        let key_x = (*x.at.read(&*self.prop_token), *x.seq.read(&*self.prop_token));
        let key_y = (*y.at.read(&*self.prop_token), *y.seq.read(&*self.prop_token));
        key_x < key_y
    }

    #[inline]
    fn track(&mut self, element: &mut TimeoutRef<Traits>, index: usize) {
        // Safety: `element` is in the heap, so the pointee must be valid
        unsafe { element.0.as_ref() }
            .heap_pos
            .replace(&mut *self.prop_token, index);
    }
}

// Global time management
// ---------------------------------------------------------------------------

/// Get the current value of the tick counter.
pub(crate) fn tick_count<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) -> Tick {
    Traits::g_timeout().tick_count.get(&*lock)
}

/// Get the deadline of the earliest outstanding timeout.
pub(crate) fn earliest_deadline<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Option<Tick> {
    let g_timeout = Traits::g_timeout();
    let heap_and_prop_token = g_timeout.heap_and_prop_token.read(&*lock);

    heap_and_prop_token.heap.first().map(|timeout_ref| {
        // Safety: `timeout_ref` is in the heap, meaning the pointee is valid
        *unsafe { timeout_ref.0.as_ref() }
            .at
            .read(&heap_and_prop_token.prop_token)
    })
}

/// Implements [`PortToKernel::timer_tick`].
///
/// Precondition: CPU Lock inactive, an interrupt context
///
/// [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
pub(crate) fn handle_tick<Traits: KernelTraits>() {
    // The precondition includes CPU Lock being inactive, so this `unwrap`
    // should succeed
    let mut lock = lock_cpu::<Traits>().unwrap();

    let g_timeout = Traits::g_timeout();

    // Advance the tick counter
    let now = g_timeout.tick_count.get(&*lock) + 1;
    g_timeout.tick_count.replace(&mut *lock, now);

    // Process expired timeouts.
    //
    // For each iteration, check the top element (representing the earliest
    // timeout) in the heap. Exit from the loop if the heap is empty or the
    // earliest timeout is still in the future.
    loop {
        let expired = {
            let heap_and_prop_token = g_timeout.heap_and_prop_token.read(&*lock);
            match heap_and_prop_token.heap.first() {
                // Safety: `timeout_ref` is in the heap, so the pointee is
                // valid
                Some(timeout_ref) => {
                    *unsafe { timeout_ref.0.as_ref() }
                        .at
                        .read(&heap_and_prop_token.prop_token)
                        <= now
                }
                None => false,
            }
        };

        if !expired {
            break;
        }

        // The timeout has expired. Remove it from the heap.
        let TimeoutHeapAndPropToken { heap, prop_token } =
            g_timeout.heap_and_prop_token.write(&mut *lock);

        let timeout_ref = heap
            .heap_remove_at(
                0,
                DeadlineOrder {
                    prop_token: prop_token.borrow_mut(),
                },
            )
            .unwrap();

        // Safety: `timeout_ref` was in the heap, so the pointee is valid
        let timeout = unsafe { timeout_ref.0.as_ref() };

        debug_assert_eq!(*timeout.heap_pos.read(prop_token), 0);
        timeout.heap_pos.replace(prop_token, HEAP_POS_NONE);

        let Timeout {
            callback,
            callback_param,
            ..
        } = *timeout;

        // (Note: `timeout` is considered invalid at this point because it's
        // not in the heap anymore)

        // Call the callback function.
        lock = callback(timeout_ref, callback_param, lock);
    }

    // Round-robin accounting
    task::handle_time_slice::<Traits>(lock.borrow_mut());

    // Callback functions might have woken up some tasks. Check for dispatch
    // and release CPU Lock.
    task::unlock_cpu_and_check_preemption(lock);
}

// Timeout management
// ---------------------------------------------------------------------------

/// Register the specified timeout.
pub(crate) fn insert_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: Pin<&Timeout<Traits>>,
) {
    // For each `Timeout`, there can be only one heap entry pointing to it.
    // `heap_pos` indicates whether there's a corresponding heap entry or
    // not.
    let prop_token = &Traits::g_timeout()
        .heap_and_prop_token
        .read(&*lock)
        .prop_token;
    assert_eq!(
        *timeout.heap_pos.read(prop_token),
        HEAP_POS_NONE,
        "timeout is already registered",
    );

    // Assign the insertion sequence number, which breaks ties between
    // timeouts sharing a deadline
    let seq = Traits::g_timeout().next_seq.get(&*lock);
    Traits::g_timeout().next_seq.replace(&mut *lock, seq + 1);

    // Insert a reference to `timeout` into the heap
    //
    // `Timeout` is `!Unpin` and `Timeout::drop` ensures it's not dropped
    // while it's still in the heap, so `*timeout` will never be invalidated
    // while being referenced by the heap.
    let TimeoutHeapAndPropToken { heap, prop_token } =
        Traits::g_timeout().heap_and_prop_token.write(&mut *lock);

    timeout.seq.replace(prop_token, seq);

    let pos = heap.heap_insert(
        TimeoutRef(NonNull::from(&*timeout)),
        DeadlineOrder {
            prop_token: prop_token.borrow_mut(),
        },
    );

    // `DeadlineOrder::track` should have assigned `heap_pos`
    debug_assert_eq!(*timeout.heap_pos.read(prop_token), pos);
}

/// Unregister the specified `Timeout`. Does nothing if it's not registered.
#[inline]
pub(crate) fn remove_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: &Timeout<Traits>,
) {
    // Remove `timeout` from the heap
    //
    // If `heap_pos == HEAP_POS_NONE`, we are supposed to do nothing.
    // `HEAP_POS_NONE` is a huge value, so `heap_remove_at` will inevitably
    // reject such a huge value by bounds check. This way, we can check both
    // for bounds and `HEAP_POS_NONE` in one fell swoop.
    let TimeoutHeapAndPropToken { heap, prop_token } =
        Traits::g_timeout().heap_and_prop_token.write(&mut *lock);

    let heap_pos = *timeout.heap_pos.read(prop_token);

    let timeout_ref = heap.heap_remove_at(
        heap_pos,
        DeadlineOrder {
            prop_token: prop_token.borrow_mut(),
        },
    );

    let timeout_ref = if let Some(x) = timeout_ref {
        x
    } else {
        // The cause of failure must be `timeout` not being registered in
        // the first place.
        debug_assert_eq!(heap_pos, HEAP_POS_NONE);
        return;
    };

    // The removed element should have pointed to `timeout`
    debug_assert_eq!(timeout_ref.0.as_ptr() as *const _, timeout as *const _);

    timeout.heap_pos.replace(prop_token, HEAP_POS_NONE);
}

/// RAII guard that automatically unregisters `Timeout` when dropped.
pub(crate) struct TimeoutGuard<'a, 'b, Traits: KernelTraits> {
    pub(crate) timeout: Pin<&'a Timeout<Traits>>,
    pub(crate) lock: CpuLockTokenRefMut<'b, Traits>,
}

impl<Traits: KernelTraits> Drop for TimeoutGuard<'_, '_, Traits> {
    #[inline]
    fn drop(&mut self) {
        remove_timeout(self.lock.borrow_mut(), &self.timeout);
    }
}
