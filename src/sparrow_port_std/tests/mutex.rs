//! Mutex types, protocols, and priority inheritance.
use std::sync::Mutex;

macro_rules! sim_system {
    (
        $sys:ident,
        levels: $levels:expr,
        startup: [ $( $startup:expr ),* $(,)? ]
    ) => {
        struct $sys;
        sparrow_port_std::use_port!(unsafe impl PortThreading for $sys);
        sparrow_kernel::configure_kernel! {
            unsafe impl KernelCfg for $sys {
                num_task_priority_levels: $levels,
                tick_frequency_hz: 1_000,
                time_slice_ticks: 0,
                timeout_capacity: 16,
                startup_tasks: [ $( $startup ),* ],
            }
        }
    };
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `lock` then `unlock` on an unowned mutex leaves its state unchanged.
mod lock_unlock_roundtrip {
    use super::*;
    use sparrow_kernel::{
        mutex::{MutexCb, MutexProtocol, MutexType},
        TaskAttr, TaskCb,
    };

    sim_system!(Sys, levels: 4, startup: [&MAIN_TASK]);

    static M: MutexCb<Sys> = MutexCb::new(MutexType::Normal, MutexProtocol::None);

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);

    fn main_body(_: usize) {
        assert_eq!(M.is_locked(), Ok(false));
        M.lock().unwrap();
        assert_eq!(M.is_locked(), Ok(true));
        M.unlock().unwrap();
        assert_eq!(M.is_locked(), Ok(false));

        M.try_lock().unwrap();
        M.unlock().unwrap();
        assert_eq!(M.is_locked(), Ok(false));

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn lock_unlock_roundtrip() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// Error-checking mutexes detect self-deadlock and non-owner unlocks.
mod error_checking {
    use super::*;
    use sparrow_kernel::{
        mutex::{MutexCb, MutexProtocol, MutexType},
        Errno, System, TaskAttr, TaskCb,
    };

    sim_system!(Sys, levels: 4, startup: [&MAIN_TASK]);

    static M: MutexCb<Sys> = MutexCb::new(MutexType::ErrorChecking, MutexProtocol::None);
    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);
    static A_ATTR: TaskAttr<Sys> = TaskAttr::new(a_body, 0, 1);
    static A_TASK: TaskCb<Sys> = TaskCb::new(&A_ATTR);

    fn a_body(_: usize) {
        // `M` is held by Main; we're not the owner
        assert_eq!(M.unlock(), Err(Errno::NotOwner));
        LOG.lock().unwrap().push("a:checked");
    }

    fn main_body(_: usize) {
        // Unlocking an unowned mutex
        assert_eq!(M.unlock(), Err(Errno::NotOwner));

        M.lock().unwrap();
        assert_eq!(M.lock(), Err(Errno::Deadlock));
        assert_eq!(M.try_lock(), Err(Errno::Deadlock));

        A_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();
        assert_eq!(*LOG.lock().unwrap(), ["a:checked"]);

        M.unlock().unwrap();

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn error_checking() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// Recursive mutexes count locks; the lock is released by the matching
/// number of unlocks.
mod recursive {
    use super::*;
    use sparrow_kernel::{
        mutex::{MutexCb, MutexProtocol, MutexType},
        TaskAttr, TaskCb,
    };

    sim_system!(Sys, levels: 4, startup: [&MAIN_TASK]);

    static M: MutexCb<Sys> = MutexCb::new(MutexType::Recursive, MutexProtocol::None);

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);

    fn main_body(_: usize) {
        M.lock().unwrap();
        M.lock().unwrap();
        M.try_lock().unwrap();

        M.unlock().unwrap();
        M.unlock().unwrap();
        assert_eq!(M.is_locked(), Ok(true));
        M.unlock().unwrap();
        assert_eq!(M.is_locked(), Ok(false));

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn recursive() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// Priority protection: the ceiling raises the owner's effective priority;
/// locking above the ceiling is rejected.
mod priority_protect {
    use super::*;
    use sparrow_kernel::{
        mutex::{MutexCb, MutexProtocol, MutexType},
        Errno, System, TaskAttr, TaskCb,
    };

    sim_system!(Sys, levels: 8, startup: [&MAIN_TASK]);

    static M: MutexCb<Sys> = MutexCb::new(MutexType::Normal, MutexProtocol::Protect(4));

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 5);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);
    static A_ATTR: TaskAttr<Sys> = TaskAttr::new(a_body, 0, 2);
    static A_TASK: TaskCb<Sys> = TaskCb::new(&A_ATTR);

    fn a_body(_: usize) {
        assert_eq!(A_TASK.effective_priority(), Ok(2));

        M.lock().unwrap();
        // Holding the mutex raises us to the ceiling
        assert_eq!(A_TASK.priority(), Ok(2));
        assert_eq!(A_TASK.effective_priority(), Ok(4));

        // Raising the base priority above the ceiling of a held mutex is
        // rejected
        assert_eq!(A_TASK.set_priority(5), Err(Errno::Invalid));
        assert_eq!(A_TASK.set_priority(4), Ok(()));
        assert_eq!(A_TASK.set_priority(2), Ok(()));

        M.unlock().unwrap();
        assert_eq!(A_TASK.effective_priority(), Ok(2));
    }

    fn main_body(_: usize) {
        // Our base priority (5) is above the ceiling (4)
        assert_eq!(M.lock(), Err(Errno::Invalid));
        assert_eq!(M.try_lock(), Err(Errno::Invalid));

        A_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn priority_protect() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// A three-task priority-inheritance chain: T-low holds M1;
/// T-mid holds M2 and waits for M1; T-high waits for M2. T-low's effective
/// priority equals T-high's static priority while the chain persists, and
/// everything recomputes on each unlock.
mod inheritance_chain {
    use super::*;
    use sparrow_kernel::{
        mutex::{MutexCb, MutexProtocol, MutexType},
        semaphore::SemaphoreCb,
        System, TaskAttr, TaskCb,
    };

    sim_system!(Sys, levels: 8, startup: [&MAIN_TASK]);

    static M1: MutexCb<Sys> = MutexCb::new(MutexType::Normal, MutexProtocol::Inherit);
    static M2: MutexCb<Sys> = MutexCb::new(MutexType::Normal, MutexProtocol::Inherit);
    static GO: SemaphoreCb<Sys> = SemaphoreCb::new(0, 1);
    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 4);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);
    static LOW_ATTR: TaskAttr<Sys> = TaskAttr::new(low_body, 0, 1);
    static LOW_TASK: TaskCb<Sys> = TaskCb::new(&LOW_ATTR);
    static MID_ATTR: TaskAttr<Sys> = TaskAttr::new(mid_body, 0, 2);
    static MID_TASK: TaskCb<Sys> = TaskCb::new(&MID_ATTR);
    static HIGH_ATTR: TaskAttr<Sys> = TaskAttr::new(high_body, 0, 3);
    static HIGH_TASK: TaskCb<Sys> = TaskCb::new(&HIGH_ATTR);

    fn low_body(_: usize) {
        M1.lock().unwrap();
        LOG.lock().unwrap().push("low:m1");

        GO.wait().unwrap();

        M1.unlock().unwrap();
        // The inherited priority is gone with the last waiter
        assert_eq!(LOW_TASK.effective_priority(), Ok(1));
        LOG.lock().unwrap().push("low:done");
    }

    fn mid_body(_: usize) {
        M2.lock().unwrap();
        LOG.lock().unwrap().push("mid:m2");
        M1.lock().unwrap();
        LOG.lock().unwrap().push("mid:m1");
        M1.unlock().unwrap();
        M2.unlock().unwrap();
        assert_eq!(MID_TASK.effective_priority(), Ok(2));
        LOG.lock().unwrap().push("mid:done");
    }

    fn high_body(_: usize) {
        M2.lock().unwrap();
        LOG.lock().unwrap().push("high:m2");
        M2.unlock().unwrap();
        LOG.lock().unwrap().push("high:done");
    }

    fn main_body(_: usize) {
        LOW_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();
        // low holds M1 and is blocked on GO
        assert_eq!(LOW_TASK.effective_priority(), Ok(1));

        MID_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();
        // mid holds M2 and is blocked on M1; low inherits mid's priority
        assert_eq!(LOW_TASK.effective_priority(), Ok(2));
        assert_eq!(MID_TASK.effective_priority(), Ok(2));

        HIGH_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();
        // high is blocked on M2; the donation propagates through mid to low
        assert_eq!(MID_TASK.effective_priority(), Ok(3));
        assert_eq!(LOW_TASK.effective_priority(), Ok(3));

        // Release the chain
        GO.post().unwrap();
        System::<Sys>::sleep_for(1).unwrap();

        // Everything unwound in priority order
        assert_eq!(
            *LOG.lock().unwrap(),
            [
                "low:m1", "mid:m2", "mid:m1", "high:m2", "high:done", "mid:done",
                "low:done",
            ],
        );
        assert_eq!(LOW_TASK.effective_priority(), Ok(1));

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn inheritance_chain() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// A timed lock attempt that expires deflates the owner's inherited
/// priority.
mod inheritance_timeout {
    use super::*;
    use sparrow_kernel::{
        mutex::{MutexCb, MutexProtocol, MutexType},
        semaphore::SemaphoreCb,
        Errno, System, TaskAttr, TaskCb,
    };

    sim_system!(Sys, levels: 8, startup: [&MAIN_TASK]);

    static M: MutexCb<Sys> = MutexCb::new(MutexType::Normal, MutexProtocol::Inherit);
    static GO: SemaphoreCb<Sys> = SemaphoreCb::new(0, 1);

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 4);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);
    static LOW_ATTR: TaskAttr<Sys> = TaskAttr::new(low_body, 0, 1);
    static LOW_TASK: TaskCb<Sys> = TaskCb::new(&LOW_ATTR);
    static MID_ATTR: TaskAttr<Sys> = TaskAttr::new(mid_body, 0, 2);
    static MID_TASK: TaskCb<Sys> = TaskCb::new(&MID_ATTR);

    fn low_body(_: usize) {
        M.lock().unwrap();
        GO.wait().unwrap();
        M.unlock().unwrap();
    }

    fn mid_body(_: usize) {
        let t0 = System::<Sys>::tick_count().unwrap();
        assert_eq!(M.lock_for(3), Err(Errno::TimedOut));
        assert_eq!(System::<Sys>::tick_count().unwrap(), t0 + 3);
    }

    fn main_body(_: usize) {
        LOW_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();

        MID_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();
        // mid donates its priority to low while it waits
        assert_eq!(LOW_TASK.effective_priority(), Ok(2));

        // Wait out mid's timeout
        System::<Sys>::sleep_for(4).unwrap();
        assert_eq!(LOW_TASK.effective_priority(), Ok(1));

        GO.post().unwrap();
        System::<Sys>::sleep_for(1).unwrap();

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn inheritance_timeout() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}
