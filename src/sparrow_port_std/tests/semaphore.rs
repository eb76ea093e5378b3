//! Semaphore behavior.
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

/// Value bookkeeping, `EAGAIN`, and `EOVERFLOW`.
mod value_accounting {
    use super::*;
    use sparrow_kernel::{semaphore::SemaphoreCb, Errno, TaskAttr, TaskCb};

    sim_system!(Sys, levels: 4, startup: [&MAIN_TASK]);

    static SEM: SemaphoreCb<Sys> = SemaphoreCb::new(1, 2);

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);

    fn main_body(_: usize) {
        assert_eq!(SEM.value(), Ok(1));

        SEM.try_wait().unwrap();
        assert_eq!(SEM.value(), Ok(0));
        assert_eq!(SEM.try_wait(), Err(Errno::Again));

        SEM.post().unwrap();
        SEM.post().unwrap();
        assert_eq!(SEM.value(), Ok(2));
        assert_eq!(SEM.post(), Err(Errno::Overflow));

        SEM.wait().unwrap();
        SEM.wait().unwrap();
        assert_eq!(SEM.value(), Ok(0));

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn value_accounting() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// A timed wait expires at exactly `start + n` ticks with exactly two
/// context switches.
mod timed_wait {
    use super::*;
    use sparrow_kernel::{semaphore::SemaphoreCb, Errno, System, TaskAttr, TaskCb};

    sim_system!(Sys, levels: 4, startup: [&MAIN_TASK]);

    static SEM: SemaphoreCb<Sys> = SemaphoreCb::new(0, 1);

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);

    fn main_body(_: usize) {
        let t0 = System::<Sys>::tick_count().unwrap();
        let cs0 = System::<Sys>::context_switch_count().unwrap();

        assert_eq!(SEM.wait_for(3), Err(Errno::TimedOut));

        assert_eq!(System::<Sys>::tick_count().unwrap(), t0 + 3);
        assert_eq!(System::<Sys>::context_switch_count().unwrap() - cs0, 2);

        // An absolute deadline works the same way
        let deadline = System::<Sys>::tick_count().unwrap() + 2;
        assert_eq!(SEM.wait_until(deadline), Err(Errno::TimedOut));
        assert_eq!(System::<Sys>::tick_count().unwrap(), deadline);

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn timed_wait() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// Waiters are served in (priority, FIFO) order.
mod wake_order {
    use super::*;
    use sparrow_kernel::{semaphore::SemaphoreCb, System, TaskAttr, TaskCb};

    sim_system!(Sys, levels: 8, startup: [&MAIN_TASK]);

    static SEM: SemaphoreCb<Sys> = SemaphoreCb::new(0, 4);
    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 4);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);
    // Activation order: low1, high, low2. Expected wake order:
    // high (priority), then low1, low2 (FIFO within equal priority).
    static LOW1_ATTR: TaskAttr<Sys> = TaskAttr::new(waiter_body, 0, 1);
    static LOW1_TASK: TaskCb<Sys> = TaskCb::new(&LOW1_ATTR);
    static HIGH_ATTR: TaskAttr<Sys> = TaskAttr::new(waiter_body, 1, 2);
    static HIGH_TASK: TaskCb<Sys> = TaskCb::new(&HIGH_ATTR);
    static LOW2_ATTR: TaskAttr<Sys> = TaskAttr::new(waiter_body, 2, 1);
    static LOW2_TASK: TaskCb<Sys> = TaskCb::new(&LOW2_ATTR);

    fn waiter_body(which: usize) {
        let name = ["low1", "high", "low2"][which];
        SEM.wait().unwrap();
        LOG.lock().unwrap().push(name);
    }

    fn main_body(_: usize) {
        LOW1_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();
        HIGH_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();
        LOW2_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();

        for _ in 0..3 {
            SEM.post().unwrap();
        }
        System::<Sys>::sleep_for(1).unwrap();

        assert_eq!(*LOG.lock().unwrap(), ["high", "low1", "low2"]);

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn wake_order() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// A signal interrupts a blocking wait with `EINTR`.
mod interrupted_by_signal {
    use super::*;
    use sparrow_kernel::{semaphore::SemaphoreCb, Errno, System, TaskAttr, TaskCb};

    sim_system!(Sys, levels: 4, startup: [&MAIN_TASK]);

    static SEM: SemaphoreCb<Sys> = SemaphoreCb::new(0, 1);
    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);
    static A_ATTR: TaskAttr<Sys> = TaskAttr::new(a_body, 0, 1);
    static A_TASK: TaskCb<Sys> = TaskCb::new(&A_ATTR);

    fn a_body(_: usize) {
        assert_eq!(SEM.wait(), Err(Errno::Interrupted));
        LOG.lock().unwrap().push("a:eintr");
    }

    fn main_body(_: usize) {
        A_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();

        A_TASK.raise(0).unwrap();
        System::<Sys>::sleep_for(1).unwrap();

        assert_eq!(*LOG.lock().unwrap(), ["a:eintr"]);

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn interrupted_by_signal() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}
