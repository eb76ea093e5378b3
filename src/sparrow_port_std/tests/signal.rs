//! Signal delivery and `sig_wait`.
use std::sync::Mutex;

macro_rules! sim_system {
    (
        $sys:ident,
        startup: [ $( $startup:expr ),* $(,)? ]
    ) => {
        struct $sys;
        sparrow_port_std::use_port!(unsafe impl PortThreading for $sys);
        sparrow_kernel::configure_kernel! {
            unsafe impl KernelCfg for $sys {
                num_task_priority_levels: 4,
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

/// A signal raised at a runnable task stays pending until consumed.
mod pending_consumption {
    use super::*;
    use sparrow_kernel::{Errno, System, TaskAttr, TaskCb};

    sim_system!(Sys, startup: [&MAIN_TASK]);

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);

    fn main_body(_: usize) {
        assert_eq!(System::<Sys>::try_sig_wait(!0), Err(Errno::Again));

        MAIN_TASK.raise(5).unwrap();
        MAIN_TASK.raise(9).unwrap();
        assert_eq!(MAIN_TASK.pending_signals(), Ok((1 << 5) | (1 << 9)));

        // The lowest matching signal is consumed first
        assert_eq!(System::<Sys>::try_sig_wait(!0), Ok(5));
        assert_eq!(System::<Sys>::try_sig_wait(!0), Ok(9));
        assert_eq!(System::<Sys>::try_sig_wait(!0), Err(Errno::Again));

        // Out-of-range signal numbers are rejected
        assert_eq!(MAIN_TASK.raise(32), Err(Errno::Invalid));

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn pending_consumption() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// A task blocked in `sig_wait` on a matching set consumes the signal
/// instead of being interrupted.
mod sig_wait_delivery {
    use super::*;
    use sparrow_kernel::{System, TaskAttr, TaskCb};

    sim_system!(Sys, startup: [&MAIN_TASK]);

    static LOG: Mutex<Vec<(&'static str, u8)>> = Mutex::new(Vec::new());

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);
    static A_ATTR: TaskAttr<Sys> = TaskAttr::new(a_body, 0, 1);
    static A_TASK: TaskCb<Sys> = TaskCb::new(&A_ATTR);

    fn a_body(_: usize) {
        let signo = System::<Sys>::sig_wait(1 << 3).unwrap();
        LOG.lock().unwrap().push(("a:got", signo));
        // Consumed on delivery, not pending afterwards
        assert_eq!(A_TASK.pending_signals(), Ok(0));
    }

    fn main_body(_: usize) {
        A_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();

        A_TASK.raise(3).unwrap();
        System::<Sys>::sleep_for(1).unwrap();

        assert_eq!(*LOG.lock().unwrap(), [("a:got", 3)]);

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn sig_wait_delivery() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// A masked signal neither interrupts a wait nor gets lost.
mod masked_signal {
    use super::*;
    use sparrow_kernel::{semaphore::SemaphoreCb, System, TaskAttr, TaskCb};

    sim_system!(Sys, startup: [&MAIN_TASK]);

    static SEM: SemaphoreCb<Sys> = SemaphoreCb::new(0, 1);
    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);
    static A_ATTR: TaskAttr<Sys> = TaskAttr::new(a_body, 0, 1);
    static A_TASK: TaskCb<Sys> = TaskCb::new(&A_ATTR);

    fn a_body(_: usize) {
        A_TASK.set_signal_mask(1 << 7).unwrap();

        // The masked signal must not interrupt this
        SEM.wait().unwrap();
        LOG.lock().unwrap().push("a:sem");

        // ... but it stayed pending
        assert_eq!(A_TASK.pending_signals(), Ok(1 << 7));
        assert_eq!(System::<Sys>::try_sig_wait(!0), Ok(7));
    }

    fn main_body(_: usize) {
        A_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();

        A_TASK.raise(7).unwrap();
        System::<Sys>::sleep_for(2).unwrap();

        // A is still blocked on the semaphore
        assert!(LOG.lock().unwrap().is_empty());

        SEM.post().unwrap();
        System::<Sys>::sleep_for(1).unwrap();
        assert_eq!(*LOG.lock().unwrap(), ["a:sem"]);

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn masked_signal() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// `sig_wait_for` gives up with `ETIMEDOUT`; a suspension is cut short by a
/// signal with `EINTR`.
mod timed_and_suspension {
    use super::*;
    use sparrow_kernel::{Errno, System, TaskAttr, TaskCb};

    sim_system!(Sys, startup: [&MAIN_TASK]);

    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);
    static A_ATTR: TaskAttr<Sys> = TaskAttr::new(a_body, 0, 1);
    static A_TASK: TaskCb<Sys> = TaskCb::new(&A_ATTR);

    fn a_body(_: usize) {
        assert_eq!(System::<Sys>::suspend(), Err(Errno::Interrupted));
        LOG.lock().unwrap().push("a:eintr");
    }

    fn main_body(_: usize) {
        let t0 = System::<Sys>::tick_count().unwrap();
        assert_eq!(System::<Sys>::sig_wait_for(1 << 2, 3), Err(Errno::TimedOut));
        assert_eq!(System::<Sys>::tick_count().unwrap(), t0 + 3);

        A_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();

        // A is suspended; an unmasked signal resumes it with EINTR
        A_TASK.raise(1).unwrap();
        System::<Sys>::sleep_for(1).unwrap();
        assert_eq!(*LOG.lock().unwrap(), ["a:eintr"]);

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn timed_and_suspension() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}
