//! Scheduler behavior: preemption, round-robin, suspension, sleep.
use std::sync::Mutex;

/// Define a self-contained system type for one test.
macro_rules! sim_system {
    (
        $sys:ident,
        levels: $levels:expr,
        time_slice: $time_slice:expr,
        startup: [ $( $startup:expr ),* $(,)? ]
    ) => {
        struct $sys;
        sparrow_port_std::use_port!(unsafe impl PortThreading for $sys);
        sparrow_kernel::configure_kernel! {
            unsafe impl KernelCfg for $sys {
                num_task_priority_levels: $levels,
                tick_frequency_hz: 1_000,
                time_slice_ticks: $time_slice,
                timeout_capacity: 16,
                startup_tasks: [ $( $startup ),* ],
            }
        }
    };
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Three tasks T1@1, T2@2 (blocked on a semaphore) and
/// Main@3. `post` returns with Main still running; Main's next suspension
/// point transfers control to T2; T1 never runs while Main or T2 is
/// runnable.
mod priority_preemption {
    use super::*;
    use sparrow_kernel::{semaphore::SemaphoreCb, System, TaskAttr, TaskCb};

    sim_system!(Sys, levels: 8, time_slice: 0, startup: [&MAIN_TASK]);

    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static SEM: SemaphoreCb<Sys> = SemaphoreCb::new(0, 1);
    static PARK: SemaphoreCb<Sys> = SemaphoreCb::new(0, 1);

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 3);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);
    static T1_ATTR: TaskAttr<Sys> = TaskAttr::new(t1_body, 0, 1);
    static T1_TASK: TaskCb<Sys> = TaskCb::new(&T1_ATTR);
    static T2_ATTR: TaskAttr<Sys> = TaskAttr::new(t2_body, 0, 2);
    static T2_TASK: TaskCb<Sys> = TaskCb::new(&T2_ATTR);

    fn t1_body(_: usize) {
        LOG.lock().unwrap().push("t1:ran");
        // Keep T1 alive but permanently blocked
        PARK.wait().unwrap();
    }

    fn t2_body(_: usize) {
        LOG.lock().unwrap().push("t2:waiting");
        SEM.wait().unwrap();
        LOG.lock().unwrap().push("t2:woke");
        PARK.wait().unwrap();
    }

    fn main_body(_: usize) {
        T1_TASK.activate().unwrap();
        T2_TASK.activate().unwrap();

        // Let T2 (and then T1) run until both are blocked
        System::<Sys>::sleep_for(1).unwrap();

        LOG.lock().unwrap().push("main:posting");
        SEM.post().unwrap();
        // `post` woke T2, but T2@2 does not preempt Main@3
        LOG.lock().unwrap().push("main:posted");

        // The next suspension point hands the processor to T2
        System::<Sys>::sleep_for(1).unwrap();

        let log = LOG.lock().unwrap();
        assert_eq!(
            *log,
            ["t2:waiting", "t1:ran", "main:posting", "main:posted", "t2:woke"],
        );
        drop(log);

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn priority_preemption() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// Equal-priority tasks rotate on `yield_now`.
mod yield_rotation {
    use super::*;
    use sparrow_kernel::{System, TaskAttr, TaskCb};

    sim_system!(Sys, levels: 8, time_slice: 0, startup: [&MAIN_TASK]);

    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 3);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);
    static A_ATTR: TaskAttr<Sys> = TaskAttr::new(ab_body, 0, 2);
    static A_TASK: TaskCb<Sys> = TaskCb::new(&A_ATTR);
    static B_ATTR: TaskAttr<Sys> = TaskAttr::new(ab_body, 1, 2);
    static B_TASK: TaskCb<Sys> = TaskCb::new(&B_ATTR);

    fn ab_body(which: usize) {
        let name = ["a", "b"][which];
        for _ in 0..3 {
            LOG.lock().unwrap().push(name);
            System::<Sys>::yield_now().unwrap();
        }
    }

    fn main_body(_: usize) {
        A_TASK.activate().unwrap();
        B_TASK.activate().unwrap();

        // A and B run to completion while we sleep
        System::<Sys>::sleep_for(1).unwrap();

        assert_eq!(*LOG.lock().unwrap(), ["a", "b", "a", "b", "a", "b"]);

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn yield_rotation() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// Round-robin: when the quantum is exhausted and an equal-priority peer is
/// Ready, the running task rotates to the tail of its band.
mod time_slice_rotation {
    use super::*;
    use sparrow_kernel::{System, TaskAttr, TaskCb};

    sim_system!(Sys, levels: 8, time_slice: 2, startup: [&MAIN_TASK]);

    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 3);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);
    static A_ATTR: TaskAttr<Sys> = TaskAttr::new(ab_body, 0, 2);
    static A_TASK: TaskCb<Sys> = TaskCb::new(&A_ATTR);
    static B_ATTR: TaskAttr<Sys> = TaskAttr::new(ab_body, 1, 2);
    static B_TASK: TaskCb<Sys> = TaskCb::new(&B_ATTR);

    fn ab_body(which: usize) {
        let name = ["a", "b"][which];
        loop {
            LOG.lock().unwrap().push(name);
            // Each iteration consumes one tick of the quantum
            sparrow_port_std::pend_tick::<Sys>();
        }
    }

    fn main_body(_: usize) {
        A_TASK.activate().unwrap();
        B_TASK.activate().unwrap();

        // The ticks driving our sleep are delivered by A and B
        System::<Sys>::sleep_for(8).unwrap();

        let log = LOG.lock().unwrap();
        assert_eq!(&log[..8], ["a", "a", "b", "b", "a", "a", "b", "b"]);
        drop(log);

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn time_slice_rotation() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// `suspend`/`resume` round trip, and the error cases.
mod suspend_resume {
    use super::*;
    use sparrow_kernel::{semaphore::SemaphoreCb, Errno, System, TaskAttr, TaskCb};

    sim_system!(Sys, levels: 8, time_slice: 0, startup: [&MAIN_TASK]);

    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static PARK: SemaphoreCb<Sys> = SemaphoreCb::new(0, 2);

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 3);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);
    static A_ATTR: TaskAttr<Sys> = TaskAttr::new(a_body, 0, 2);
    static A_TASK: TaskCb<Sys> = TaskCb::new(&A_ATTR);
    static B_ATTR: TaskAttr<Sys> = TaskAttr::new(b_body, 0, 2);
    static B_TASK: TaskCb<Sys> = TaskCb::new(&B_ATTR);

    fn a_body(_: usize) {
        LOG.lock().unwrap().push("a:running");
        System::<Sys>::suspend().unwrap();
        LOG.lock().unwrap().push("a:resumed");
        PARK.wait().unwrap();
    }

    fn b_body(_: usize) {
        LOG.lock().unwrap().push("b:running");
        PARK.wait().unwrap();
    }

    fn main_body(_: usize) {
        A_TASK.activate().unwrap();
        B_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();

        // A is Suspended, B is Waiting
        assert_eq!(A_TASK.resume(), Ok(()));
        assert_eq!(A_TASK.resume(), Err(Errno::Invalid));

        // Suspending a Waiting task is an error
        assert_eq!(B_TASK.suspend(), Err(Errno::Invalid));

        System::<Sys>::sleep_for(1).unwrap();
        assert_eq!(
            *LOG.lock().unwrap(),
            ["a:running", "b:running", "a:resumed"],
        );

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn suspend_resume() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// `sleep_for` wakes at exactly `start + n` ticks with exactly two context
/// switches (task → idle → task).
mod sleep_exact {
    use super::*;
    use sparrow_kernel::{System, TaskAttr, TaskCb};

    sim_system!(Sys, levels: 4, time_slice: 0, startup: [&MAIN_TASK]);

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);

    fn main_body(_: usize) {
        let t0 = System::<Sys>::tick_count().unwrap();
        let cs0 = System::<Sys>::context_switch_count().unwrap();

        System::<Sys>::sleep_for(5).unwrap();

        let t1 = System::<Sys>::tick_count().unwrap();
        let cs1 = System::<Sys>::context_switch_count().unwrap();
        assert_eq!(t1, t0 + 5);
        assert_eq!(cs1 - cs0, 2);

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn sleep_exact() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// A task's exit hook runs on termination, and a Dormant task can be
/// activated again.
mod exit_and_reactivate {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sparrow_kernel::{System, TaskAttr, TaskCb};

    sim_system!(Sys, levels: 8, time_slice: 0, startup: [&MAIN_TASK]);

    static RUNS: AtomicUsize = AtomicUsize::new(0);
    static HOOK_RUNS: AtomicUsize = AtomicUsize::new(0);

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 3);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);
    static A_ATTR: TaskAttr<Sys> =
        TaskAttr::new(a_body, 0, 2).with_exit_hook(exit_hook);
    static A_TASK: TaskCb<Sys> = TaskCb::new(&A_ATTR);

    fn a_body(_: usize) {
        RUNS.fetch_add(1, Ordering::Relaxed);
    }

    fn exit_hook() {
        HOOK_RUNS.fetch_add(1, Ordering::Relaxed);
    }

    fn main_body(_: usize) {
        A_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();
        assert_eq!(RUNS.load(Ordering::Relaxed), 1);
        assert_eq!(HOOK_RUNS.load(Ordering::Relaxed), 1);

        // The task exited and is Dormant again
        A_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();
        assert_eq!(RUNS.load(Ordering::Relaxed), 2);
        assert_eq!(HOOK_RUNS.load(Ordering::Relaxed), 2);

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn exit_and_reactivate() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// `set_priority` reorders Ready tasks.
mod set_priority {
    use super::*;
    use sparrow_kernel::{Errno, System, TaskAttr, TaskCb};

    sim_system!(Sys, levels: 8, time_slice: 0, startup: [&MAIN_TASK]);

    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 3);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);
    static A_ATTR: TaskAttr<Sys> = TaskAttr::new(ab_body, 0, 1);
    static A_TASK: TaskCb<Sys> = TaskCb::new(&A_ATTR);
    static B_ATTR: TaskAttr<Sys> = TaskAttr::new(ab_body, 1, 1);
    static B_TASK: TaskCb<Sys> = TaskCb::new(&B_ATTR);

    fn ab_body(which: usize) {
        LOG.lock().unwrap().push(["a", "b"][which]);
    }

    fn main_body(_: usize) {
        A_TASK.activate().unwrap();
        B_TASK.activate().unwrap();

        // Promote B over A while both are Ready
        B_TASK.set_priority(2).unwrap();
        assert_eq!(B_TASK.priority(), Ok(2));
        assert_eq!(B_TASK.effective_priority(), Ok(2));

        // Out-of-range priorities are rejected
        assert_eq!(B_TASK.set_priority(8), Err(Errno::Invalid));

        System::<Sys>::sleep_for(1).unwrap();
        assert_eq!(*LOG.lock().unwrap(), ["b", "a"]);

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn set_priority() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}
