//! Message/FIFO queue behavior, including the ISR rendezvous scenarios.
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

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

/// `push(v)` then `pop()` on an otherwise untouched single-slot queue
/// yields `v` with matching priority.
mod roundtrip {
    use super::*;
    use sparrow_kernel::{queue::MessageQueue, Errno, TaskAttr, TaskCb};

    sim_system!(Sys, levels: 4, startup: [&MAIN_TASK]);

    static Q: MessageQueue<Sys, u32, 1> = MessageQueue::new();

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);

    fn main_body(_: usize) {
        Q.push(7, 0xdead_beef).unwrap();
        assert_eq!(Q.len(), Ok(1));
        assert_eq!(Q.try_push(1, 2), Err(Errno::Again));

        assert_eq!(Q.pop(), Ok((7, 0xdead_beef)));
        assert_eq!(Q.len(), Ok(0));
        assert_eq!(Q.try_pop(), Err(Errno::Again));

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn roundtrip() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// Message queues pop in (descending priority, arrival order); FIFO queues
/// ignore priority.
mod ordering {
    use super::*;
    use sparrow_kernel::{
        queue::{FifoQueue, MessageQueue},
        TaskAttr, TaskCb,
    };

    sim_system!(Sys, levels: 4, startup: [&MAIN_TASK]);

    static MSGQ: MessageQueue<Sys, u32, 8> = MessageQueue::new();
    static FIFOQ: FifoQueue<Sys, u32, 8> = FifoQueue::new();

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);

    fn main_body(_: usize) {
        MSGQ.push(1, 10).unwrap();
        MSGQ.push(3, 30).unwrap();
        MSGQ.push(2, 20).unwrap();
        MSGQ.push(3, 31).unwrap(); // same priority: FIFO within the band

        assert_eq!(MSGQ.pop(), Ok((3, 30)));
        assert_eq!(MSGQ.pop(), Ok((3, 31)));
        assert_eq!(MSGQ.pop(), Ok((2, 20)));
        assert_eq!(MSGQ.pop(), Ok((1, 10)));

        for v in [10, 30, 20] {
            FIFOQ.push(v).unwrap();
        }
        assert_eq!(FIFOQ.pop(), Ok(10));
        assert_eq!(FIFOQ.pop(), Ok(30));
        assert_eq!(FIFOQ.pop(), Ok(20));

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn ordering() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// `try_push_for(1 tick)` on a capacity-0 queue returns
/// `ETIMEDOUT` at exactly `start + 1` tick, with exactly 2 context switches
/// (main → idle → main).
mod capacity_zero_timed_push {
    use super::*;
    use sparrow_kernel::{queue::MessageQueue, Errno, System, TaskAttr, TaskCb};

    sim_system!(Sys, levels: 4, startup: [&MAIN_TASK]);

    static Q: MessageQueue<Sys, u32, 0> = MessageQueue::new();

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);

    fn main_body(_: usize) {
        let t0 = System::<Sys>::tick_count().unwrap();
        let cs0 = System::<Sys>::context_switch_count().unwrap();

        assert_eq!(Q.try_push_for(1, 0, 42), Err(Errno::TimedOut));

        assert_eq!(System::<Sys>::tick_count().unwrap(), t0 + 1);
        assert_eq!(System::<Sys>::context_switch_count().unwrap() - cs0, 2);

        // A capacity-0 queue is also always empty
        let t1 = System::<Sys>::tick_count().unwrap();
        assert_eq!(Q.try_pop_for(1), Err(Errno::TimedOut));
        assert_eq!(System::<Sys>::tick_count().unwrap(), t1 + 1);

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn capacity_zero_timed_push() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// A software timer pushes into the queue at `t + 10` while
/// the main task is blocked in `pop`. Main wakes at exactly `t + 10`
/// observing the pushed value and priority, with 2 context switches.
mod isr_to_thread_rendezvous {
    use super::*;
    use sparrow_kernel::{
        queue::MessageQueue, System, TaskAttr, TaskCb, TimerAttr, TimerCb,
    };

    sim_system!(Sys, levels: 4, startup: [&MAIN_TASK]);

    static Q: MessageQueue<Sys, u32, 1> = MessageQueue::new();

    static TIMER_ATTR: TimerAttr<Sys> = TimerAttr::new(timer_action, 0);
    static TIMER: TimerCb<Sys> = TimerCb::new(&TIMER_ATTR);

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);

    fn timer_action(_: usize) {
        Q.try_push(0x93, 0x2f5b_e1a4).unwrap();
    }

    fn main_body(_: usize) {
        let t0 = System::<Sys>::tick_count().unwrap();
        TIMER.start_at(t0 + 10).unwrap();

        let cs0 = System::<Sys>::context_switch_count().unwrap();
        let (prio, value) = Q.pop().unwrap();

        assert_eq!((prio, value), (0x93, 0x2f5b_e1a4));
        assert_eq!(System::<Sys>::tick_count().unwrap(), t0 + 10);
        assert_eq!(System::<Sys>::context_switch_count().unwrap() - cs0, 2);
        assert_eq!(TIMER.is_running(), Ok(false));

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn isr_to_thread_rendezvous() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// A software timer pops from a full queue at `t + 10`,
/// unblocking the main task's `push`. The timer's pop observes the old
/// value; the buffer then holds the new one.
mod thread_to_isr_rendezvous {
    use super::*;
    use sparrow_kernel::{
        queue::MessageQueue, System, TaskAttr, TaskCb, TimerAttr, TimerCb,
    };

    sim_system!(Sys, levels: 4, startup: [&MAIN_TASK]);

    static Q: MessageQueue<Sys, u32, 1> = MessageQueue::new();
    static POPPED: AtomicU32 = AtomicU32::new(0);
    static POPPED_AT: AtomicU64 = AtomicU64::new(0);

    static TIMER_ATTR: TimerAttr<Sys> = TimerAttr::new(timer_action, 0);
    static TIMER: TimerCb<Sys> = TimerCb::new(&TIMER_ATTR);

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);

    fn timer_action(_: usize) {
        let (_prio, value) = Q.try_pop().unwrap();
        POPPED.store(value, Ordering::Relaxed);
        POPPED_AT.store(System::<Sys>::tick_count().unwrap(), Ordering::Relaxed);
    }

    fn main_body(_: usize) {
        Q.push(1, 0xaaaa_aaaa).unwrap();

        let t0 = System::<Sys>::tick_count().unwrap();
        TIMER.start_at(t0 + 10).unwrap();

        // The queue is full; this blocks until the timer's pop frees the
        // slot (the refill happens inside the timer interrupt)
        Q.push(2, 0xbbbb_bbbb).unwrap();

        assert_eq!(System::<Sys>::tick_count().unwrap(), t0 + 10);
        assert_eq!(POPPED.load(Ordering::Relaxed), 0xaaaa_aaaa);
        assert_eq!(POPPED_AT.load(Ordering::Relaxed), t0 + 10);

        // Our element made it into the buffer
        assert_eq!(Q.try_pop(), Ok((2, 0xbbbb_bbbb)));

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn thread_to_isr_rendezvous() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// Every raw-queue operation with a mismatched element size
/// fails with `EMSGSIZE` immediately, advancing no ticks and touching no
/// state.
mod raw_size_mismatch {
    use super::*;
    use sparrow_kernel::{queue::RawMessageQueue, Errno, System, TaskAttr, TaskCb};

    sim_system!(Sys, levels: 4, startup: [&MAIN_TASK]);

    static Q: RawMessageQueue<Sys, 0, 4> = RawMessageQueue::new(4);

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);

    fn main_body(_: usize) {
        let t0 = System::<Sys>::tick_count().unwrap();
        let short = [0u8; 3];
        let mut short_buf = [0u8; 3];

        assert_eq!(Q.push(0, &short), Err(Errno::MessageSize));
        assert_eq!(Q.try_push(0, &short), Err(Errno::MessageSize));
        assert_eq!(Q.try_push_for(5, 0, &short), Err(Errno::MessageSize));
        assert_eq!(Q.try_push_until(t0 + 5, 0, &short), Err(Errno::MessageSize));
        assert_eq!(Q.pop(&mut short_buf), Err(Errno::MessageSize));
        assert_eq!(Q.try_pop(&mut short_buf), Err(Errno::MessageSize));
        assert_eq!(Q.try_pop_for(5, &mut short_buf), Err(Errno::MessageSize));
        assert_eq!(
            Q.try_pop_until(t0 + 5, &mut short_buf),
            Err(Errno::MessageSize)
        );

        // No ticks elapsed and the queue was not touched
        assert_eq!(System::<Sys>::tick_count().unwrap(), t0);
        assert_eq!(Q.len(), Ok(0));

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn raw_size_mismatch() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// Raw queues move bytes and priorities faithfully.
mod raw_roundtrip {
    use super::*;
    use sparrow_kernel::{
        queue::{RawFifoQueue, RawMessageQueue},
        TaskAttr, TaskCb,
    };

    sim_system!(Sys, levels: 4, startup: [&MAIN_TASK]);

    static MSGQ: RawMessageQueue<Sys, 2, 4> = RawMessageQueue::new(4);
    static FIFOQ: RawFifoQueue<Sys, 2, 8> = RawFifoQueue::new(6);

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);

    fn main_body(_: usize) {
        MSGQ.push(2, &[1, 2, 3, 4]).unwrap();
        MSGQ.push(9, &[5, 6, 7, 8]).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(MSGQ.pop(&mut buf), Ok(9));
        assert_eq!(buf, [5, 6, 7, 8]);
        assert_eq!(MSGQ.try_pop(&mut buf), Ok(2));
        assert_eq!(buf, [1, 2, 3, 4]);

        // The element size can be smaller than the slot stride
        FIFOQ.push(b"abcdef").unwrap();
        let mut buf6 = [0u8; 6];
        FIFOQ.pop(&mut buf6).unwrap();
        assert_eq!(&buf6, b"abcdef");

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn raw_roundtrip() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// A pop from a full queue refills the freed slot from the first blocked
/// pusher.
mod pusher_refill {
    use super::*;
    use sparrow_kernel::{queue::MessageQueue, System, TaskAttr, TaskCb};

    sim_system!(Sys, levels: 4, startup: [&MAIN_TASK]);

    static Q: MessageQueue<Sys, u32, 1> = MessageQueue::new();

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);
    static HELPER_ATTR: TaskAttr<Sys> = TaskAttr::new(helper_body, 0, 1);
    static HELPER_TASK: TaskCb<Sys> = TaskCb::new(&HELPER_ATTR);

    fn helper_body(_: usize) {
        // The queue is full at this point; this blocks
        Q.push(5, 0xcccc_cccc).unwrap();
    }

    fn main_body(_: usize) {
        Q.push(1, 0x1111_1111).unwrap();

        HELPER_TASK.activate().unwrap();
        System::<Sys>::sleep_for(1).unwrap();

        // Popping the old element completes the helper's push into the
        // freed slot
        assert_eq!(Q.pop(), Ok((1, 0x1111_1111)));
        assert_eq!(Q.len(), Ok(1));
        assert_eq!(Q.pop(), Ok((5, 0xcccc_cccc)));

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn pusher_refill() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}

/// `emplace_with` constructs the element in place.
mod emplace_in_place {
    use super::*;
    use sparrow_kernel::{queue::MessageQueue, TaskAttr, TaskCb};

    sim_system!(Sys, levels: 4, startup: [&MAIN_TASK]);

    static Q: MessageQueue<Sys, [u32; 4], 1> = MessageQueue::new();

    static MAIN_ATTR: TaskAttr<Sys> = TaskAttr::new(main_body, 0, 2);
    static MAIN_TASK: TaskCb<Sys> = TaskCb::new(&MAIN_ATTR);

    fn main_body(_: usize) {
        Q.emplace_with(3, || [1, 2, 3, 4]).unwrap();
        assert_eq!(Q.pop(), Ok((3, [1, 2, 3, 4])));

        Q.try_emplace_with(1, || [5, 6, 7, 8]).unwrap();
        assert_eq!(Q.pop(), Ok((1, [5, 6, 7, 8])));

        sparrow_port_std::shutdown::<Sys>();
    }

    #[test]
    fn emplace_in_place() {
        init_logger();
        sparrow_port_std::port_boot::<Sys>();
    }
}
