//! Static configuration mechanism for the kernel

/// Attach a kernel configuration to a system type by implementing
/// [`KernelCfg`](crate::KernelCfg) and instantiating the kernel state.
///
/// # Example
///
/// ```rust,ignore
/// struct SystemTraits;
/// port::use_port!(unsafe impl PortThreading for SystemTraits);
/// sparrow_kernel::configure_kernel! {
///     unsafe impl KernelCfg for SystemTraits {
///         num_task_priority_levels: 16,
///         tick_frequency_hz: 1_000,
///         time_slice_ticks: 4,
///         timeout_capacity: 16,
///         startup_tasks: [&MAIN_TASK],
///     }
/// }
/// ```
///
/// `num_task_priority_levels` includes the idle level 0 and may not exceed
/// 128. `timeout_capacity` bounds the number of simultaneously pending
/// timed operations and software timers.
#[macro_export]
macro_rules! configure_kernel {
    (
        unsafe impl KernelCfg for $sys:ty {
            num_task_priority_levels: $levels:expr,
            tick_frequency_hz: $hz:expr,
            time_slice_ticks: $time_slice:expr,
            timeout_capacity: $timeout_capacity:expr,
            startup_tasks: [ $( $startup_task:expr ),* $(,)? ] $(,)?
        }
    ) => {
        const _: () = {
            use $crate::utils::Init;

            type ReadyQueue = $crate::task::readyqueue::BitmapQueue<
                $sys,
                <$sys as $crate::PortThreading>::PortTaskState,
                u128,
                { $levels },
            >;

            static KERNEL_STATE: $crate::State<$sys> = Init::INIT;

            unsafe impl $crate::KernelCfg for $sys {
                const NUM_TASK_PRIORITY_LEVELS: usize = $levels;
                const TICK_FREQUENCY_HZ: u32 = $hz;
                const TIME_SLICE_TICKS: $crate::Ticks = $time_slice;
                type TaskReadyQueue = ReadyQueue;
                type TimeoutHeap = $crate::arrayvec::ArrayVec<
                    $crate::timeout::TimeoutRef<$sys>,
                    { $timeout_capacity },
                >;
                const STARTUP_TASKS: &'static [&'static $crate::TaskCb<$sys>] =
                    &[ $( $startup_task ),* ];

                fn state() -> &'static $crate::State<$sys> {
                    &KERNEL_STATE
                }
            }

            // The bitmap word must cover every priority level
            const _: () = assert!($levels >= 2 && $levels <= 128);
        };
    };
}
