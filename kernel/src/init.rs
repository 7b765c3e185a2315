//! One-shot kernel initialization.

use crate::config::{PRIORITY_MAX, TICK_HZ};
use crate::console;
use crate::error::KernelResult;
use crate::idle;
use crate::sched;
use crate::timer;

/// Bring up the kernel core: scheduler, timer list, idle thread, logger
/// and banner.
///
/// Call once at boot, after registering the console hook and before
/// creating application threads. Threads become runnable via
/// [`crate::Thread::startup`]; scheduling begins with
/// [`crate::sched::start`].
pub fn kernel_init() -> KernelResult {
    console::logger_init();

    unsafe {
        sched::init();
        timer::list_init();
        idle::init()?;
    }

    console::banner();
    log::info!(
        "kernel ready: {} priority levels, {} Hz tick",
        PRIORITY_MAX,
        TICK_HZ
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;
    use crate::thread::ThreadState;

    #[test]
    fn test_kernel_init_readies_idle_thread() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            kernel_init().unwrap();

            let idle = idle::idle_thread();
            assert_eq!((*idle).state, ThreadState::READY);
            assert_eq!((*idle).current_priority, (PRIORITY_MAX - 1) as u8);
            assert_eq!(
                sched::scheduler_mut().ready_group,
                1 << (PRIORITY_MAX - 1)
            );
        }
    }

    #[test]
    fn test_kernel_init_twice_after_reset() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();
            kernel_init().unwrap();

            test_util::reset_kernel();
            kernel_init().unwrap();

            assert_eq!((*idle::idle_thread()).state, ThreadState::READY);
        }
    }
}
