//! Counting semaphore.
//!
//! # Usage
//!
//! ```ignore
//! static SEM: Semaphore = Semaphore::new();
//!
//! unsafe {
//!     SEM.init(0, IpcFlag::Fifo).unwrap();
//!
//!     // Consumer blocks for up to 50 ticks.
//!     match SEM.take(50) {
//!         Ok(()) => { /* resource acquired */ }
//!         Err(KernelError::Timeout) => { /* nothing arrived */ }
//!         Err(e) => { /* deleted, ... */ }
//!     }
//!
//!     // Producer (thread or ISR).
//!     SEM.release().unwrap();
//! }
//! ```

use core::cell::UnsafeCell;

use crate::arch;
use crate::config::SEM_VALUE_MAX;
use crate::error::{KernelError, KernelResult};
use crate::ipc::{self, IpcFlag, IpcHeader};
use crate::sched;
use crate::timer::TimerCtrl;

/// Counting semaphore object.
#[repr(C)]
pub struct Semaphore {
    /// Common IPC header (validity, policy, wait list).
    parent: IpcHeader,
    /// Current count.
    count: UnsafeCell<u16>,
}

// Safety: mutated only under the kernel interrupt lock.
unsafe impl Sync for Semaphore {}
unsafe impl Send for Semaphore {}

impl Semaphore {
    /// Create a new, uninitialized semaphore.
    pub const fn new() -> Self {
        Self {
            parent: IpcHeader::new(),
            count: UnsafeCell::new(0),
        }
    }

    /// Initialize the semaphore with an initial count and queuing policy.
    pub unsafe fn init(&self, value: u16, flag: IpcFlag) -> KernelResult {
        self.parent.init(flag);
        *self.count.get() = value;
        Ok(())
    }

    /// Current count.
    #[inline]
    pub fn count(&self) -> u16 {
        unsafe { *self.count.get() }
    }

    /// Acquire the semaphore.
    ///
    /// `timeout`: 0 = try once, negative = wait forever, positive = wait
    /// that many ticks. On expiry of a finite wait the caller rechecks the
    /// count once (the resource may have arrived just as the timer fired)
    /// and then reports `Timeout`.
    ///
    /// # Safety
    /// Blocking (non-zero timeout) requires thread context.
    pub unsafe fn take(&self, timeout: i32) -> KernelResult {
        if !self.parent.is_alive() {
            return Err(KernelError::Deleted);
        }

        let level = arch::irq_save();

        if *self.count.get() > 0 {
            *self.count.get() -= 1;
            arch::irq_restore(level);
            return Ok(());
        }

        if timeout == 0 {
            arch::irq_restore(level);
            return Err(KernelError::Error);
        }

        let thread = sched::current_thread();
        if thread.is_null() {
            arch::irq_restore(level);
            return Err(KernelError::Unsupported);
        }

        let _ = ipc::suspend_thread(self.parent.wait_list(), thread, self.parent.flag());

        if timeout > 0 {
            let _ = (*thread).timer.ctrl(TimerCtrl::SetDuration(timeout as u32));
            let _ = (*thread).timer.start();
        }

        arch::irq_restore(level);
        sched::reschedule();

        // Resumed: by a release, by the timeout, or by deletion.
        if !self.parent.is_alive() {
            return Err(KernelError::Deleted);
        }

        let level = arch::irq_save();
        if *self.count.get() > 0 {
            *self.count.get() -= 1;
            arch::irq_restore(level);
            return Ok(());
        }
        arch::irq_restore(level);

        if timeout > 0 {
            Err(KernelError::Timeout)
        } else {
            Err(KernelError::Error)
        }
    }

    /// Release the semaphore: wake the first waiter if any, otherwise just
    /// increment the count. Fails at `SEM_VALUE_MAX` without waking
    /// anyone. Callable from ISRs.
    pub unsafe fn release(&self) -> KernelResult {
        if !self.parent.is_alive() {
            return Err(KernelError::Deleted);
        }

        let level = arch::irq_save();

        if *self.count.get() >= SEM_VALUE_MAX {
            arch::irq_restore(level);
            return Err(KernelError::Error);
        }
        *self.count.get() += 1;

        let waiter = if self.parent.has_waiters() {
            ipc::resume_first(self.parent.wait_list())
        } else {
            core::ptr::null_mut()
        };

        arch::irq_restore(level);

        if !waiter.is_null() {
            sched::reschedule();
        }
        Ok(())
    }

    /// Delete the semaphore. Every waiter is resumed and observes
    /// `Deleted` when its blocked `take` returns.
    pub unsafe fn delete(&self) -> KernelResult {
        let had_waiters = self.parent.has_waiters();
        if had_waiters {
            ipc::resume_all(self.parent.wait_list());
        }

        let level = arch::irq_save();
        *self.count.get() = 0;
        self.parent.set_dead();
        arch::irq_restore(level);

        if had_waiters {
            sched::reschedule();
        }
        Ok(())
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TIMEOUT_FOREVER, TIMEOUT_NONE};
    use crate::test_util;
    use crate::thread::{Thread, ThreadState};
    use crate::timer;

    static SEM: Semaphore = Semaphore::new();

    fn release_hook() {
        unsafe { SEM.release().unwrap() }
    }

    fn delete_hook() {
        unsafe { SEM.delete().unwrap() }
    }

    #[test]
    fn test_take_release_round_trip() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            let sem = Semaphore::new();
            sem.init(2, IpcFlag::Fifo).unwrap();

            for _ in 0..5 {
                sem.take(TIMEOUT_NONE).unwrap();
                sem.take(TIMEOUT_NONE).unwrap();
                assert_eq!(sem.count(), 0);
                sem.release().unwrap();
                sem.release().unwrap();
            }
            assert_eq!(sem.count(), 2);
        }
    }

    #[test]
    fn test_take_zero_timeout_never_blocks() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            let sem = Semaphore::new();
            sem.init(0, IpcFlag::Fifo).unwrap();

            let mut t = Thread::new();
            test_util::spawn(&mut t, 10, 10);
            sched::start();

            assert_eq!(sem.take(TIMEOUT_NONE), Err(KernelError::Error));
            assert_eq!(t.state, ThreadState::RUNNING);
        }
    }

    #[test]
    fn test_blocking_take_times_out_and_wakes() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            let sem = Semaphore::new();
            sem.init(0, IpcFlag::Fifo).unwrap();

            let mut t = Thread::new();
            let mut idle = Thread::new();
            test_util::spawn(&mut t, 10, 10);
            test_util::spawn(&mut idle, 31, 10);
            sched::start();

            // The hosted port returns from the switch, so the timed-out
            // result is observed immediately; the thread itself stays
            // suspended on the wait list until the timer fires.
            assert_eq!(sem.take(5), Err(KernelError::Timeout));
            assert_eq!(t.state, ThreadState::SUSPEND);
            assert!(sem.parent.has_waiters());
            assert!(t.timer.is_armed());

            for _ in 0..5 {
                timer::tick_increase();
            }
            assert_eq!(t.state, ThreadState::RUNNING);
            assert!(!sem.parent.has_waiters());
            assert!(!t.timer.is_armed());
        }
    }

    #[test]
    fn test_release_hands_resource_to_waiter() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();
            SEM.init(0, IpcFlag::Fifo).unwrap();

            let mut t = Thread::new();
            let mut idle = Thread::new();
            test_util::spawn(&mut t, 10, 10);
            test_util::spawn(&mut idle, 31, 10);
            sched::start();

            // The hook releases at the moment the taker is suspended.
            arch::set_switch_hook(release_hook);
            assert_eq!(SEM.take(TIMEOUT_FOREVER), Ok(()));
            assert_eq!(SEM.count(), 0);
            assert_eq!(t.state, ThreadState::RUNNING);
            assert!(!SEM.parent.has_waiters());
        }
    }

    #[test]
    fn test_delete_while_waiting_returns_deleted() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();
            SEM.init(0, IpcFlag::Fifo).unwrap();

            let mut t = Thread::new();
            let mut idle = Thread::new();
            test_util::spawn(&mut t, 10, 10);
            test_util::spawn(&mut idle, 31, 10);
            sched::start();

            arch::set_switch_hook(delete_hook);
            assert_eq!(SEM.take(TIMEOUT_FOREVER), Err(KernelError::Deleted));
            assert!(!SEM.parent.is_alive());
            assert_eq!(SEM.take(TIMEOUT_NONE), Err(KernelError::Deleted));
        }
    }

    #[test]
    fn test_release_saturates_at_max() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            let sem = Semaphore::new();
            sem.init(SEM_VALUE_MAX, IpcFlag::Fifo).unwrap();

            assert_eq!(sem.release(), Err(KernelError::Error));
            assert_eq!(sem.count(), SEM_VALUE_MAX);
        }
    }
}
