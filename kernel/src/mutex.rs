//! Recursive mutex with priority inheritance.
//!
//! Ownership is handed over directly on release: the first waiter becomes
//! the owner before it even runs, so a freshly woken waiter never races
//! other threads for the lock.
//!
//! While a higher-priority thread waits, the owner runs at the waiter's
//! priority (priority inheritance); the owner's own priority is recorded
//! when it takes the free mutex and restored when it releases. This bounds
//! priority inversion to the length of the owner's critical section.
//!
//! # Usage
//!
//! ```ignore
//! static LOCK: Mutex = Mutex::new();
//!
//! unsafe {
//!     LOCK.init(IpcFlag::Prio).unwrap();
//!
//!     LOCK.take(TIMEOUT_FOREVER).unwrap();
//!     // ... critical section, may take() again recursively ...
//!     LOCK.release().unwrap();
//! }
//! ```

use core::cell::UnsafeCell;
use core::ptr;

use crate::arch;
use crate::config::MUTEX_HOLD_MAX;
use crate::containing_record;
use crate::error::{KernelError, KernelResult};
use crate::ipc::{self, IpcFlag, IpcHeader};
use crate::sched;
use crate::thread::{Thread, ThreadCtrl, ThreadState};
use crate::timer::{self, TimerCtrl};

/// Sentinel for "no priority saved / no boost active".
const ORIGINAL_PRIORITY_NONE: u8 = 0xFF;

/// Recursive mutex object.
#[repr(C)]
pub struct Mutex {
    /// Common IPC header (validity, policy, wait list).
    parent: IpcHeader,
    /// Owning thread, null when free.
    owner: UnsafeCell<*mut Thread>,
    /// Availability: 1 free, 0 taken.
    count: UnsafeCell<u16>,
    /// Owner's priority before any inheritance boost; 0xFF when free.
    original_priority: UnsafeCell<u8>,
    /// Recursive acquisition depth.
    hold: UnsafeCell<u8>,
}

// Safety: mutated only under the kernel interrupt lock.
unsafe impl Sync for Mutex {}
unsafe impl Send for Mutex {}

impl Mutex {
    /// Create a new, uninitialized mutex.
    pub const fn new() -> Self {
        Self {
            parent: IpcHeader::new(),
            owner: UnsafeCell::new(ptr::null_mut()),
            count: UnsafeCell::new(0),
            original_priority: UnsafeCell::new(ORIGINAL_PRIORITY_NONE),
            hold: UnsafeCell::new(0),
        }
    }

    /// Initialize the mutex as free.
    pub unsafe fn init(&self, flag: IpcFlag) -> KernelResult {
        self.parent.init(flag);
        *self.owner.get() = ptr::null_mut();
        *self.count.get() = 1;
        *self.original_priority.get() = ORIGINAL_PRIORITY_NONE;
        *self.hold.get() = 0;
        Ok(())
    }

    /// Current owner, or null when free.
    #[inline]
    pub fn owner(&self) -> *mut Thread {
        unsafe { *self.owner.get() }
    }

    /// Recursive hold depth.
    #[inline]
    pub fn hold(&self) -> u8 {
        unsafe { *self.hold.get() }
    }

    /// Acquire the mutex.
    ///
    /// Recursion by the owner just deepens the hold (bounded by
    /// `MUTEX_HOLD_MAX`). A contending caller of higher priority boosts
    /// the owner to its own priority before blocking. `timeout` follows
    /// the usual convention: 0 = try once, negative = forever, positive =
    /// ticks.
    ///
    /// # Safety
    /// Blocking (non-zero timeout) requires thread context.
    pub unsafe fn take(&self, timeout: i32) -> KernelResult {
        if !self.parent.is_alive() {
            return Err(KernelError::Deleted);
        }

        let mut timeout = timeout;

        loop {
            let level = arch::irq_save();

            if !self.parent.is_alive() {
                arch::irq_restore(level);
                return Err(KernelError::Deleted);
            }

            let thread = sched::current_thread();
            if thread.is_null() {
                arch::irq_restore(level);
                return Err(KernelError::Unsupported);
            }

            if *self.owner.get() == thread {
                if *self.hold.get() < MUTEX_HOLD_MAX {
                    *self.hold.get() += 1;
                    arch::irq_restore(level);
                    return Ok(());
                }
                arch::irq_restore(level);
                return Err(KernelError::Error);
            }

            if *self.count.get() > 0 {
                // Free: take it, recording the owner's own priority for
                // the inheritance unwind.
                *self.count.get() -= 1;
                *self.owner.get() = thread;
                *self.hold.get() = 1;
                *self.original_priority.get() = (*thread).current_priority;
                arch::irq_restore(level);
                return Ok(());
            }

            if timeout == 0 {
                arch::irq_restore(level);
                return Err(KernelError::Error);
            }

            // Contended: inherit if the caller outranks the owner.
            let owner = *self.owner.get();
            if !owner.is_null() && (*thread).current_priority < (*owner).current_priority {
                let _ = (*owner).ctrl(ThreadCtrl::SetPriority((*thread).current_priority));
            }

            let _ = ipc::suspend_thread(self.parent.wait_list(), thread, self.parent.flag());

            let start_tick = timer::tick_get();
            if timeout > 0 {
                let _ = (*thread).timer.ctrl(TimerCtrl::SetDuration(timeout as u32));
                let _ = (*thread).timer.start();
            }

            arch::irq_restore(level);
            sched::reschedule();

            // Resumed: by handover, by the timeout, or by deletion.
            if !self.parent.is_alive() {
                return Err(KernelError::Deleted);
            }
            if *self.owner.get() == thread {
                return Ok(());
            }
            if timeout > 0 {
                let elapsed = timer::tick_get().wrapping_sub(start_tick);
                if elapsed as i32 >= timeout {
                    return Err(KernelError::Timeout);
                }
                timeout -= elapsed as i32;
            }
        }
    }

    /// Release the mutex.
    ///
    /// Only the owner may release. The final release restores any
    /// inherited priority and either hands ownership to the first waiter
    /// or frees the mutex.
    pub unsafe fn release(&self) -> KernelResult {
        if !self.parent.is_alive() {
            return Err(KernelError::Deleted);
        }

        let level = arch::irq_save();

        let thread = sched::current_thread();
        if thread.is_null() || thread != *self.owner.get() {
            arch::irq_restore(level);
            return Err(KernelError::Error);
        }

        if *self.hold.get() > 0 {
            *self.hold.get() -= 1;
        }
        if *self.hold.get() > 0 {
            arch::irq_restore(level);
            return Ok(());
        }

        if self.parent.has_waiters() {
            let waiter = containing_record!((*self.parent.wait_list()).next, Thread, tlist);
            (*waiter).tlist.remove();

            self.restore_owner_priority(thread);

            // Hand over: the waiter owns the mutex before it runs.
            *self.owner.get() = waiter;
            *self.hold.get() = 1;
            *self.count.get() = 0;
            *self.original_priority.get() = (*waiter).current_priority;

            let _ = (*waiter).timer.stop();
            (*waiter).state = ThreadState::READY;
            sched::insert_thread(waiter);

            arch::irq_restore(level);
            sched::reschedule();
        } else {
            self.restore_owner_priority(thread);

            *self.owner.get() = ptr::null_mut();
            *self.original_priority.get() = ORIGINAL_PRIORITY_NONE;
            if *self.count.get() < 1 {
                *self.count.get() += 1;
            }

            arch::irq_restore(level);
        }

        Ok(())
    }

    /// Delete the mutex: restore any inherited priority, resume every
    /// waiter (each observes `Deleted`) and invalidate the object.
    pub unsafe fn delete(&self) -> KernelResult {
        if !self.parent.is_alive() {
            return Ok(());
        }

        let had_waiters = self.parent.has_waiters();
        if had_waiters {
            ipc::resume_all(self.parent.wait_list());
        }

        let level = arch::irq_save();

        let owner = *self.owner.get();
        if !owner.is_null() {
            self.restore_owner_priority(owner);
        }

        *self.owner.get() = ptr::null_mut();
        *self.count.get() = 0;
        *self.hold.get() = 0;
        *self.original_priority.get() = ORIGINAL_PRIORITY_NONE;
        self.parent.set_dead();

        arch::irq_restore(level);

        if had_waiters {
            sched::reschedule();
        }
        Ok(())
    }

    /// Drop `owner` back to the priority recorded when it took the mutex,
    /// if a boost left it elevated.
    unsafe fn restore_owner_priority(&self, owner: *mut Thread) {
        let original = *self.original_priority.get();
        if original != ORIGINAL_PRIORITY_NONE && (*owner).current_priority != original {
            let _ = (*owner).ctrl(ThreadCtrl::SetPriority(original));
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TIMEOUT_FOREVER, TIMEOUT_NONE};
    use crate::test_util;
    use core::sync::atomic::{AtomicU8, Ordering};

    static PI_MUTEX: Mutex = Mutex::new();
    static mut LOW: Thread = Thread::new();
    static PRIORITY_DURING_WAIT: AtomicU8 = AtomicU8::new(0xFF);

    fn handover_hook() {
        // Runs while the high-priority waiter is suspended and the boosted
        // owner has been dispatched.
        unsafe {
            PRIORITY_DURING_WAIT.store((*ptr::addr_of!(LOW)).current_priority, Ordering::SeqCst);
            PI_MUTEX.release().unwrap();
        }
    }

    fn tick_twice_hook() {
        unsafe {
            timer::tick_increase();
            timer::tick_increase();
        }
    }

    #[test]
    fn test_free_mutex_invariants() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();
            let m = Mutex::new();
            m.init(IpcFlag::Fifo).unwrap();

            assert!(m.owner().is_null());
            assert_eq!(*m.count.get(), 1);
            assert_eq!(m.hold(), 0);
            assert_eq!(*m.original_priority.get(), ORIGINAL_PRIORITY_NONE);
        }
    }

    #[test]
    fn test_recursive_take_release_round_trip() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            let mut t = Thread::new();
            test_util::spawn(&mut t, 10, 10);
            sched::start();

            let m = Mutex::new();
            m.init(IpcFlag::Fifo).unwrap();

            for _ in 0..4 {
                m.take(TIMEOUT_NONE).unwrap();
            }
            assert_eq!(m.owner(), &mut t as *mut Thread);
            assert_eq!(m.hold(), 4);
            assert_eq!(*m.count.get(), 0);

            for _ in 0..4 {
                m.release().unwrap();
            }
            assert!(m.owner().is_null());
            assert_eq!(m.hold(), 0);
            assert_eq!(*m.count.get(), 1);
            assert_eq!(t.current_priority, 10);
        }
    }

    #[test]
    fn test_hold_saturation() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            let mut t = Thread::new();
            test_util::spawn(&mut t, 10, 10);
            sched::start();

            let m = Mutex::new();
            m.init(IpcFlag::Fifo).unwrap();

            for _ in 0..MUTEX_HOLD_MAX {
                m.take(TIMEOUT_NONE).unwrap();
            }
            assert_eq!(m.take(TIMEOUT_NONE), Err(KernelError::Error));
            assert_eq!(m.hold(), MUTEX_HOLD_MAX);
        }
    }

    #[test]
    fn test_release_by_non_owner_fails() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            let mut t1 = Thread::new();
            test_util::spawn(&mut t1, 10, 10);
            sched::start();

            let m = Mutex::new();
            m.init(IpcFlag::Fifo).unwrap();
            m.take(TIMEOUT_NONE).unwrap();

            // Dispatch a higher-priority thread; it does not own the mutex.
            let mut t2 = Thread::new();
            test_util::spawn(&mut t2, 5, 10);
            sched::reschedule();
            assert_eq!(sched::current_thread(), &mut t2 as *mut Thread);

            assert_eq!(m.release(), Err(KernelError::Error));
            assert_eq!(m.owner(), &mut t1 as *mut Thread);
        }
    }

    #[test]
    fn test_contended_take_with_zero_timeout_fails_fast() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            let mut t1 = Thread::new();
            test_util::spawn(&mut t1, 10, 10);
            sched::start();

            let m = Mutex::new();
            m.init(IpcFlag::Fifo).unwrap();
            m.take(TIMEOUT_NONE).unwrap();

            let mut t2 = Thread::new();
            test_util::spawn(&mut t2, 5, 10);
            sched::reschedule();

            assert_eq!(m.take(TIMEOUT_NONE), Err(KernelError::Error));
        }
    }

    #[test]
    fn test_priority_inheritance_boost_and_restore() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();
            PRIORITY_DURING_WAIT.store(0xFF, Ordering::SeqCst);
            PI_MUTEX.init(IpcFlag::Fifo).unwrap();

            let low = &mut *ptr::addr_of_mut!(LOW);
            *low = Thread::new();
            let mut high = Thread::new();
            let mut idle = Thread::new();
            test_util::spawn(low, 15, 10);
            test_util::spawn(&mut idle, 31, 10);
            sched::start();
            assert_eq!(sched::current_thread(), low as *mut Thread);

            PI_MUTEX.take(TIMEOUT_NONE).unwrap();

            // A high-priority contender arrives.
            test_util::spawn(&mut high, 10, 10);
            sched::reschedule();
            assert_eq!(sched::current_thread(), &mut high as *mut Thread);

            arch::set_switch_hook(handover_hook);
            assert_eq!(PI_MUTEX.take(TIMEOUT_FOREVER), Ok(()));

            // While the contender waited, the owner ran at its priority.
            assert_eq!(PRIORITY_DURING_WAIT.load(Ordering::SeqCst), 10);
            // After release the owner is back at its own priority and the
            // contender owns the mutex.
            assert_eq!(low.current_priority, 15);
            assert_eq!(PI_MUTEX.owner(), &mut high as *mut Thread);
            assert_eq!(PI_MUTEX.hold(), 1);
            assert_eq!(high.state, ThreadState::RUNNING);

            PI_MUTEX.release().unwrap();
            assert!(PI_MUTEX.owner().is_null());
        }
    }

    #[test]
    fn test_contended_take_times_out() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            let mut owner = Thread::new();
            let mut idle = Thread::new();
            test_util::spawn(&mut owner, 15, 100);
            test_util::spawn(&mut idle, 31, 100);
            sched::start();

            let m = Mutex::new();
            m.init(IpcFlag::Fifo).unwrap();
            m.take(TIMEOUT_NONE).unwrap();

            let mut waiter = Thread::new();
            test_util::spawn(&mut waiter, 10, 100);
            sched::reschedule();
            assert_eq!(sched::current_thread(), &mut waiter as *mut Thread);

            // The hook advances time past the deadline while the waiter
            // is blocked.
            arch::set_switch_hook(tick_twice_hook);
            assert_eq!(m.take(2), Err(KernelError::Timeout));
            assert_eq!(m.owner(), &mut owner as *mut Thread);
            assert!(!m.parent.has_waiters());
            assert_eq!(waiter.state, ThreadState::READY);

            // The boost stays in effect until the owner releases.
            assert_eq!(owner.current_priority, 10);
            waiter.suspend().unwrap();
            sched::reschedule();
            assert_eq!(sched::current_thread(), &mut owner as *mut Thread);
            m.release().unwrap();
            assert_eq!(owner.current_priority, 15);
            assert!(m.owner().is_null());
        }
    }

    #[test]
    fn test_delete_wakes_waiters_and_restores_priority() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            let mut owner = Thread::new();
            let mut idle = Thread::new();
            test_util::spawn(&mut owner, 15, 10);
            test_util::spawn(&mut idle, 31, 10);
            sched::start();

            let m = Mutex::new();
            m.init(IpcFlag::Fifo).unwrap();
            m.take(TIMEOUT_NONE).unwrap();

            m.delete().unwrap();
            assert!(!m.parent.is_alive());
            assert_eq!(m.take(TIMEOUT_NONE), Err(KernelError::Deleted));
            assert_eq!(m.release(), Err(KernelError::Deleted));
            assert_eq!(owner.current_priority, 15);
        }
    }
}
