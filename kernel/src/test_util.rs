//! Shared helpers for the host-run kernel tests.
//!
//! The kernel state is a process-wide singleton, so every test that
//! touches it takes [`lock`] first and then calls [`reset_kernel`].

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::arch;
use crate::sched;
use crate::thread::Thread;
use crate::timer;

/// Serialize tests that touch the global kernel state.
pub fn lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reset every kernel global to its boot state.
pub unsafe fn reset_kernel() {
    arch::reset();
    sched::init();
    timer::list_init();
    timer::tick_set(0);
}

/// Entry point for threads that never actually run on the hosted port.
pub fn nop_entry() {}

/// Initialize and start a thread on a leaked stack.
pub unsafe fn spawn(thread: *mut Thread, priority: u8, slice: u32) {
    let stack = Box::leak(Box::new([0u8; 512]));
    (*thread)
        .init(nop_entry, stack.as_mut_ptr(), stack.len(), priority, slice)
        .unwrap();
    (*thread).startup().unwrap();
}
