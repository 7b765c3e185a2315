//! Idle thread.
//!
//! Runs at the lowest priority (`PRIORITY_MAX - 1`, reserved for it) and
//! is therefore dispatched exactly when nothing else is ready. Its loop
//! reclaims defunct threads and parks the core until the next interrupt.

use core::ptr;

use crate::arch;
use crate::config::{IDLE_STACK_SIZE, IDLE_TICK_SLICE, PRIORITY_MAX};
use crate::error::KernelResult;
use crate::thread::{self, Thread};

#[repr(C, align(8))]
struct IdleStack {
    data: [u8; IDLE_STACK_SIZE],
}

static mut IDLE_STACK: IdleStack = IdleStack {
    data: [0; IDLE_STACK_SIZE],
};

static mut IDLE_THREAD: Thread = Thread::new();

fn idle_entry() {
    loop {
        thread::cleanup_defunct();
        arch::wait_for_interrupt();
    }
}

/// Initialize and start the idle thread.
///
/// # Safety
/// Must run during kernel initialization, after the scheduler is set up.
pub unsafe fn init() -> KernelResult {
    let idle = &mut *ptr::addr_of_mut!(IDLE_THREAD);
    let stack = ptr::addr_of_mut!(IDLE_STACK) as *mut u8;

    idle.init(
        idle_entry,
        stack,
        IDLE_STACK_SIZE,
        (PRIORITY_MAX - 1) as u8,
        IDLE_TICK_SLICE,
    )?;
    idle.startup()
}

/// The idle thread's control block.
pub fn idle_thread() -> *mut Thread {
    unsafe { ptr::addr_of_mut!(IDLE_THREAD) }
}
