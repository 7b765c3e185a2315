//! Hosted port, used by the unit tests (and any non-ARM build).
//!
//! Interrupt masking is emulated by a flag with the same save/restore
//! nesting semantics as PRIMASK. The context-switch entry points update a
//! switch counter and return to the caller instead of transferring
//! control, so a blocking kernel call runs to its suspension point and
//! then resumes in the calling test, which can inspect scheduler state.
//!
//! Tests may install a **one-shot switch hook** that runs inside the next
//! `normal_switch`. The hook executes at the exact instant a blocking
//! caller has been suspended and the scheduler has moved on, which is the
//! only place operations like "the owner releases the mutex while a waiter
//! blocks" can be interleaved on a single host thread.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

static IRQ_MASKED: AtomicBool = AtomicBool::new(false);
static CONTEXT_SWITCHES: AtomicUsize = AtomicUsize::new(0);
static SWITCH_HOOK: Mutex<Option<fn()>> = Mutex::new(None);

/// Size of the emulated first-run frame: R4-R11 plus the hardware frame,
/// 16 words, matching the Cortex-M layout.
const FRAME_SIZE: usize = 16 * 4;

/// Build the synthetic first-run frame for a thread.
///
/// Mirrors the Cortex-M port: aligns down to 8 bytes, reserves a zeroed
/// 16-word frame and returns its base as the saved stack pointer. The
/// frame is never executed on the host.
///
/// # Safety
/// `stack_top` must bound a valid, writable stack buffer large enough to
/// hold the frame after alignment.
pub unsafe fn stack_init(_entry: fn(), stack_top: *mut u8) -> *mut u8 {
    let mut sp = (stack_top as usize) & !7usize;
    sp -= FRAME_SIZE;
    ptr::write_bytes(sp as *mut u8, 0, FRAME_SIZE);
    sp as *mut u8
}

/// Disable "interrupts", returning the previous mask state. Nest-safe.
#[inline]
pub fn irq_save() -> usize {
    IRQ_MASKED.swap(true, Ordering::SeqCst) as usize
}

/// Restore the mask saved by [`irq_save`].
#[inline]
pub fn irq_restore(mask: usize) {
    IRQ_MASKED.store(mask != 0, Ordering::SeqCst);
}

/// Whether the emulated interrupt mask is currently set.
pub fn irq_masked() -> bool {
    IRQ_MASKED.load(Ordering::SeqCst)
}

/// Record the first switch and return (the host has no thread contexts).
pub unsafe fn first_switch(_next_psp_slot: *mut *mut u8) {
    CONTEXT_SWITCHES.fetch_add(1, Ordering::SeqCst);
}

/// Record a switch request, then run and clear the installed hook, if any.
pub unsafe fn normal_switch(_prev_psp_slot: *mut *mut u8, _next_psp_slot: *mut *mut u8) {
    CONTEXT_SWITCHES.fetch_add(1, Ordering::SeqCst);
    let hook = SWITCH_HOOK.lock().take();
    if let Some(hook) = hook {
        hook();
    }
}

/// Install a hook to run inside the next `normal_switch`. One-shot: the
/// hook is cleared before it is invoked.
pub fn set_switch_hook(hook: fn()) {
    *SWITCH_HOOK.lock() = Some(hook);
}

/// Number of switch requests since process start.
pub fn context_switches() -> usize {
    CONTEXT_SWITCHES.load(Ordering::SeqCst)
}

/// Reset the emulated port state (tests).
pub fn reset() {
    IRQ_MASKED.store(false, Ordering::SeqCst);
    *SWITCH_HOOK.lock() = None;
}

/// Idle hint.
#[inline]
pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

/// After a self-terminating thread reschedules, the hosted port simply
/// returns to the caller (there is no other context to run).
pub fn thread_exit_guard() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irq_mask_nesting() {
        let _guard = crate::test_util::lock();
        reset();
        assert!(!irq_masked());
        let outer = irq_save();
        assert!(irq_masked());
        let inner = irq_save();
        assert!(irq_masked());
        irq_restore(inner);
        assert!(irq_masked());
        irq_restore(outer);
        assert!(!irq_masked());
    }

    #[test]
    fn test_stack_init_aligns_frame() {
        fn entry() {}
        let mut stack = [0xAAu8; 256];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) };
        let sp = unsafe { stack_init(entry, top) };
        assert_eq!(sp as usize % 8, 0);
        assert!((sp as usize) >= stack.as_ptr() as usize);
        assert!((sp as usize) < top as usize);
        // The reserved frame is zeroed.
        let frame = unsafe { core::slice::from_raw_parts(sp, FRAME_SIZE) };
        assert!(frame.iter().all(|&b| b == 0));
    }
}
