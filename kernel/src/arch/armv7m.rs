//! Cortex-M3/M4 port.
//!
//! Threads run in Thread mode on the process stack (PSP); the kernel and
//! all exception handlers use the main stack (MSP). A context switch is
//! requested by pending the PendSV exception, which is configured to the
//! lowest priority so the actual switch never preempts a device ISR - it
//! runs once every other exception has retired.
//!
//! On exception entry the hardware stacks R0-R3, R12, LR, PC and xPSR onto
//! the process stack; the PendSV handler saves and restores R4-R11 around
//! that hardware frame, which completes the full context.

use core::arch::naked_asm;
use core::ptr;

/// Interrupt Control and State Register.
const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
/// ICSR bit that pends the PendSV exception.
const PENDSV_SET: u32 = 1 << 28;
/// System Handler Priority Register 3 (PendSV and SysTick priority bytes).
const SHPR3: *mut u32 = 0xE000_ED20 as *mut u32;

/// Pending-switch flag consumed by the PendSV handler.
static mut SWITCH_PENDING: u32 = 0;
/// Address of the outgoing thread's saved-PSP slot (0 on the first switch).
static mut PREV_SP_SLOT: u32 = 0;
/// Address of the incoming thread's saved-PSP slot.
static mut NEXT_SP_SLOT: u32 = 0;

/// Initial register frame placed at the top of a new thread's stack.
///
/// Layout matches the PendSV save/restore sequence: the software-saved
/// R4-R11 block followed by the hardware-stacked exception frame.
#[repr(C)]
struct StackFrame {
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,

    // Hardware-stacked on exception entry
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    psr: u32,
}

/// Build the synthetic first-run frame for a thread.
///
/// `stack_top` is the byte address one past the end of the stack buffer.
/// Returns the post-frame stack pointer (the thread's initial PSP). If the
/// entry function returns, control falls through to [`crate::thread::exit`].
///
/// # Safety
/// `stack_top` must bound a valid, writable stack buffer large enough to
/// hold the frame after 8-byte alignment.
pub unsafe fn stack_init(entry: fn(), stack_top: *mut u8) -> *mut u8 {
    // 8-byte alignment per AAPCS and exception entry requirements.
    let mut sp = (stack_top as usize) & !7usize;
    sp -= core::mem::size_of::<StackFrame>();

    let frame = sp as *mut StackFrame;
    ptr::write_bytes(frame as *mut u8, 0, core::mem::size_of::<StackFrame>());

    (*frame).psr = 0x0100_0000; // xPSR: Thumb state bit
    (*frame).pc = entry as usize as u32;
    (*frame).lr = crate::thread::exit as usize as u32;

    sp as *mut u8
}

#[inline]
fn trigger_pendsv() {
    unsafe { ptr::write_volatile(ICSR, PENDSV_SET) }
}

/// Drop PendSV and SysTick to the lowest exception priority.
fn set_switch_priority_lowest() {
    unsafe {
        let value = ptr::read_volatile(SHPR3);
        ptr::write_volatile(SHPR3, value | (0xFF << 16) | (0xFF << 24));
    }
}

/// Disable interrupts, returning the previous mask state. Nest-safe.
#[inline]
pub fn irq_save() -> usize {
    let enabled = cortex_m::register::primask::read().is_active();
    cortex_m::interrupt::disable();
    enabled as usize
}

/// Restore the interrupt mask saved by [`irq_save`].
#[inline]
pub fn irq_restore(mask: usize) {
    if mask != 0 {
        unsafe { cortex_m::interrupt::enable() }
    }
}

/// Begin execution in the thread whose saved-PSP slot is `next_psp_slot`.
///
/// Publishes the slot, pends PendSV and enables interrupts; the first
/// PendSV performs a restore-only switch. Does not return.
///
/// # Safety
/// Must be called exactly once, after the scheduler selected a startable
/// thread whose frame was built by [`stack_init`].
pub unsafe fn first_switch(next_psp_slot: *mut *mut u8) {
    PREV_SP_SLOT = 0;
    NEXT_SP_SLOT = next_psp_slot as u32;
    SWITCH_PENDING = 1;

    set_switch_priority_lowest();
    trigger_pendsv();
    cortex_m::interrupt::enable();

    // The pended exception takes over; this context is abandoned.
    loop {
        cortex_m::asm::wfi();
    }
}

/// Request a context switch: save to `prev_psp_slot`, resume from
/// `next_psp_slot`.
///
/// Only pends the exception; the switch itself happens in PendSV once the
/// current exception nest unwinds. If a switch is already pending, only
/// the destination is updated - the save target stays the thread that was
/// running when the first request was made.
///
/// # Safety
/// Both slots must point into live thread control blocks.
pub unsafe fn normal_switch(prev_psp_slot: *mut *mut u8, next_psp_slot: *mut *mut u8) {
    let mask = irq_save();
    if SWITCH_PENDING == 0 {
        SWITCH_PENDING = 1;
        PREV_SP_SLOT = prev_psp_slot as u32;
    }
    NEXT_SP_SLOT = next_psp_slot as u32;
    trigger_pendsv();
    irq_restore(mask);
}

/// PendSV exception handler: the deferred context switch.
///
/// Saves R4-R11 of the outgoing thread below its hardware-stacked frame,
/// stores the resulting PSP through the published slot, then reloads the
/// incoming thread's PSP and unstacks its R4-R11. Returns to Thread mode
/// on the process stack.
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs     r2, primask",
        "cpsid   i",
        // Consume the pending flag; spurious PendSV is a no-op.
        "ldr     r0, ={pending}",
        "ldr     r1, [r0]",
        "cbz     r1, 2f",
        "movs    r1, #0",
        "str     r1, [r0]",
        // Save the outgoing context unless this is the first switch.
        "ldr     r0, ={prev}",
        "ldr     r1, [r0]",
        "cbz     r1, 1f",
        "mrs     r3, psp",
        "stmdb   r3!, {{r4-r11}}",
        "str     r3, [r1]",
        "1:",
        // Restore the incoming context.
        "ldr     r0, ={next}",
        "ldr     r1, [r0]",
        "ldr     r1, [r1]",
        "ldmia   r1!, {{r4-r11}}",
        "msr     psp, r1",
        "2:",
        "msr     primask, r2",
        // Return to Thread mode using the process stack.
        "orr     lr, lr, #0x04",
        "bx      lr",
        pending = sym SWITCH_PENDING,
        prev = sym PREV_SP_SLOT,
        next = sym NEXT_SP_SLOT,
    )
}

/// Idle hint: sleep until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Spin after a thread terminates itself.
///
/// The exiting thread's stack remains in use until the pended switch
/// retires, so execution must not proceed past this point.
pub fn thread_exit_guard() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}
