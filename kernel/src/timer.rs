//! Software timers and the system tick.
//!
//! Armed timers live in one global list ordered by absolute deadline
//! (`TIMER_SKIP_LIST_LEVEL` is fixed at 1, so the configured skip list
//! degenerates to this single ordered list). All deadline comparisons use
//! the signed difference `(a - b) as i32`, which stays correct across
//! tick-counter wrap for any window shorter than 2^31 ticks - the list is
//! ordered by time remaining, not by raw deadline value.
//!
//! The periodic tick ISR calls [`tick_increase`]: it advances the global
//! tick, charges the running thread's time slice (yielding on exhaustion)
//! and then drains expired timers. Callbacks run outside the critical
//! section so they may start or stop other timers and trigger reschedules.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch;
use crate::config::TICK_HZ;
use crate::containing_record;
use crate::error::KernelResult;
use crate::list::ListEntry;
use crate::sched;
use crate::thread::ThreadState;

/// Software timer control block.
///
/// A timer is either idle (its node is self-linked) or armed (linked into
/// the global deadline-ordered list). The callback is a plain function
/// pointer plus an opaque argument, so the expiry loop stays free of
/// allocation.
#[repr(C)]
pub struct Timer {
    /// Node in the global timer list.
    node: UnsafeCell<ListEntry>,
    /// Expiry callback.
    callback: UnsafeCell<Option<unsafe fn(*mut u8)>>,
    /// Opaque argument passed to the callback.
    arg: UnsafeCell<*mut u8>,
    /// Programmed duration in ticks.
    init_tick: UnsafeCell<u32>,
    /// Absolute deadline of the current arming.
    timeout_tick: UnsafeCell<u32>,
}

// Safety: mutated only under the kernel interrupt lock.
unsafe impl Sync for Timer {}
unsafe impl Send for Timer {}

impl Timer {
    /// Create a new, uninitialized timer.
    pub const fn new() -> Self {
        Self {
            node: UnsafeCell::new(ListEntry::new()),
            callback: UnsafeCell::new(None),
            arg: UnsafeCell::new(core::ptr::null_mut()),
            init_tick: UnsafeCell::new(0),
            timeout_tick: UnsafeCell::new(0),
        }
    }

    /// Initialize the timer with a callback, its argument and a duration
    /// in ticks. The timer is left idle.
    ///
    /// # Safety
    /// The timer must not currently be armed.
    pub unsafe fn init(
        &self,
        callback: unsafe fn(*mut u8),
        arg: *mut u8,
        tick: u32,
    ) -> KernelResult {
        (*self.node.get()).init();
        *self.callback.get() = Some(callback);
        *self.arg.get() = arg;
        *self.init_tick.get() = tick;
        *self.timeout_tick.get() = 0;
        Ok(())
    }

    /// Arm (or re-arm) the timer: compute the absolute deadline
    /// `now + duration` and insert in deadline order; equal deadlines keep
    /// arrival order.
    ///
    /// # Safety
    /// The timer must have been initialized.
    pub unsafe fn start(&self) -> KernelResult {
        let level = arch::irq_save();

        // Unlink first in case the timer is already armed.
        (*self.node.get()).remove();

        let timeout = tick_get().wrapping_add(*self.init_tick.get());
        *self.timeout_tick.get() = timeout;

        let head = timer_list_head();
        let mut p = (*head).next;
        while p != head {
            let other = containing_record!(p, Timer, node);
            let other_timeout = *(*other).timeout_tick.get();
            if other_timeout.wrapping_sub(timeout) as i32 > 0 {
                break;
            }
            p = (*p).next;
        }
        (*p).insert_before(self.node.get());

        arch::irq_restore(level);
        Ok(())
    }

    /// Disarm the timer. A stopped or never-armed timer is left unchanged.
    ///
    /// # Safety
    /// The timer must have been initialized.
    pub unsafe fn stop(&self) -> KernelResult {
        let level = arch::irq_save();
        (*self.node.get()).remove();
        arch::irq_restore(level);
        Ok(())
    }

    /// Query or modify the programmed duration.
    ///
    /// # Safety
    /// Concurrent arming must be excluded by the caller.
    pub unsafe fn ctrl(&self, cmd: TimerCtrl<'_>) -> KernelResult {
        match cmd {
            TimerCtrl::GetDuration(out) => {
                *out = *self.init_tick.get();
                Ok(())
            }
            TimerCtrl::SetDuration(tick) => {
                *self.init_tick.get() = tick;
                Ok(())
            }
        }
    }

    /// Programmed duration in ticks.
    #[inline]
    pub fn duration(&self) -> u32 {
        unsafe { *self.init_tick.get() }
    }

    /// Whether the timer is currently linked into the timer list.
    #[inline]
    pub fn is_armed(&self) -> bool {
        let node = unsafe { &*self.node.get() };
        !node.next.is_null() && !node.is_empty()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed command for [`Timer::ctrl`].
pub enum TimerCtrl<'a> {
    /// Read the programmed duration (ticks).
    GetDuration(&'a mut u32),
    /// Set the programmed duration (ticks); takes effect on the next start.
    SetDuration(u32),
}

/// Wrapper making the list head usable from a static.
struct TimerListHead(UnsafeCell<ListEntry>);

// Safety: mutated only under the kernel interrupt lock.
unsafe impl Sync for TimerListHead {}

/// Global timer list, ordered by time remaining until deadline.
static TIMER_LIST: TimerListHead = TimerListHead(UnsafeCell::new(ListEntry::new()));

/// Global monotonic tick counter; wraps at 2^32.
static TICK: AtomicU32 = AtomicU32::new(0);

#[inline]
fn timer_list_head() -> *mut ListEntry {
    TIMER_LIST.0.get()
}

/// Initialize (empty) the global timer list.
///
/// # Safety
/// Must not race with armed timers; called once during kernel init.
pub unsafe fn list_init() {
    (*timer_list_head()).init();
}

/// Current tick count since start.
#[inline]
pub fn tick_get() -> u32 {
    TICK.load(Ordering::Relaxed)
}

/// Overwrite the tick counter (time resynchronization, tests).
#[inline]
pub fn tick_set(tick: u32) {
    TICK.store(tick, Ordering::Relaxed);
}

/// Convert milliseconds to ticks at the configured tick rate.
#[inline]
pub fn tick_from_millis(ms: u32) -> u32 {
    if ms == 0 {
        0
    } else {
        ms * TICK_HZ / 1000
    }
}

/// Sleep the running thread for a millisecond duration.
pub fn mdelay(ms: u32) {
    crate::thread::sleep(tick_from_millis(ms));
}

/// Sleep the running thread for a tick duration.
pub fn delay(tick: u32) {
    crate::thread::sleep(tick);
}

/// Tick ISR hook: advance time, charge the running thread's slice and
/// process timer expirations.
///
/// Before the scheduler starts only the tick counter advances.
///
/// # Safety
/// Called from the tick interrupt (or a test driving time forward).
pub unsafe fn tick_increase() {
    TICK.fetch_add(1, Ordering::Relaxed);

    let thread = sched::current_thread();
    if thread.is_null() {
        return;
    }

    if (*thread).state == ThreadState::RUNNING {
        let level = arch::irq_save();
        (*thread).remaining_tick = (*thread).remaining_tick.saturating_sub(1);
        if (*thread).remaining_tick == 0 {
            (*thread).remaining_tick = (*thread).init_tick;
            arch::irq_restore(level);
            sched::yield_now();
        } else {
            arch::irq_restore(level);
        }
    }

    check();
}

/// Fire every expired timer.
///
/// Expired entries are first moved to a local list under the interrupt
/// lock (the list is ordered, so the scan stops at the first live timer);
/// the callbacks then run with interrupts restored.
///
/// # Safety
/// Callable from interrupt or thread context.
pub unsafe fn check() {
    let mut expired = ListEntry::new();
    expired.init();

    let level = arch::irq_save();
    let head = timer_list_head();
    while !(*head).is_empty() {
        let node = (*head).next;
        let timer = containing_record!(node, Timer, node);

        if tick_get().wrapping_sub(*(*timer).timeout_tick.get()) as i32 >= 0 {
            (*node).remove();
            expired.insert_before(node);
        } else {
            break;
        }
    }
    arch::irq_restore(level);

    while !expired.is_empty() {
        let node = expired.next;
        let timer = containing_record!(node, Timer, node);
        (*node).remove();

        if let Some(callback) = *(*timer).callback.get() {
            callback(*(*timer).arg.get());
        }
    }
}
