//! Priority scheduler.
//!
//! 32-level strict-priority scheduling with O(1) selection:
//!
//! - one FIFO ready queue per priority level (intrusive circular lists)
//! - a ready bitmap with bit `p` set iff queue `p` is non-empty
//! - priority 0 is the highest; selection is find-first-set on the bitmap
//!
//! Threads of equal priority round-robin: a yielding or slice-exhausted
//! thread rotates to the tail of its own queue. The actual transfer of
//! control is delegated to the architecture port's switch entry points;
//! on Cortex-M that pends the PendSV exception, so calling
//! [`reschedule`] from an ISR is safe.
//!
//! All scheduler state lives in a single control block mutated only under
//! the interrupt lock.

use core::ptr;

use crate::arch;
use crate::config::PRIORITY_MAX;
use crate::containing_record;
use crate::list::ListEntry;
use crate::thread::{Thread, ThreadState};

/// Global scheduler control block.
#[repr(C)]
pub struct Scheduler {
    /// Currently running thread (null before [`start`]).
    pub current_thread: *mut Thread,
    /// Cached priority of the running thread.
    pub current_priority: u8,
    /// Bitmap of non-empty ready queues; bit `p` covers `ready_queues[p]`.
    pub ready_group: u32,
    /// Per-priority ready queues (circular list sentinels).
    pub ready_queues: [ListEntry; PRIORITY_MAX],
    /// Threads awaiting final reclamation by the idle thread.
    pub defunct_list: ListEntry,
    /// Number of context switches performed.
    pub context_switches: u64,
}

impl Scheduler {
    pub const fn new() -> Self {
        const EMPTY: ListEntry = ListEntry::new();
        Self {
            current_thread: ptr::null_mut(),
            current_priority: 0,
            ready_group: 0,
            ready_queues: [EMPTY; PRIORITY_MAX],
            defunct_list: ListEntry::new(),
            context_switches: 0,
        }
    }
}

static mut SCHEDULER: Scheduler = Scheduler::new();

/// Get the scheduler control block.
///
/// # Safety
/// Caller must hold the interrupt lock or otherwise guarantee exclusive
/// access (single-core, pre-start initialization).
#[inline]
pub unsafe fn scheduler_mut() -> &'static mut Scheduler {
    &mut *ptr::addr_of_mut!(SCHEDULER)
}

/// Get the currently running thread, or null before the scheduler starts.
#[inline]
pub fn current_thread() -> *mut Thread {
    unsafe { (*ptr::addr_of!(SCHEDULER)).current_thread }
}

/// Initialize the scheduler: empty every ready queue, clear the bitmap and
/// the current thread, and reset the defunct list.
///
/// # Safety
/// Must run before any thread is started; not reentrant with a live
/// scheduler.
pub unsafe fn init() {
    let sched = scheduler_mut();
    for queue in sched.ready_queues.iter_mut() {
        queue.init();
    }
    sched.defunct_list.init();
    sched.ready_group = 0;
    sched.current_thread = ptr::null_mut();
    sched.current_priority = 0;
    sched.context_switches = 0;
}

/// Append a thread to the tail of its priority's ready queue and set the
/// ready bit.
///
/// # Safety
/// The thread must not currently be linked into any list.
pub unsafe fn insert_thread(thread: *mut Thread) {
    if thread.is_null() {
        return;
    }

    let level = arch::irq_save();

    let sched = scheduler_mut();
    let priority = (*thread).current_priority as usize;
    sched.ready_queues[priority].insert_before(ptr::addr_of_mut!((*thread).tlist));
    sched.ready_group |= (*thread).number_mask;

    arch::irq_restore(level);
}

/// Unlink a thread from its ready queue, clearing the ready bit if the
/// queue becomes empty.
///
/// # Safety
/// `thread` must be a valid thread control block.
pub unsafe fn remove_thread(thread: *mut Thread) {
    if thread.is_null() {
        return;
    }

    let level = arch::irq_save();

    (*thread).tlist.remove();

    let sched = scheduler_mut();
    let priority = (*thread).current_priority as usize;
    if sched.ready_queues[priority].is_empty() {
        sched.ready_group &= !(*thread).number_mask;
    }

    arch::irq_restore(level);
}

/// Start scheduling: dispatch the highest-priority ready thread and
/// perform the first context switch.
///
/// On hardware this never returns. At least one thread (normally the idle
/// thread) must be ready.
///
/// # Safety
/// Must be called exactly once, after [`init`] and after at least one
/// successful [`Thread::startup`].
pub unsafe fn start() {
    let sched = scheduler_mut();

    let highest = arch::ffs(sched.ready_group);
    debug_assert!(highest != 0, "scheduler started with no ready thread");
    let priority = (highest - 1) as usize;

    let next = containing_record!(sched.ready_queues[priority].next, Thread, tlist);

    sched.current_thread = next;
    sched.current_priority = (*next).current_priority;
    (*next).state = ThreadState::RUNNING;
    (*next).remaining_tick = (*next).init_tick;

    arch::first_switch(ptr::addr_of_mut!((*next).psp));
}

/// Switch to the highest-priority ready thread, if it differs from the
/// running one.
///
/// The outgoing thread is demoted from RUNNING to READY unless it already
/// left the RUNNING state (sleep, block, exit). The incoming thread gets a
/// fresh time slice.
///
/// # Safety
/// The ready queues must be consistent; callable from thread or interrupt
/// context.
pub unsafe fn reschedule() {
    let level = arch::irq_save();

    let sched = scheduler_mut();
    let highest = arch::ffs(sched.ready_group);
    if highest == 0 {
        arch::irq_restore(level);
        return;
    }
    let priority = (highest - 1) as usize;

    let next = containing_record!(sched.ready_queues[priority].next, Thread, tlist);
    if next == sched.current_thread {
        arch::irq_restore(level);
        return;
    }

    let prev = sched.current_thread;
    sched.current_thread = next;
    sched.current_priority = (*next).current_priority;

    if !prev.is_null() && (*prev).state == ThreadState::RUNNING {
        (*prev).state = ThreadState::READY;
    }
    (*next).state = ThreadState::RUNNING;
    (*next).remaining_tick = (*next).init_tick;
    sched.context_switches += 1;

    // Before the scheduler starts `prev` is null; the port treats a null
    // save slot as "restore only".
    let prev_slot = if prev.is_null() {
        ptr::null_mut()
    } else {
        ptr::addr_of_mut!((*prev).psp)
    };
    arch::normal_switch(prev_slot, ptr::addr_of_mut!((*next).psp));

    arch::irq_restore(level);
}

/// Rotate the running thread to the tail of its priority queue and
/// reschedule. A no-op when the thread is alone at its priority.
///
/// # Safety
/// Must be called from thread context with a running thread.
pub unsafe fn yield_now() {
    let thread = current_thread();
    if thread.is_null() {
        return;
    }

    let level = arch::irq_save();

    let sched = scheduler_mut();
    let queue = &mut sched.ready_queues[(*thread).current_priority as usize];
    let node = ptr::addr_of_mut!((*thread).tlist);

    // Alone at this priority: nothing to rotate.
    if queue.next == node && queue.prev == node {
        arch::irq_restore(level);
        return;
    }

    (*node).remove();
    queue.insert_before(node);

    arch::irq_restore(level);

    reschedule();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn test_insert_remove_tracks_bitmap() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            let mut t1 = Thread::new();
            let mut t2 = Thread::new();
            test_util::spawn(&mut t1, 5, 10);
            test_util::spawn(&mut t2, 5, 10);

            let sched = scheduler_mut();
            assert_eq!(sched.ready_group, 1 << 5);

            remove_thread(&mut t1);
            assert_eq!(sched.ready_group, 1 << 5);

            remove_thread(&mut t2);
            assert_eq!(sched.ready_group, 0);
            assert!(sched.ready_queues[5].is_empty());
        }
    }

    #[test]
    fn test_start_picks_highest_priority() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            let mut low = Thread::new();
            let mut high = Thread::new();
            test_util::spawn(&mut low, 20, 10);
            test_util::spawn(&mut high, 3, 7);

            start();

            assert_eq!(current_thread(), &mut high as *mut Thread);
            assert_eq!(high.state, ThreadState::RUNNING);
            assert_eq!(high.remaining_tick, 7);
            assert_eq!(low.state, ThreadState::READY);
            assert_eq!(scheduler_mut().current_priority, 3);
        }
    }

    #[test]
    fn test_reschedule_prefers_new_higher_priority() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            let mut low = Thread::new();
            test_util::spawn(&mut low, 20, 10);
            start();
            assert_eq!(current_thread(), &mut low as *mut Thread);

            let mut high = Thread::new();
            test_util::spawn(&mut high, 4, 10);
            reschedule();

            assert_eq!(current_thread(), &mut high as *mut Thread);
            assert_eq!(high.state, ThreadState::RUNNING);
            assert_eq!(low.state, ThreadState::READY);
        }
    }

    #[test]
    fn test_reschedule_same_thread_is_noop() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            let mut t = Thread::new();
            test_util::spawn(&mut t, 8, 10);
            start();

            let switches = scheduler_mut().context_switches;
            reschedule();
            assert_eq!(scheduler_mut().context_switches, switches);
            assert_eq!(current_thread(), &mut t as *mut Thread);
            assert!(!arch::irq_masked());
        }
    }

    #[test]
    fn test_yield_rotates_equal_priority() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            let mut t1 = Thread::new();
            let mut t2 = Thread::new();
            test_util::spawn(&mut t1, 6, 10);
            test_util::spawn(&mut t2, 6, 10);
            start();
            assert_eq!(current_thread(), &mut t1 as *mut Thread);

            yield_now();
            assert_eq!(current_thread(), &mut t2 as *mut Thread);
            assert_eq!(t1.state, ThreadState::READY);
            assert_eq!(t2.state, ThreadState::RUNNING);

            yield_now();
            assert_eq!(current_thread(), &mut t1 as *mut Thread);
        }
    }

    #[test]
    fn test_yield_alone_is_noop_and_restores_irq() {
        let _guard = test_util::lock();
        unsafe {
            test_util::reset_kernel();

            let mut t = Thread::new();
            test_util::spawn(&mut t, 6, 10);
            start();

            yield_now();
            assert_eq!(current_thread(), &mut t as *mut Thread);
            assert_eq!(t.state, ThreadState::RUNNING);
            assert!(!arch::irq_masked());
        }
    }
}
