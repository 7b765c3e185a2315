//! Common IPC machinery.
//!
//! Every IPC object embeds an [`IpcHeader`]: a validity flag, the queuing
//! policy and a suspend list of blocked threads. The helpers here move
//! threads between the scheduler's ready queues and an object's suspend
//! list; the objects themselves decide when to block and whom to wake.

use core::cell::UnsafeCell;
use core::ptr;

use crate::arch;
use crate::containing_record;
use crate::error::{KernelError, KernelResult};
use crate::list::ListEntry;
use crate::sched;
use crate::thread::{Thread, ThreadState};

/// Queuing policy of an IPC object's suspend list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpcFlag {
    /// Wake waiters in arrival order.
    Fifo = 0,
    /// Wake the highest-priority waiter first (ties in arrival order).
    Prio = 1,
}

/// Shared prefix of every IPC object.
#[repr(C)]
pub struct IpcHeader {
    /// 1 while the object is alive, 0 once deleted.
    status: UnsafeCell<u8>,
    /// Queuing policy.
    flag: UnsafeCell<IpcFlag>,
    /// Blocked threads (list of thread `tlist` nodes).
    wait_list: UnsafeCell<ListEntry>,
}

// Safety: mutated only under the kernel interrupt lock.
unsafe impl Sync for IpcHeader {}
unsafe impl Send for IpcHeader {}

impl IpcHeader {
    pub const fn new() -> Self {
        Self {
            status: UnsafeCell::new(0),
            flag: UnsafeCell::new(IpcFlag::Fifo),
            wait_list: UnsafeCell::new(ListEntry::new()),
        }
    }

    /// Mark the object alive with the given policy and empty its wait list.
    pub unsafe fn init(&self, flag: IpcFlag) {
        *self.status.get() = 1;
        *self.flag.get() = flag;
        (*self.wait_list.get()).init();
    }

    /// Whether the object has not been deleted.
    #[inline]
    pub fn is_alive(&self) -> bool {
        unsafe { *self.status.get() != 0 }
    }

    /// Mark the object deleted.
    pub unsafe fn set_dead(&self) {
        *self.status.get() = 0;
        *self.flag.get() = IpcFlag::Fifo;
    }

    /// The queuing policy.
    #[inline]
    pub fn flag(&self) -> IpcFlag {
        unsafe { *self.flag.get() }
    }

    /// Raw access to the suspend list head.
    #[inline]
    pub unsafe fn wait_list(&self) -> *mut ListEntry {
        self.wait_list.get()
    }

    /// Whether any thread is blocked on the object.
    #[inline]
    pub fn has_waiters(&self) -> bool {
        unsafe { !(*self.wait_list.get()).is_empty() }
    }
}

/// Block a thread on a suspend list.
///
/// Removes the thread from its ready queue, marks it SUSPEND and links it
/// into `list`: FIFO appends at the tail, PRIO inserts before the first
/// waiter of numerically greater (i.e. lower) priority, after any equal
/// priorities.
///
/// # Safety
/// Must be called under the interrupt lock, normally on the running
/// thread.
pub unsafe fn suspend_thread(
    list: *mut ListEntry,
    thread: *mut Thread,
    flag: IpcFlag,
) -> KernelResult {
    if list.is_null() || thread.is_null() {
        return Err(KernelError::NullPtr);
    }

    let level = arch::irq_save();

    sched::remove_thread(thread);
    (*thread).state = ThreadState::SUSPEND;

    match flag {
        IpcFlag::Fifo => {
            (*list).insert_before(ptr::addr_of_mut!((*thread).tlist));
        }
        IpcFlag::Prio => {
            let mut p = (*list).next;
            while p != list {
                let waiter = containing_record!(p, Thread, tlist);
                if (*thread).current_priority < (*waiter).current_priority {
                    break;
                }
                p = (*p).next;
            }
            // Either before the first lower-priority waiter or at the tail.
            (*p).insert_before(ptr::addr_of_mut!((*thread).tlist));
        }
    }

    arch::irq_restore(level);
    Ok(())
}

/// Pop the first waiter off a suspend list and make it ready.
///
/// The waiter's timeout timer is disarmed so a pending timeout cannot
/// wake it a second time. Returns the woken thread, or null if the list
/// was empty. No reschedule is performed; the caller decides.
///
/// # Safety
/// `list` must be a valid suspend list head.
pub unsafe fn resume_first(list: *mut ListEntry) -> *mut Thread {
    let level = arch::irq_save();

    if (*list).is_empty() {
        arch::irq_restore(level);
        return ptr::null_mut();
    }

    let thread = containing_record!((*list).next, Thread, tlist);
    (*thread).tlist.remove();
    let _ = (*thread).timer.stop();
    (*thread).state = ThreadState::READY;
    sched::insert_thread(thread);

    arch::irq_restore(level);
    thread
}

/// Drain a suspend list, readying every waiter. No reschedule is
/// performed; the caller decides.
///
/// # Safety
/// `list` must be a valid suspend list head.
pub unsafe fn resume_all(list: *mut ListEntry) {
    if list.is_null() {
        return;
    }
    while !(*list).is_empty() {
        resume_first(list);
    }
}
