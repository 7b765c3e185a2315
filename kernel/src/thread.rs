//! Thread management.
//!
//! A [`Thread`] control block and its stack are owned by the caller; the
//! kernel never allocates or frees them. Lifecycle:
//!
//! ```text
//! INIT -> READY <-> RUNNING -> SUSPEND -> READY ...
//!                     |
//!                     v
//!                TERMINATED -> DELETED -> (restart) READY
//! ```
//!
//! A terminated thread is parked on the defunct list until the idle thread
//! reclaims it ([`cleanup_defunct`]); reclamation only flips the state to
//! DELETED - the memory stays with the caller and the thread can be
//! restarted.
//!
//! Every thread embeds a timer whose callback, [`wake_timeout`], is shared
//! by `sleep` and by every timeout-aware IPC wait.

use core::ptr;

use bitflags::bitflags;

use crate::arch;
use crate::config::PRIORITY_MAX;
use crate::containing_record;
use crate::error::{KernelError, KernelResult};
use crate::list::ListEntry;
use crate::sched;
use crate::timer::{Timer, TimerCtrl};

bitflags! {
    /// Thread lifecycle status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct ThreadState: u8 {
        /// In a ready queue, waiting to run.
        const READY = 0x01;
        /// Blocked: sleeping or waiting on an IPC object.
        const SUSPEND = 0x02;
        /// Finished, awaiting reclamation on the defunct list.
        const TERMINATED = 0x08;
        /// Currently executing.
        const RUNNING = 0x10;
        /// Reclaimed; restartable.
        const DELETED = 0x20;
        /// Initialized but never started.
        const INIT = 0x80;
    }
}

/// Thread control block.
#[repr(C)]
pub struct Thread {
    /// Saved process stack pointer; opaque to portable code.
    pub psp: *mut u8,
    /// Entry function.
    pub entry: Option<fn()>,
    /// Stack buffer base (lowest address), caller-owned.
    pub stack_addr: *mut u8,
    /// Stack buffer size in bytes.
    pub stack_size: usize,
    /// List node, shared between the ready queue, IPC wait lists and the
    /// defunct list. A thread is in at most one of these at a time.
    pub tlist: ListEntry,

    /// Current (possibly inherited) priority; 0 is highest.
    pub current_priority: u8,
    /// Priority at creation, restored by inheritance unwinding.
    pub init_priority: u8,
    /// `1 << current_priority`, the thread's ready bitmap bit.
    pub number_mask: u32,

    /// Time slice length in ticks.
    pub init_tick: u32,
    /// Ticks left in the current slice.
    pub remaining_tick: u32,
    /// Lifecycle state.
    pub state: ThreadState,
    /// Per-thread sleep/timeout timer.
    pub timer: Timer,
}

impl Thread {
    /// Create a new, uninitialized thread control block.
    pub const fn new() -> Self {
        Self {
            psp: ptr::null_mut(),
            entry: None,
            stack_addr: ptr::null_mut(),
            stack_size: 0,
            tlist: ListEntry::new(),
            current_priority: 0,
            init_priority: 0,
            number_mask: 0,
            init_tick: 0,
            remaining_tick: 0,
            state: ThreadState::INIT,
            timer: Timer::new(),
        }
    }

    /// Field initialization shared by `init` and `restart`: no state
    /// transition, no queue insertion.
    unsafe fn init_fields(
        &mut self,
        entry: fn(),
        stack_addr: *mut u8,
        stack_size: usize,
        priority: u8,
        tick: u32,
    ) {
        self.tlist.init();

        self.entry = Some(entry);
        self.stack_addr = stack_addr;
        self.stack_size = stack_size;
        self.current_priority = priority;
        self.init_priority = priority;
        self.number_mask = 1 << priority;

        self.psp = arch::stack_init(entry, stack_addr.add(stack_size));

        self.init_tick = tick;
        self.remaining_tick = tick;
    }

    /// Initialize a thread.
    ///
    /// `stack_addr`/`stack_size` describe a caller-owned stack buffer that
    /// must outlive the thread and must not alias any other stack. `tick`
    /// is the round-robin time slice. The thread is left in the INIT state;
    /// call [`Thread::startup`] to make it schedulable.
    ///
    /// # Safety
    /// The control block and stack must stay valid for the thread's whole
    /// lifetime.
    pub unsafe fn init(
        &mut self,
        entry: fn(),
        stack_addr: *mut u8,
        stack_size: usize,
        priority: u8,
        tick: u32,
    ) -> KernelResult {
        if stack_addr.is_null() {
            return Err(KernelError::NullPtr);
        }
        if stack_size == 0 || tick == 0 {
            return Err(KernelError::Invalid);
        }
        if priority as usize >= PRIORITY_MAX {
            return Err(KernelError::Invalid);
        }

        self.init_fields(entry, stack_addr, stack_size, priority, tick);

        let self_ptr = self as *mut Thread as *mut u8;
        self.timer.init(wake_timeout, self_ptr, tick)?;

        self.state = ThreadState::INIT;
        Ok(())
    }

    /// Move an initialized (or suspended) thread into the ready queue.
    ///
    /// Restores the creation priority and reloads the time slice. Fails on
    /// a DELETED thread (use [`Thread::restart`]).
    pub unsafe fn startup(&mut self) -> KernelResult {
        if self.state == ThreadState::DELETED {
            return Err(KernelError::Error);
        }

        let level = arch::irq_save();

        self.current_priority = self.init_priority;
        self.number_mask = 1 << self.current_priority;
        self.state = ThreadState::READY;
        self.remaining_tick = self.init_tick;

        sched::insert_thread(self);

        arch::irq_restore(level);
        Ok(())
    }

    /// Suspend a thread without arming its timer. It stays blocked until
    /// something reinserts it (e.g. [`Thread::startup`]).
    pub unsafe fn suspend(&mut self) -> KernelResult {
        let level = arch::irq_save();
        sched::remove_thread(self);
        self.state = ThreadState::SUSPEND;
        arch::irq_restore(level);
        Ok(())
    }

    /// Terminate a thread and park it on the defunct list.
    ///
    /// Idempotent on an already TERMINATED thread; fails once the thread
    /// has been reclaimed (DELETED).
    pub unsafe fn delete(&mut self) -> KernelResult {
        if self.state == ThreadState::TERMINATED {
            return Ok(());
        }
        if self.state == ThreadState::DELETED {
            return Err(KernelError::Error);
        }

        sched::remove_thread(self);
        self.timer.stop()?;

        let level = arch::irq_save();
        self.state = ThreadState::TERMINATED;
        sched::scheduler_mut()
            .defunct_list
            .insert_before(ptr::addr_of_mut!(self.tlist));
        arch::irq_restore(level);
        Ok(())
    }

    /// Query or modify a thread property.
    ///
    /// Changing the priority of a queued (READY or RUNNING) thread
    /// relocates it to the queue of the new priority, keeping the ready
    /// bitmap consistent; on the running thread the scheduler's cached
    /// priority is refreshed as well. Priority inheritance is built on
    /// this.
    pub unsafe fn ctrl(&mut self, cmd: ThreadCtrl<'_>) -> KernelResult {
        match cmd {
            ThreadCtrl::GetState(out) => {
                *out = self.state;
                Ok(())
            }
            ThreadCtrl::GetPriority(out) => {
                *out = self.current_priority;
                Ok(())
            }
            ThreadCtrl::SetPriority(priority) => {
                if priority as usize >= PRIORITY_MAX {
                    return Err(KernelError::Invalid);
                }

                let level = arch::irq_save();

                let queued = self
                    .state
                    .intersects(ThreadState::READY | ThreadState::RUNNING);
                if queued {
                    sched::remove_thread(self);
                }
                self.current_priority = priority;
                self.number_mask = 1 << priority;
                if queued {
                    sched::insert_thread(self);
                }
                if self.state == ThreadState::RUNNING {
                    sched::scheduler_mut().current_priority = priority;
                }

                arch::irq_restore(level);
                Ok(())
            }
        }
    }

    /// Restart a reclaimed (DELETED) thread.
    ///
    /// Rebuilds the stack frame and the embedded timer from the original
    /// creation parameters and starts the thread; the result is equivalent
    /// to the freshly created thread in entry, stack, priority and slice.
    pub unsafe fn restart(&mut self) -> KernelResult {
        if self.state != ThreadState::DELETED {
            return Err(KernelError::Error);
        }
        let entry = match self.entry {
            Some(entry) => entry,
            None => return Err(KernelError::Error),
        };

        let level = arch::irq_save();
        self.tlist.remove();
        arch::irq_restore(level);

        let slice = self.init_tick;
        self.init_fields(entry, self.stack_addr, self.stack_size, self.init_priority, slice);
        let self_ptr = self as *mut Thread as *mut u8;
        self.timer.init(wake_timeout, self_ptr, slice)?;

        self.state = ThreadState::INIT;
        self.startup()
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed command for [`Thread::ctrl`].
pub enum ThreadCtrl<'a> {
    /// Read the lifecycle state.
    GetState(&'a mut ThreadState),
    /// Read the current priority.
    GetPriority(&'a mut u8),
    /// Change the current priority (0 = highest).
    SetPriority(u8),
}

/// Put the running thread to sleep for `tick` ticks.
///
/// The thread leaves the ready queue, its embedded timer is re-armed with
/// the duration, and the scheduler dispatches the next ready thread. The
/// timer's [`wake_timeout`] callback makes the thread ready again.
pub fn sleep(tick: u32) {
    let thread = sched::current_thread();
    if thread.is_null() {
        return;
    }

    unsafe {
        sched::remove_thread(thread);
        (*thread).state = ThreadState::SUSPEND;

        let _ = (*thread).timer.stop();
        let _ = (*thread).timer.ctrl(TimerCtrl::SetDuration(tick));
        let _ = (*thread).timer.start();

        sched::reschedule();
    }
}

/// Terminate the running thread: defunct-list it and dispatch the next
/// thread. Does not return on hardware; the thread's stack remains in use
/// until the switch completes, so a guard loop follows the reschedule.
pub fn exit() {
    let thread = sched::current_thread();
    if thread.is_null() {
        return;
    }

    unsafe {
        let level = arch::irq_save();

        sched::remove_thread(thread);
        let _ = (*thread).timer.stop();

        (*thread).state = ThreadState::TERMINATED;
        sched::scheduler_mut()
            .defunct_list
            .insert_before(ptr::addr_of_mut!((*thread).tlist));

        arch::irq_restore(level);

        sched::reschedule();
        arch::thread_exit_guard();
    }
}

/// Reclaim every TERMINATED thread: unlink it from the defunct list and
/// mark it DELETED. Called by the idle thread. Memory is caller-owned and
/// is not freed.
pub fn cleanup_defunct() {
    unsafe {
        let level = arch::irq_save();
        let sched = sched::scheduler_mut();
        while !sched.defunct_list.is_empty() {
            let thread = containing_record!(sched.defunct_list.next, Thread, tlist);
            (*thread).state = ThreadState::DELETED;
            (*thread).tlist.remove();
        }
        arch::irq_restore(level);
    }
}

/// Shared timeout callback of every thread's embedded timer.
///
/// Fires when a sleep or an IPC wait times out: unlinks the thread from
/// whatever wait list still holds it, makes it ready and triggers a
/// reschedule. The blocked operation then rechecks its condition and
/// reports the timeout.
pub(crate) unsafe fn wake_timeout(arg: *mut u8) {
    let thread = arg as *mut Thread;
    if thread.is_null() {
        return;
    }

    let level = arch::irq_save();
    (*thread).tlist.remove();
    (*thread).state = ThreadState::READY;
    sched::insert_thread(thread);
    arch::irq_restore(level);

    sched::reschedule();
}
