//! Fixed-size message queue.
//!
//! The caller supplies a raw memory pool; `init` carves it into slots of
//! one intrusive header plus a word-aligned payload. Free slots form a
//! LIFO stack; queued messages form a singly-linked FIFO. Payload copies
//! run outside the interrupt lock.
//!
//! Receivers block on the common suspend list, senders on a second list
//! when the queue is full. [`MessageQueue::urgent`] jumps the FIFO by
//! inserting at the head.
//!
//! # Usage
//!
//! ```ignore
//! static MQ: MessageQueue = MessageQueue::new();
//! static mut POOL: [u8; msgq_pool_size(16, 8)] = [0; msgq_pool_size(16, 8)];
//!
//! unsafe {
//!     MQ.init(POOL.as_mut_ptr(), 16, POOL.len(), IpcFlag::Fifo).unwrap();
//!     MQ.send(b"ping").unwrap();
//!
//!     let mut buf = [0u8; 16];
//!     let len = MQ.recv(&mut buf, TIMEOUT_FOREVER).unwrap();
//! }
//! ```

use core::cell::UnsafeCell;
use core::ptr;

use crate::arch;
use crate::config::{align_up, ALIGN_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::ipc::{self, IpcFlag, IpcHeader};
use crate::list::ListEntry;
use crate::sched;
use crate::timer::{self, TimerCtrl};

/// Intrusive slot header preceding each payload in the pool.
#[repr(C)]
struct MsgNode {
    next: *mut MsgNode,
}

/// Pool bytes required for `msg_count` messages of `msg_size` bytes each.
pub const fn msgq_pool_size(msg_size: usize, msg_count: usize) -> usize {
    msg_count * (core::mem::size_of::<MsgNode>() + align_up(msg_size, ALIGN_SIZE))
}

/// Message queue object.
#[repr(C)]
pub struct MessageQueue {
    /// Common IPC header; its suspend list holds blocked receivers.
    parent: IpcHeader,
    /// Caller-provided pool base.
    pool: UnsafeCell<*mut u8>,
    /// Word-aligned payload capacity of one slot.
    msg_size: UnsafeCell<usize>,
    /// Total number of slots.
    max_msgs: UnsafeCell<usize>,
    /// Messages currently queued.
    index: UnsafeCell<usize>,
    /// FIFO head (next message to receive).
    head: UnsafeCell<*mut MsgNode>,
    /// FIFO tail (most recently sent).
    tail: UnsafeCell<*mut MsgNode>,
    /// LIFO stack of free slots.
    free: UnsafeCell<*mut MsgNode>,
    /// Blocked senders (queue full).
    sender_wait_list: UnsafeCell<ListEntry>,
}

// Safety: mutated only under the kernel interrupt lock.
unsafe impl Sync for MessageQueue {}
unsafe impl Send for MessageQueue {}

impl MessageQueue {
    /// Create a new, uninitialized message queue.
    pub const fn new() -> Self {
        Self {
            parent: IpcHeader::new(),
            pool: UnsafeCell::new(ptr::null_mut()),
            msg_size: UnsafeCell::new(0),
            max_msgs: UnsafeCell::new(0),
            index: UnsafeCell::new(0),
            head: UnsafeCell::new(ptr::null_mut()),
            tail: UnsafeCell::new(ptr::null_mut()),
            free: UnsafeCell::new(ptr::null_mut()),
            sender_wait_list: UnsafeCell::new(ListEntry::new()),
        }
    }

    /// Initialize the queue over a caller-owned pool.
    ///
    /// `msg_size` is the maximum payload per message (aligned up to a
    /// word); the capacity is however many header+payload slots fit in
    /// `pool_size` bytes.
    ///
    /// # Safety
    /// The pool must stay valid and unaliased for the queue's lifetime.
    pub unsafe fn init(
        &self,
        pool: *mut u8,
        msg_size: usize,
        pool_size: usize,
        flag: IpcFlag,
    ) -> KernelResult {
        if pool.is_null() {
            return Err(KernelError::NullPtr);
        }
        if msg_size == 0 || pool_size == 0 {
            return Err(KernelError::Invalid);
        }

        let aligned_size = align_up(msg_size, ALIGN_SIZE);
        let slot_size = core::mem::size_of::<MsgNode>() + aligned_size;
        if pool_size < slot_size {
            return Err(KernelError::Invalid);
        }
        let max_msgs = pool_size / slot_size;

        self.parent.init(flag);
        (*self.sender_wait_list.get()).init();

        *self.pool.get() = pool;
        *self.msg_size.get() = aligned_size;
        *self.max_msgs.get() = max_msgs;
        *self.index.get() = 0;
        *self.head.get() = ptr::null_mut();
        *self.tail.get() = ptr::null_mut();
        *self.free.get() = ptr::null_mut();

        // Thread every slot onto the free stack.
        for i in 0..max_msgs {
            let node = pool.add(i * slot_size) as *mut MsgNode;
            (*node).next = *self.free.get();
            *self.free.get() = node;
        }
        Ok(())
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        unsafe { *self.max_msgs.get() }
    }

    /// Number of queued messages.
    #[inline]
    pub fn len(&self) -> usize {
        unsafe { *self.index.get() }
    }

    /// Whether no message is queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send a message, blocking while the queue is full.
    ///
    /// `timeout`: 0 = try once, negative = forever, positive = ticks. The
    /// remaining time is re-armed on every wake, so several full/wake
    /// cycles share one deadline.
    ///
    /// # Safety
    /// Blocking (non-zero timeout) requires thread context.
    pub unsafe fn send_wait(&self, buffer: &[u8], timeout: i32) -> KernelResult {
        if !self.parent.is_alive() {
            return Err(KernelError::Deleted);
        }
        if buffer.is_empty() || buffer.len() > *self.msg_size.get() {
            return Err(KernelError::Invalid);
        }

        let mut timeout = timeout;

        loop {
            let level = arch::irq_save();

            if !self.parent.is_alive() {
                arch::irq_restore(level);
                return Err(KernelError::Deleted);
            }

            if !(*self.free.get()).is_null() {
                // Pop a free slot; copy the payload with interrupts on.
                let node = *self.free.get();
                *self.free.get() = (*node).next;
                arch::irq_restore(level);

                ptr::copy_nonoverlapping(buffer.as_ptr(), payload(node), buffer.len());

                let level = arch::irq_save();
                (*node).next = ptr::null_mut();
                if !(*self.tail.get()).is_null() {
                    (**self.tail.get()).next = node;
                }
                *self.tail.get() = node;
                if (*self.head.get()).is_null() {
                    *self.head.get() = node;
                }
                *self.index.get() += 1;

                let waiter = if self.parent.has_waiters() {
                    ipc::resume_first(self.parent.wait_list())
                } else {
                    ptr::null_mut()
                };
                arch::irq_restore(level);

                if !waiter.is_null() {
                    sched::reschedule();
                }
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

            let _ = ipc::suspend_thread(self.sender_wait_list.get(), thread, self.parent.flag());

            let start_tick = timer::tick_get();
            if timeout > 0 {
                let _ = (*thread).timer.ctrl(TimerCtrl::SetDuration(timeout as u32));
                let _ = (*thread).timer.start();
            }

            arch::irq_restore(level);
            sched::reschedule();

            if !self.parent.is_alive() {
                return Err(KernelError::Deleted);
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

    /// Non-blocking send.
    pub unsafe fn send(&self, buffer: &[u8]) -> KernelResult {
        self.send_wait(buffer, 0)
    }

    /// Non-blocking urgent send: the message is inserted at the FIFO head
    /// and will be received before everything already queued.
    pub unsafe fn urgent(&self, buffer: &[u8]) -> KernelResult {
        if !self.parent.is_alive() {
            return Err(KernelError::Deleted);
        }
        if buffer.is_empty() || buffer.len() > *self.msg_size.get() {
            return Err(KernelError::Invalid);
        }

        let level = arch::irq_save();
        if (*self.free.get()).is_null() {
            arch::irq_restore(level);
            return Err(KernelError::Error);
        }
        let node = *self.free.get();
        *self.free.get() = (*node).next;
        arch::irq_restore(level);

        ptr::copy_nonoverlapping(buffer.as_ptr(), payload(node), buffer.len());

        let level = arch::irq_save();
        (*node).next = *self.head.get();
        *self.head.get() = node;
        if (*self.tail.get()).is_null() {
            *self.tail.get() = node;
        }
        *self.index.get() += 1;

        let waiter = if self.parent.has_waiters() {
            ipc::resume_first(self.parent.wait_list())
        } else {
            ptr::null_mut()
        };
        arch::irq_restore(level);

        if !waiter.is_null() {
            sched::reschedule();
        }
        Ok(())
    }

    /// Receive the oldest message into `buffer`, blocking while the queue
    /// is empty.
    ///
    /// Copies at most `buffer.len()` bytes (a shorter buffer truncates)
    /// and returns the number copied. The freed slot wakes one blocked
    /// sender.
    ///
    /// # Safety
    /// Blocking (non-zero timeout) requires thread context.
    pub unsafe fn recv(&self, buffer: &mut [u8], timeout: i32) -> KernelResult<usize> {
        if !self.parent.is_alive() {
            return Err(KernelError::Deleted);
        }
        if buffer.is_empty() {
            return Err(KernelError::Invalid);
        }

        let mut timeout = timeout;

        loop {
            let level = arch::irq_save();

            if !self.parent.is_alive() {
                arch::irq_restore(level);
                return Err(KernelError::Deleted);
            }

            if !(*self.head.get()).is_null() && *self.index.get() > 0 {
                // Pop the FIFO head; copy with interrupts on.
                let node = *self.head.get();
                *self.head.get() = (*node).next;
                if *self.tail.get() == node {
                    *self.tail.get() = ptr::null_mut();
                }
                *self.index.get() -= 1;
                arch::irq_restore(level);

                let copy_len = buffer.len().min(*self.msg_size.get());
                ptr::copy_nonoverlapping(payload(node), buffer.as_mut_ptr(), copy_len);

                let level = arch::irq_save();
                (*node).next = *self.free.get();
                *self.free.get() = node;

                let waiter = if !(*self.sender_wait_list.get()).is_empty() {
                    ipc::resume_first(self.sender_wait_list.get())
                } else {
                    ptr::null_mut()
                };
                arch::irq_restore(level);

                if !waiter.is_null() {
                    sched::reschedule();
                }
                return Ok(copy_len);
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

            let start_tick = timer::tick_get();
            if timeout > 0 {
                let _ = (*thread).timer.ctrl(TimerCtrl::SetDuration(timeout as u32));
                let _ = (*thread).timer.start();
            }

            arch::irq_restore(level);
            sched::reschedule();

            if !self.parent.is_alive() {
                return Err(KernelError::Deleted);
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

    /// Delete the queue: resume every blocked receiver and sender (each
    /// observes `Deleted`) and invalidate the object.
    pub unsafe fn delete(&self) -> KernelResult {
        let mut had_waiters = false;

        if self.parent.has_waiters() {
            ipc::resume_all(self.parent.wait_list());
            had_waiters = true;
        }
        if !(*self.sender_wait_list.get()).is_empty() {
            ipc::resume_all(self.sender_wait_list.get());
            had_waiters = true;
        }

        let level = arch::irq_save();
        *self.head.get() = ptr::null_mut();
        *self.tail.get() = ptr::null_mut();
        *self.free.get() = ptr::null_mut();
        *self.pool.get() = ptr::null_mut();
        *self.msg_size.get() = 0;
        *self.max_msgs.get() = 0;
        *self.index.get() = 0;
        self.parent.set_dead();
        arch::irq_restore(level);

        if had_waiters {
            sched::reschedule();
        }
        Ok(())
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload bytes of a slot, immediately after its header.
#[inline]
unsafe fn payload(node: *mut MsgNode) -> *mut u8 {
    (node as *mut u8).add(core::mem::size_of::<MsgNode>())
}
