//! Kestrel RTOS kernel
//!
//! A preemptive, priority-based real-time kernel for small 32-bit
//! microcontrollers. The kernel multiplexes a single CPU among a fixed set
//! of cooperating threads and is built from these subsystems:
//!
//! - **sched** - Ready-queue scheduler: 32 priority levels, O(1) selection
//!   via a ready bitmap, FIFO round-robin with time slicing
//! - **thread** - Thread lifecycle: init/startup/sleep/suspend/exit/restart,
//!   deferred reclamation of terminated threads
//! - **timer** - Software timers: one ordered deadline list, tick-wrap-safe
//!   comparisons, callbacks fired outside the critical section
//! - **semaphore / mutex / msgqueue** - IPC primitives with timeout-aware
//!   blocking; the mutex is recursive and performs priority inheritance
//! - **arch** - Architecture port: stack framing, PendSV context switch,
//!   interrupt masking (Cortex-M3/M4), plus a hosted port for unit tests
//! - **console** - Single-character output hook, `kprint!` macros and a
//!   `log` backend
//!
//! All control blocks and stacks are supplied by the caller; the kernel
//! never allocates. A periodic tick interrupt must call
//! [`timer::tick_increase`].
//!
//! # Bring-up
//!
//! ```ignore
//! console::set_output(uart_putc);
//! init::kernel_init().unwrap();
//! unsafe {
//!     T1.init(worker, T1_STACK.as_mut_ptr(), T1_STACK.len(), 10, 10).unwrap();
//!     T1.startup().unwrap();
//!     sched::start();
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::new_without_default)]

pub mod arch;
pub mod config;
pub mod console;
pub mod error;
pub mod idle;
pub mod init;
pub mod list;
pub mod sched;
pub mod thread;
pub mod timer;

#[cfg(any(feature = "semaphore", feature = "mutex", feature = "msgqueue"))]
pub mod ipc;

#[cfg(feature = "semaphore")]
pub mod semaphore;

#[cfg(feature = "mutex")]
pub mod mutex;

#[cfg(feature = "msgqueue")]
pub mod msgqueue;

// Re-export the key types
pub use error::{KernelError, KernelResult};
pub use list::ListEntry;
pub use thread::{Thread, ThreadCtrl, ThreadState};
pub use timer::{Timer, TimerCtrl};

pub use config::{TIMEOUT_FOREVER, TIMEOUT_NONE};

#[cfg(any(feature = "semaphore", feature = "mutex", feature = "msgqueue"))]
pub use ipc::IpcFlag;

#[cfg(feature = "semaphore")]
pub use semaphore::Semaphore;

#[cfg(feature = "mutex")]
pub use mutex::Mutex;

#[cfg(feature = "msgqueue")]
pub use msgqueue::{msgq_pool_size, MessageQueue};

pub use init::kernel_init;

#[cfg(test)]
pub(crate) mod test_util;
