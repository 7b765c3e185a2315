//! Architecture port layer.
//!
//! The portable kernel consumes a small, fixed contract from the port:
//!
//! - `stack_init` - build a synthetic first-run stack frame
//! - `first_switch` / `normal_switch` - the two context-switch entry points
//! - `irq_save` / `irq_restore` - nestable global interrupt masking
//! - `wait_for_interrupt` / `thread_exit_guard` - idle and exit hints
//!
//! Two ports are provided: `armv7m` for Cortex-M3/M4 targets (the context
//! switch is deferred to the PendSV exception at the lowest priority), and
//! `hosted` for everything else, used by the unit tests. The hosted port
//! performs no real context switch; its switch entry points update
//! bookkeeping and return to the caller, which lets tests drive blocking
//! kernel paths to their suspension point and observe the resulting state.

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod armv7m;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use armv7m::*;

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
mod hosted;
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use hosted::*;

/// Find-first-set: 1-based index of the least significant set bit, or 0 if
/// `value` is zero.
///
/// The scheduler uses this on the ready bitmap, where bit 0 is the highest
/// priority. Lowers to RBIT+CLZ on ARM.
#[inline]
pub fn ffs(value: u32) -> u32 {
    if value == 0 {
        0
    } else {
        value.trailing_zeros() + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffs_zero() {
        assert_eq!(ffs(0), 0);
    }

    #[test]
    fn test_ffs_single_bits() {
        for k in 0..32 {
            assert_eq!(ffs(1u32 << k), k + 1);
        }
    }

    #[test]
    fn test_ffs_lowest_of_many() {
        assert_eq!(ffs(0b1010_1000), 4);
        assert_eq!(ffs(u32::MAX), 1);
        assert_eq!(ffs(0x8000_0001), 1);
    }
}
