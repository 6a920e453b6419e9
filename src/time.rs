//! Monotonic time source.
//!
//! Deadlines inside the engine are absolute `u64` nanosecond readings of
//! `CLOCK_MONOTONIC`. This is the same clock io_uring uses for absolute
//! timeouts, so deadlines computed here stay coherent with kernel timers.

use std::mem;

/// Current `CLOCK_MONOTONIC` reading in nanoseconds.
///
/// The origin is unspecified; only differences between readings are
/// meaningful.
pub fn monotonic_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    // SAFETY: ts is valid writable storage for a timespec.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert!(rc == 0, "clock_gettime(CLOCK_MONOTONIC) cannot fail");
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_nonzero() {
        assert!(monotonic_ns() > 0);
    }

    #[test]
    fn test_monotonic_does_not_go_backwards() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_monotonic_advances_across_sleep() {
        let a = monotonic_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = monotonic_ns();
        assert!(b - a >= 1_000_000);
    }
}
