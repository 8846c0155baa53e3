//! ARM Generic Timer Clock
//!
//! [`ArchClock`] exposes the generic timer's virtual counter (CNTVCT_EL0)
//! through the [`MonotonicClock`] trait, with the frequency read once from
//! CNTFRQ_EL0 and cached. Off aarch64 both reads report zero, which the
//! time layer treats as "clock not running"; host code wanting real time
//! should use `TickClock` instead.

use core::sync::atomic::{AtomicU64, Ordering};

use pinion_common::time::MonotonicClock;

#[cfg(target_arch = "aarch64")]
use aarch64_cpu::registers::{CNTFRQ_EL0, CNTVCT_EL0};
#[cfg(target_arch = "aarch64")]
use tock_registers::interfaces::Readable;

/// Monotonic clock backed by the ARM architectural timer.
pub struct ArchClock {
    /// Cached CNTFRQ_EL0; 0 until the first frequency read.
    /// Stored as atomic since it's written once and read on every timestamp.
    freq_hz: AtomicU64,
}

impl ArchClock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            freq_hz: AtomicU64::new(0),
        }
    }
}

impl Default for ArchClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "aarch64")]
impl MonotonicClock for ArchClock {
    fn now_ticks(&self) -> u64 {
        CNTVCT_EL0.get()
    }

    fn frequency_hz(&self) -> u64 {
        let cached = self.freq_hz.load(Ordering::Relaxed);
        if cached != 0 {
            return cached;
        }

        let freq = CNTFRQ_EL0.get();
        self.freq_hz.store(freq, Ordering::Relaxed);
        freq
    }
}

#[cfg(not(target_arch = "aarch64"))]
impl MonotonicClock for ArchClock {
    fn now_ticks(&self) -> u64 {
        0
    }

    fn frequency_hz(&self) -> u64 {
        // There is no counter to read, so the cache stays at 0.
        self.freq_hz.load(Ordering::Relaxed)
    }
}
