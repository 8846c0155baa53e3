//! Time Units and Monotonic Clock Interface
//!
//! Polling drivers need to bound their waits. Counting loop iterations makes
//! the bound depend on CPU frequency, so waits are expressed here as real
//! time: a [`Duration`] value paired with a [`MonotonicClock`] that turns a
//! free-running hardware counter into nanoseconds. The concrete clock is
//! chosen once at driver construction; everything downstream only sees the
//! trait.
//!
//! [`TickClock`] is a manually advanced software counter for host tests and
//! platforms without an architectural timer.

use core::sync::atomic::{AtomicU64, Ordering};

/// Duration type for timeouts and delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration {
    /// Duration in nanoseconds
    nanos: u64,
}

impl Duration {
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self {
            nanos: micros * 1000,
        }
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis * 1_000_000,
        }
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self {
            nanos: secs * 1_000_000_000,
        }
    }

    pub const fn as_nanos(&self) -> u64 {
        self.nanos
    }

    pub const fn as_micros(&self) -> u64 {
        self.nanos / 1000
    }

    pub const fn as_millis(&self) -> u64 {
        self.nanos / 1_000_000
    }

    pub const fn as_secs(&self) -> u64 {
        self.nanos / 1_000_000_000
    }
}

/// A free-running, never-decreasing counter with a known frequency.
///
/// Implementations read a hardware counter (the ARM generic timer's virtual
/// count, for instance) or a software counter under test. Tick width and
/// frequency are implementation properties; callers work in nanoseconds via
/// the provided conversions.
pub trait MonotonicClock {
    /// Read the current counter value.
    fn now_ticks(&self) -> u64;

    /// Counter frequency in Hz. A frequency of 0 means the clock is not
    /// running; time-based waits fall back to a fixed spin.
    fn frequency_hz(&self) -> u64;

    /// Current time in nanoseconds since the counter started.
    fn now_ns(&self) -> u64 {
        let count = self.now_ticks();
        let freq = self.frequency_hz();
        if freq == 0 {
            return 0;
        }

        // Split the conversion to avoid overflowing the multiplication:
        // (count / freq) whole seconds plus the scaled remainder.
        let secs = count / freq;
        let frac = count % freq;
        secs * 1_000_000_000 + (frac * 1_000_000_000) / freq
    }

    /// Current time in microseconds since the counter started.
    fn now_us(&self) -> u64 {
        let count = self.now_ticks();
        let freq = self.frequency_hz();
        if freq == 0 {
            return 0;
        }

        let secs = count / freq;
        let frac = count % freq;
        secs * 1_000_000 + (frac * 1_000_000) / freq
    }
}

/// Spin until `duration` has elapsed on `clock`.
///
/// If the clock reports frequency 0 the wait degrades to a fixed iteration
/// spin so callers still make progress on hardware where the timer has not
/// been brought up.
pub fn spin_for(clock: &dyn MonotonicClock, duration: Duration) {
    if clock.frequency_hz() == 0 {
        for _ in 0..duration.as_micros() * 100 {
            core::hint::spin_loop();
        }
        return;
    }

    let start = clock.now_ns();
    while clock.now_ns().wrapping_sub(start) < duration.as_nanos() {
        core::hint::spin_loop();
    }
}

/// Software counter implementing [`MonotonicClock`].
///
/// The counter only moves when told to: either explicitly via
/// [`advance_ticks`](TickClock::advance_ticks), or by `step` ticks on every
/// read when constructed with [`with_step`](TickClock::with_step). The
/// stepping form lets deadline loops terminate deterministically in tests.
pub struct TickClock {
    ticks: AtomicU64,
    step: u64,
    freq_hz: u64,
}

impl TickClock {
    /// A stationary clock at `freq_hz`; advance it manually.
    #[must_use]
    pub const fn new(freq_hz: u64) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            step: 0,
            freq_hz,
        }
    }

    /// A clock that advances by `step` ticks on every read.
    #[must_use]
    pub const fn with_step(freq_hz: u64, step: u64) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            step,
            freq_hz,
        }
    }

    /// Advance the counter by `ticks`.
    pub fn advance_ticks(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::Relaxed);
    }
}

impl MonotonicClock for TickClock {
    fn now_ticks(&self) -> u64 {
        if self.step == 0 {
            self.ticks.load(Ordering::Relaxed)
        } else {
            self.ticks.fetch_add(self.step, Ordering::Relaxed) + self.step
        }
    }

    fn frequency_hz(&self) -> u64 {
        self.freq_hz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_conversions() {
        assert_eq!(Duration::from_secs(1).as_nanos(), 1_000_000_000);
        assert_eq!(Duration::from_millis(2).as_micros(), 2000);
        assert_eq!(Duration::from_micros(1).as_nanos(), 1000);
        assert_eq!(Duration::from_nanos(999).as_micros(), 0);
    }

    #[test]
    fn test_tick_clock_conversion() {
        // 62.5 MHz: one tick is exactly 16 ns.
        let clock = TickClock::new(62_500_000);
        assert_eq!(clock.now_ns(), 0);
        clock.advance_ticks(62_500_000);
        assert_eq!(clock.now_ns(), 1_000_000_000);
        clock.advance_ticks(1);
        assert_eq!(clock.now_ns(), 1_000_000_016);
        assert_eq!(clock.now_us(), 1_000_000);
    }

    #[test]
    fn test_large_counts_do_not_overflow() {
        // A counter value that would overflow a naive ticks * 1e9 product.
        let clock = TickClock::new(1_000_000_000);
        clock.advance_ticks(u64::MAX / 2);
        assert_eq!(clock.now_ns(), u64::MAX / 2);
    }

    #[test]
    fn test_stepping_clock_advances_on_read() {
        let clock = TickClock::with_step(1_000_000_000, 500);
        let a = clock.now_ticks();
        let b = clock.now_ticks();
        assert_eq!(b - a, 500);
    }

    #[test]
    fn test_spin_for_returns() {
        // 1 us per read; a 1 ms spin needs about a thousand reads.
        let clock = TickClock::with_step(1_000_000_000, 1000);
        spin_for(&clock, Duration::from_millis(1));
        assert!(clock.now_ns() >= 1_000_000);
    }

    #[test]
    fn test_spin_for_stopped_clock_terminates() {
        let clock = TickClock::new(0);
        spin_for(&clock, Duration::from_micros(10));
    }
}
