//! Memory Barrier Helpers
//!
//! Ordering primitives for driver/device shared memory. A virtqueue-style
//! protocol has two hand-off points that program order alone does not cover:
//! ring contents must be visible before the index that publishes them, and
//! an observed index advance must precede reading the entries it covers.
//!
//! # ARM64 Memory Model
//!
//! ARM64 is weakly ordered. The barriers here map to:
//! - `write_barrier()`: Release semantics (stores before this complete first)
//! - `read_barrier()`: Acquire semantics (loads after this observe prior writes)
//! - `dmb_sy()`: full data memory barrier across normal and device memory,
//!   used before a doorbell/notify MMIO write
//!
//! # Usage Patterns
//!
//! ## Producer ring (driver writes, device reads)
//!
//! ```ignore
//! ring[idx % size] = head;
//! write_barrier();        // entry visible before the index moves
//! publish_index(idx + 1);
//! ```
//!
//! ## Consumer ring (device writes, driver reads)
//!
//! ```ignore
//! if device_index != last_seen {
//!     read_barrier();     // index advance observed before entry contents
//!     let entry = ring[last_seen % size];
//! }
//! ```

use core::sync::atomic::{Ordering, fence};

/// Read barrier (acquire semantics).
///
/// Ensures all loads before this barrier complete before any loads after.
/// Use after observing a device-advanced index, before reading the ring
/// entries it publishes.
#[inline]
pub fn read_barrier() {
    fence(Ordering::Acquire);
}

/// Write barrier (release semantics).
///
/// Ensures all stores before this barrier complete before any stores after.
/// Use between filling a ring entry and publishing the index that makes it
/// visible to the device.
#[inline]
pub fn write_barrier() {
    fence(Ordering::Release);
}

/// Full memory barrier.
///
/// Ensures all memory operations before this barrier complete before any
/// operations after, loads and stores both.
#[inline]
pub fn full_barrier() {
    fence(Ordering::SeqCst);
}

/// Data Memory Barrier (DMB SY).
///
/// Orders all prior memory accesses, normal and device memory alike, before
/// all subsequent ones. Needed before a notify-register write so the device
/// observes the ring update no later than the doorbell.
#[cfg(target_arch = "aarch64")]
#[inline]
pub fn dmb_sy() {
    // SAFETY: DMB is always safe to execute
    unsafe {
        core::arch::asm!("dmb sy", options(nostack, preserves_flags));
    }
}

/// Data Memory Barrier (portable stand-in).
///
/// On targets without the ARM64 instruction a sequentially-consistent fence
/// gives the same ordering guarantee for testing purposes.
#[cfg(not(target_arch = "aarch64"))]
#[inline]
pub fn dmb_sy() {
    fence(Ordering::SeqCst);
}
