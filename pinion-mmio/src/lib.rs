//! MMIO Abstraction Layer for Pinion Device Drivers
//!
//! This crate provides the register-access and memory-ordering building
//! blocks the Pinion driver stack is written against.
//!
//! # Modules
//!
//! - [`region`]: Type-safe MMIO region access with offset-based reads/writes
//! - [`barrier`]: Memory barrier helpers for device memory ordering
//!
//! # Example
//!
//! ```ignore
//! use pinion_mmio::{MmioRegion, barrier};
//!
//! // Create MMIO region for a virtio window at 0x0a00_0000
//! let mmio = unsafe { MmioRegion::new(0x0a00_0000, 0x200) };
//!
//! let magic = mmio.read32(0x00);
//!
//! // Write with barrier
//! barrier::dmb_sy();
//! mmio.write32(0x50, 0);
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod barrier;
pub mod region;

// Re-exports for convenience
pub use barrier::{dmb_sy, full_barrier, read_barrier, write_barrier};
pub use region::MmioRegion;
