//! # pinion-dma
//!
//! DMA-capable memory allocation for Pinion device drivers.
//!
//! Devices address memory over the bus, not through the CPU's page tables,
//! so driver-visible allocations must be physically contiguous, live at a
//! known bus address, and start out zeroed. This crate provides:
//!
//! - [`DmaAllocator`]: the small trait drivers allocate through
//! - [`DmaPool`]: the concrete bitmap frame pool implementing it
//! - [`DmaBuffer`]: a handle carrying the virtual and bus addresses of one
//!   allocation, with bounds-checked access helpers
//! - [`DmaDirection`]: who writes a buffer, driver or device

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod buffer;
pub mod error;
pub mod pool;

pub use buffer::{DmaBuffer, DmaDirection};
pub use error::DmaError;
pub use pool::{DmaAllocator, DmaPool, MAX_FRAMES};
