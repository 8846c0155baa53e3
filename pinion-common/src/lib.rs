//! # pinion-common
//!
//! Shared foundation types for the Pinion driver stack.
//!
//! This crate defines the vocabulary the other crates speak:
//! - [`PhysAddr`](addr::PhysAddr) / [`VirtAddr`](addr::VirtAddr) /
//!   [`BusAddr`](addr::BusAddr): typed addresses for the three address
//!   spaces a DMA-capable driver has to keep apart
//! - [`page`](addr::page): 4 KiB page constants and alignment helpers
//! - [`Duration`](time::Duration) / [`MonotonicClock`](time::MonotonicClock):
//!   wall-clock timeouts decoupled from CPU-frequency-dependent spin counts
//!
//! # no_std
//!
//! This crate is `#![no_std]` and has zero dependencies, making it suitable
//! as a foundation crate that all other Pinion crates can depend on.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;
pub mod time;

// Re-export commonly used types
pub use addr::{BusAddr, PhysAddr, VirtAddr};
pub use time::{Duration, MonotonicClock, TickClock};
