//! # pinion-virtio
//!
//! Virtio-mmio transport, split virtqueues and the block device client
//! built on them.
//!
//! The layering mirrors the protocol:
//!
//! - [`mmio`]: the register window, both legacy (version 1) and modern
//!   (version 2) layouts
//! - [`virtqueue`]: the split-ring engine (descriptor free list,
//!   available-ring publish, used-ring harvest)
//! - [`device`]: the lifecycle state machine tying the two together,
//!   from probe and feature negotiation through `DRIVER_OK`
//! - [`blk`]: a synchronous block device driver as the canonical client
//!
//! The device is the other concurrent actor here: it consumes the
//! available ring and produces the used ring at its own pace. Each ring
//! has exactly one writer and one reader, which is what lets the whole
//! stack run lock-free with two memory barriers per request.
//!
//! Ring and scratch memory comes from a [`pinion_dma::DmaAllocator`];
//! waits are bounded by a [`pinion_common::MonotonicClock`]. Both are
//! bound once at probe time.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod blk;
pub mod device;
pub mod error;
pub mod mmio;
pub mod virtqueue;

pub use blk::{BlkConfig, VirtioBlk, SECTOR_SIZE};
pub use device::{VirtioDevice, DEFAULT_QUEUE_SIZE, MAX_QUEUES};
pub use error::VirtioError;
pub use mmio::{DeviceType, MmioVersion, VirtioMmio};
pub use virtqueue::{Buffer, QueueLayout, Virtqueue};
