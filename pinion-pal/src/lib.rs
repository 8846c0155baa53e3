//! # pinion-pal
//!
//! Platform layer for the Pinion driver stack on QEMU-virt-style boards.
//!
//! - [`console`]: PL011 UART output behind a global lock, with
//!   `print!`/`println!` macros
//! - [`logger`]: backend for the `log` facade, writing timestamped,
//!   colourised lines to the console
//! - [`clock`]: the ARM generic timer as a monotonic clock (reports
//!   stopped off aarch64)
//! - [`discovery`]: devicetree scan producing the UART and virtio-mmio
//!   register windows the rest of the stack consumes
//!
//! A typical bring-up: [`discovery::scan`] the devicetree, point the
//! console at the UART window, install the logger, then walk the virtio
//! windows probing for devices.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod clock;
pub mod console;
pub mod discovery;
pub mod logger;

pub use clock::ArchClock;
pub use console::ConsoleWriter;
pub use discovery::{DeviceClass, DeviceMap, DeviceWindow, MAX_DEVICE_WINDOWS};
