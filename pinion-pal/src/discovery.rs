//! Devicetree Device Discovery
//!
//! Walks a flattened devicetree and collects the MMIO register windows this
//! stack consumes: `virtio,mmio` transport windows for the probe loop and
//! the `arm,pl011` UART for the console. Window bases are kept exactly as
//! the tree reports them (virtio windows are 0x200 bytes and the transport
//! registers sit at the unaligned base); the page-aligned span for mapping
//! is available per window.

use core::fmt;

use fdt::Fdt;
use pinion_common::addr::page;

/// Window table capacity. QEMU's virt machine exposes 32 virtio transports;
/// this leaves room for those plus the UART.
pub const MAX_DEVICE_WINDOWS: usize = 40;

/// Device classes the scan recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// PL011 UART, console candidate
    Uart,
    /// Virtio MMIO transport window, probe candidate
    VirtioMmio,
}

/// One MMIO register window from the devicetree.
#[derive(Debug, Clone, Copy)]
pub struct DeviceWindow {
    /// Register window base, exactly as the devicetree reports it.
    pub base: usize,
    /// Window size in bytes.
    pub size: usize,
    /// What the compatible string said lives here.
    pub class: DeviceClass,
}

impl DeviceWindow {
    /// Page-aligned `(base, size)` span enclosing the window.
    ///
    /// This is what goes into the page tables; [`base`](Self::base) is what
    /// the driver talks to. Adjacent virtio windows commonly share a span.
    #[must_use]
    pub const fn page_span(&self) -> (usize, usize) {
        let start = page::align_down_4k(self.base);
        let end = page::align_up_4k(self.base + self.size);
        (start, end - start)
    }
}

/// Result of a devicetree scan: recognised windows in discovery order.
pub struct DeviceMap {
    windows: [Option<DeviceWindow>; MAX_DEVICE_WINDOWS],
    count: usize,
}

impl DeviceMap {
    const fn new() -> Self {
        Self {
            windows: [None; MAX_DEVICE_WINDOWS],
            count: 0,
        }
    }

    /// All collected windows.
    pub fn windows(&self) -> impl Iterator<Item = &DeviceWindow> + '_ {
        self.windows[..self.count].iter().flatten()
    }

    /// Windows of one class.
    pub fn of_class(&self, class: DeviceClass) -> impl Iterator<Item = &DeviceWindow> + '_ {
        self.windows().filter(move |w| w.class == class)
    }

    /// The first UART window, if the tree has one.
    #[must_use]
    pub fn uart(&self) -> Option<&DeviceWindow> {
        self.of_class(DeviceClass::Uart).next()
    }

    /// Number of collected windows.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Add a window, deduplicating by base address (first one wins).
    fn add(&mut self, window: DeviceWindow) {
        for existing in self.windows[..self.count].iter().flatten() {
            if existing.base == window.base {
                return;
            }
        }

        if self.count < MAX_DEVICE_WINDOWS {
            self.windows[self.count] = Some(window);
            self.count += 1;
        } else {
            log::warn!(
                "discovery: window table full, dropping {:#x}",
                window.base
            );
        }
    }
}

impl fmt::Debug for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.windows()).finish()
    }
}

/// Devicetree scan failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryError {
    /// The blob failed to parse (bad magic, truncated, bad offsets).
    InvalidDtb,
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDtb => write!(f, "Invalid devicetree blob"),
        }
    }
}

/// Scan a flattened devicetree for console and virtio windows.
///
/// Nodes without a recognised `compatible` string or without a `reg`
/// property are skipped; an empty table is a valid result.
pub fn scan(dtb: &[u8]) -> Result<DeviceMap, DiscoveryError> {
    let fdt = Fdt::new(dtb).map_err(|_| DiscoveryError::InvalidDtb)?;
    let mut map = DeviceMap::new();

    for node in fdt.all_nodes() {
        let Some(compatible) = node.compatible() else {
            continue;
        };
        let Some(class) = classify(compatible.all()) else {
            continue;
        };
        let Some(mut reg) = node.reg() else {
            continue;
        };
        let Some(entry) = reg.next() else {
            continue;
        };

        let base = entry.starting_address as usize;
        let size = entry.size.unwrap_or(page::SIZE_4K);
        if size == 0 || base.checked_add(size).is_none() {
            log::warn!(
                "discovery: skipping {} with bad window {:#x}+{:#x}",
                node.name,
                base,
                size
            );
            continue;
        }

        log::debug!(
            "discovery: {} at {:#x}, size {:#x} ({:?})",
            node.name,
            base,
            size,
            class
        );
        map.add(DeviceWindow { base, size, class });
    }

    log::info!("discovery: {} device windows", map.len());
    Ok(map)
}

/// Map a node's compatible list to a device class.
fn classify<'a>(compatibles: impl Iterator<Item = &'a str>) -> Option<DeviceClass> {
    for compat in compatibles {
        match compat {
            "arm,pl011" => return Some(DeviceClass::Uart),
            "virtio,mmio" => return Some(DeviceClass::VirtioMmio),
            _ => {}
        }
    }
    None
}
