//! MMIO Region Abstraction
//!
//! Offset-based access to memory-mapped device registers. All accesses are
//! volatile so the compiler neither elides nor reorders them; width and
//! alignment are checked in debug builds.
//!
//! Virtio-mmio and PL011 registers are at most 32 bits wide, so this module
//! provides 8/16/32-bit accessors only.
//!
//! # Safety
//!
//! The caller is responsible for ensuring the base address points to a valid,
//! mapped MMIO region with device memory attributes.

use core::ptr::{read_volatile, write_volatile};

/// A memory-mapped I/O region.
///
/// Provides offset-based access to device registers with volatile semantics.
///
/// # Example
///
/// ```ignore
/// let mmio = unsafe { MmioRegion::new(0x0a00_0000, 0x200) };
///
/// let magic = mmio.read32(0x00);
/// mmio.write32(0x50, 0);
/// ```
#[derive(Clone, Copy)]
pub struct MmioRegion {
    base: usize,
    size: usize,
}

impl MmioRegion {
    /// Create a new MMIO region.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `base` points to a valid, mapped MMIO region
    /// - The region has device memory attributes (non-cacheable)
    /// - The region is at least `size` bytes
    /// - No other code accesses this region concurrently without synchronisation
    #[inline]
    #[must_use]
    pub const unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Get the base address of this region.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Get the size of this region.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Create a subregion starting at the given offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset + size` would exceed the parent region's bounds.
    #[inline]
    #[must_use]
    pub const fn subregion(&self, offset: usize, size: usize) -> Self {
        assert!(
            offset + size <= self.size,
            "Subregion exceeds parent bounds"
        );
        Self {
            base: self.base + offset,
            size,
        }
    }

    /// Read an 8-bit value from the given offset.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if offset is out of bounds.
    #[inline]
    #[must_use]
    pub fn read8(&self, offset: usize) -> u8 {
        debug_assert!(offset < self.size, "MMIO read8 offset out of bounds");
        // SAFETY: Caller ensured base is valid MMIO, offset is within bounds
        unsafe { read_volatile((self.base + offset) as *const u8) }
    }

    /// Read a 16-bit value from the given offset.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if offset is out of bounds or misaligned.
    #[inline]
    #[must_use]
    pub fn read16(&self, offset: usize) -> u16 {
        debug_assert!(offset + 2 <= self.size, "MMIO read16 offset out of bounds");
        debug_assert!(offset.is_multiple_of(2), "MMIO read16 offset not aligned");
        // SAFETY: Caller ensured base is valid MMIO, offset is within bounds
        unsafe { read_volatile((self.base + offset) as *const u16) }
    }

    /// Read a 32-bit value from the given offset.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if offset is out of bounds or misaligned.
    #[inline]
    #[must_use]
    pub fn read32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.size, "MMIO read32 offset out of bounds");
        debug_assert!(offset.is_multiple_of(4), "MMIO read32 offset not aligned");
        // SAFETY: Caller ensured base is valid MMIO, offset is within bounds
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    /// Write an 8-bit value to the given offset.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if offset is out of bounds.
    #[inline]
    pub fn write8(&self, offset: usize, value: u8) {
        debug_assert!(offset < self.size, "MMIO write8 offset out of bounds");
        // SAFETY: Caller ensured base is valid MMIO, offset is within bounds
        unsafe { write_volatile((self.base + offset) as *mut u8, value) }
    }

    /// Write a 16-bit value to the given offset.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if offset is out of bounds or misaligned.
    #[inline]
    pub fn write16(&self, offset: usize, value: u16) {
        debug_assert!(offset + 2 <= self.size, "MMIO write16 offset out of bounds");
        debug_assert!(offset.is_multiple_of(2), "MMIO write16 offset not aligned");
        // SAFETY: Caller ensured base is valid MMIO, offset is within bounds
        unsafe { write_volatile((self.base + offset) as *mut u16, value) }
    }

    /// Write a 32-bit value to the given offset.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if offset is out of bounds or misaligned.
    #[inline]
    pub fn write32(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.size, "MMIO write32 offset out of bounds");
        debug_assert!(offset.is_multiple_of(4), "MMIO write32 offset not aligned");
        // SAFETY: Caller ensured base is valid MMIO, offset is within bounds
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }

    /// Modify a 32-bit register: full read, merge, full write.
    ///
    /// Not atomic. The single-writer assumption of this driver stack is
    /// load-bearing here; concurrent writers to the same register need
    /// real synchronisation above this layer.
    #[inline]
    pub fn modify32<F>(&self, offset: usize, f: F)
    where
        F: FnOnce(u32) -> u32,
    {
        let value = self.read32(offset);
        self.write32(offset, f(value));
    }

    /// Set bits in a 32-bit register.
    #[inline]
    pub fn set_bits32(&self, offset: usize, bits: u32) {
        self.modify32(offset, |v| v | bits);
    }

    /// Clear bits in a 32-bit register.
    #[inline]
    pub fn clear_bits32(&self, offset: usize, bits: u32) {
        self.modify32(offset, |v| v & !bits);
    }
}

impl core::fmt::Debug for MmioRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmioRegion")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}
