//! Address Types for the Three Address Spaces
//!
//! A DMA-capable driver juggles three distinct address spaces: virtual
//! addresses the CPU dereferences, physical addresses the MMU maps, and bus
//! addresses a device uses for DMA. On simple boards bus and physical
//! addresses coincide; on others they differ by a fixed offset or an IOMMU
//! translation. Mixing them up compiles fine and corrupts memory at runtime,
//! so each space gets its own newtype.
//!
//! # Design
//!
//! The types are intentionally simple `#[repr(transparent)]` wrappers around
//! `u64`: zero runtime overhead, safe to pass through `#[repr(C)]` structures
//! and device descriptors, trivially convertible where a raw value is needed.

use core::fmt;

/// Physical memory address, as seen by the MMU.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

/// Virtual memory address, as dereferenced by CPU instructions.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub u64);

/// Bus address, as used by a DMA-capable device to access memory.
///
/// This is the address family written into device-visible structures
/// (descriptor tables, ring buffers, request headers). It may equal the
/// physical address or differ by a platform-fixed offset.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct BusAddr(pub u64);

impl PhysAddr {
    /// Create a new physical address.
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this address is null (zero).
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check if this address is page-aligned (4 KiB).
    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & page::MASK_4K as u64 == 0
    }

    /// Add an offset to this address.
    #[inline]
    #[must_use]
    pub const fn offset(self, offset: u64) -> Self {
        Self(self.0.wrapping_add(offset))
    }
}

impl VirtAddr {
    /// Create a new virtual address.
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this address is null (zero).
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check if this address is page-aligned (4 KiB).
    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & page::MASK_4K as u64 == 0
    }

    /// Add an offset to this address.
    #[inline]
    #[must_use]
    pub const fn offset(self, offset: u64) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Convert to a raw pointer.
    ///
    /// # Safety
    ///
    /// The address must be valid and properly aligned for type `T`.
    #[inline]
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Convert to a mutable raw pointer.
    ///
    /// # Safety
    ///
    /// The address must be valid and properly aligned for type `T`.
    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl BusAddr {
    /// Create a new bus address.
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this address is null (zero).
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check if this address is page-aligned (4 KiB).
    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & page::MASK_4K as u64 == 0
    }

    /// Add an offset to this address.
    #[inline]
    #[must_use]
    pub const fn offset(self, offset: u64) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// The 4 KiB page frame number of this address.
    ///
    /// Legacy virtio transports program queue locations as a PFN rather
    /// than a byte address; the address must be page-aligned for the
    /// device to reconstruct it exactly.
    #[inline]
    #[must_use]
    pub const fn page_frame_number(self) -> u64 {
        self.0 >> page::SHIFT_4K
    }
}

// -- Formatting implementations

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#018x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA:{:#018x}", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#018x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA:{:#018x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::Debug for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusAddr({:#018x})", self.0)
    }
}

impl fmt::Display for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BA:{:#018x}", self.0)
    }
}

impl fmt::LowerHex for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

// -- Conversion implementations

impl From<u64> for PhysAddr {
    #[inline]
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<PhysAddr> for u64 {
    #[inline]
    fn from(addr: PhysAddr) -> Self {
        addr.0
    }
}

impl From<u64> for VirtAddr {
    #[inline]
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<VirtAddr> for u64 {
    #[inline]
    fn from(addr: VirtAddr) -> Self {
        addr.0
    }
}

impl From<u64> for BusAddr {
    #[inline]
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<BusAddr> for u64 {
    #[inline]
    fn from(addr: BusAddr) -> Self {
        addr.0
    }
}

/// Page size constants
pub mod page {
    /// 4KB page size
    pub const SIZE_4K: usize = 4096;

    /// 4KB page shift
    pub const SHIFT_4K: usize = 12;

    /// 4KB page mask
    pub const MASK_4K: usize = SIZE_4K - 1;

    // Compile-time verification of page constants
    const _: () = assert!(SIZE_4K.is_power_of_two(), "SIZE_4K must be a power of two");
    const _: () = assert!(1 << SHIFT_4K == SIZE_4K, "SHIFT_4K must match SIZE_4K");
    const _: () = assert!(MASK_4K == SIZE_4K - 1, "MASK_4K must be SIZE_4K - 1");

    #[must_use]
    pub const fn align_down_4k(addr: usize) -> usize {
        addr & !MASK_4K
    }

    #[must_use]
    pub const fn align_up_4k(addr: usize) -> usize {
        (addr + MASK_4K) & !MASK_4K
    }

    #[must_use]
    pub const fn is_aligned_4k(addr: usize) -> bool {
        addr & MASK_4K == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_alignment_helpers() {
        assert_eq!(page::align_down_4k(0x1fff), 0x1000);
        assert_eq!(page::align_down_4k(0x2000), 0x2000);
        assert_eq!(page::align_up_4k(0x1001), 0x2000);
        assert_eq!(page::align_up_4k(0x2000), 0x2000);
        assert!(page::is_aligned_4k(0));
        assert!(page::is_aligned_4k(0x3000));
        assert!(!page::is_aligned_4k(0x3004));
    }

    #[test]
    fn test_address_alignment() {
        assert!(BusAddr::new(0x4000_0000).is_page_aligned());
        assert!(!BusAddr::new(0x4000_0010).is_page_aligned());
        assert!(PhysAddr::new(0).is_page_aligned());
        assert!(PhysAddr::new(0).is_null());
    }

    #[test]
    fn test_page_frame_number() {
        assert_eq!(BusAddr::new(0).page_frame_number(), 0);
        assert_eq!(BusAddr::new(0x1000).page_frame_number(), 1);
        assert_eq!(BusAddr::new(0x4000_2000).page_frame_number(), 0x4_0002);
    }

    #[test]
    fn test_offset_wraps() {
        let a = VirtAddr::new(u64::MAX);
        assert_eq!(a.offset(1).as_u64(), 0);
        let b = BusAddr::new(0x1000);
        assert_eq!(b.offset(0x234).as_u64(), 0x1234);
    }

    #[test]
    fn test_conversions() {
        let p: PhysAddr = 0xdead_b000u64.into();
        assert_eq!(u64::from(p), 0xdead_b000);
        assert_eq!(BusAddr::new(0x42).as_u64(), 0x42);
    }
}
