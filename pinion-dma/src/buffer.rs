//! DMA Buffer Handle and Transfer Direction

use core::ptr;

use pinion_common::{BusAddr, VirtAddr};

/// Direction of a DMA transfer, from the device's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DmaDirection {
    /// Driver fills the buffer, device reads it (e.g. a request header)
    ToDevice = 0,
    /// Device fills the buffer, driver reads it (e.g. completion data)
    FromDevice = 1,
}

/// A physically-contiguous, zero-initialised allocation from a DMA pool.
///
/// Carries both addresses the buffer is known by: the CPU-visible virtual
/// address for driver access and the bus address a device must be given.
/// The handle has no destructor; the owning pool reclaims the memory when
/// the buffer is passed back to `free`.
#[derive(Debug, Clone, Copy)]
pub struct DmaBuffer {
    virt: VirtAddr,
    bus: BusAddr,
    len: usize,
}

impl DmaBuffer {
    /// Construct a handle over an existing region. Only pools create these.
    #[inline]
    #[must_use]
    pub(crate) const fn new(virt: VirtAddr, bus: BusAddr, len: usize) -> Self {
        Self { virt, bus, len }
    }

    /// CPU-visible address of the buffer.
    #[inline]
    #[must_use]
    pub const fn virt(&self) -> VirtAddr {
        self.virt
    }

    /// Device-visible address of the buffer.
    #[inline]
    #[must_use]
    pub const fn bus_addr(&self) -> BusAddr {
        self.bus
    }

    /// Usable length in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `src` into the buffer starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset + src.len()` exceeds the buffer length.
    pub fn copy_from_slice(&self, offset: usize, src: &[u8]) {
        assert!(
            offset + src.len() <= self.len,
            "DMA buffer write out of bounds"
        );
        // SAFETY: the pool guarantees [virt, virt + len) is valid exclusive
        // memory for this handle, and the bounds were checked above.
        unsafe {
            ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.virt.as_mut_ptr::<u8>().add(offset),
                src.len(),
            );
        }
    }

    /// Copy from the buffer starting at `offset` into `dst`.
    ///
    /// # Panics
    ///
    /// Panics if `offset + dst.len()` exceeds the buffer length.
    pub fn copy_to_slice(&self, offset: usize, dst: &mut [u8]) {
        assert!(
            offset + dst.len() <= self.len,
            "DMA buffer read out of bounds"
        );
        // SAFETY: bounds checked above; see copy_from_slice.
        unsafe {
            ptr::copy_nonoverlapping(
                self.virt.as_ptr::<u8>().add(offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
    }

    /// Volatile single-byte read, for cells a device writes asynchronously
    /// (a virtio-blk status byte, for instance).
    ///
    /// # Panics
    ///
    /// Panics if `offset` is out of bounds.
    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        assert!(offset < self.len, "DMA buffer read out of bounds");
        // SAFETY: bounds checked above; volatile because the device may
        // have written the cell after the driver last looked.
        unsafe { ptr::read_volatile(self.virt.as_ptr::<u8>().add(offset)) }
    }
}
