//! Split Virtqueue
//!
//! The descriptor-table / available-ring / used-ring structure shared
//! between driver and device. One `Virtqueue` owns one physically
//! contiguous DMA allocation holding all three sections and hands
//! descriptor chains to the device through it.
//!
//! # Design
//!
//! Free descriptors form a singly-linked list threaded through the `next`
//! fields of the descriptor table, initially the identity permutation
//! (0 -> 1 -> ... -> n-1). Chain publication reuses those links: a chain of
//! `k` buffers occupies `k` consecutive free-list entries, with the `NEXT`
//! flag marking every element but the last. Harvesting a completion splices
//! the whole chain back onto the front of the free list in O(chain length).
//!
//! The driver side is strictly single-producer: `add_buf` and `pop_used`
//! take `&mut self`. The device side is asynchronous, so every field the
//! device reads or writes is accessed volatile, with a write barrier
//! before publishing `avail.idx` and a read barrier after observing
//! `used.idx` (pairing with the device's own barriers).

use core::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile};

use pinion_common::addr::page;
use pinion_common::BusAddr;
use pinion_dma::{DmaBuffer, DmaDirection};
use pinion_mmio::barrier;

use crate::error::VirtioError;

/// Descriptor flags
pub mod desc_flags {
    /// Buffer continues in the descriptor named by `next`
    pub const NEXT: u16 = 1;
    /// Buffer is device-write-only (driver-read-only when clear)
    pub const WRITE: u16 = 2;
    /// Buffer contains a table of indirect descriptors (not negotiated
    /// by this driver)
    pub const INDIRECT: u16 = 4;
}

/// Virtqueue descriptor (16 bytes, device-readable)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtqDesc {
    /// Buffer bus address
    pub addr: u64,
    /// Buffer length in bytes
    pub len: u32,
    /// Descriptor flags (`desc_flags`)
    pub flags: u16,
    /// Index of the next descriptor when `NEXT` is set; otherwise this
    /// retains the free-list successor and the device ignores it
    pub next: u16,
}

/// Available ring header; `ring[queue_size]` and a 16-bit event index
/// follow it in memory.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtqAvail {
    pub flags: u16,
    pub idx: u16,
}

/// One used-ring entry written by the device.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtqUsedElem {
    /// Head descriptor index of the completed chain
    pub id: u32,
    /// Bytes the device wrote into the chain
    pub len: u32,
}

/// Used ring header; `ring[queue_size]` of [`VirtqUsedElem`] and a 16-bit
/// event index follow it in memory.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtqUsed {
    pub flags: u16,
    pub idx: u16,
}

/// One buffer of a request chain, as handed to [`Virtqueue::add_buf`].
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    /// Device-visible address of the buffer
    pub addr: BusAddr,
    /// Buffer length in bytes
    pub len: u32,
    /// Who writes the buffer: the driver (`ToDevice`) or the device
    /// (`FromDevice`)
    pub direction: DmaDirection,
}

impl Buffer {
    /// A buffer the device reads from.
    pub const fn to_device(addr: BusAddr, len: u32) -> Self {
        Self {
            addr,
            len,
            direction: DmaDirection::ToDevice,
        }
    }

    /// A buffer the device writes into.
    pub const fn from_device(addr: BusAddr, len: u32) -> Self {
        Self {
            addr,
            len,
            direction: DmaDirection::FromDevice,
        }
    }
}

/// Byte layout of one virtqueue's ring memory.
///
/// All three sections live in a single contiguous allocation: descriptor
/// table at offset 0, available ring directly after it, used ring on the
/// next page boundary. The same layout is used on both transport
/// versions; it satisfies the legacy transport's page-granular contract
/// and the modern transport takes the section addresses verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    /// Offset of the available ring
    pub avail_offset: usize,
    /// Offset of the used ring
    pub used_offset: usize,
    /// Total allocation size, whole pages
    pub total_size: usize,
}

impl QueueLayout {
    /// Compute the layout for a queue of `queue_size` descriptors.
    pub const fn for_size(queue_size: u16) -> Self {
        let n = queue_size as usize;
        let desc_size = 16 * n;
        let avail_size = 6 + 2 * n;
        let used_offset = page::align_up_4k(desc_size + avail_size);
        let used_size = 6 + 8 * n;
        Self {
            avail_offset: desc_size,
            used_offset,
            total_size: page::align_up_4k(used_offset + used_size),
        }
    }
}

/// Driver-side state of one split virtqueue.
pub struct Virtqueue {
    /// Ring memory; owned by the queue for its whole lifetime because the
    /// device holds the bus address of this allocation
    memory: DmaBuffer,
    queue_size: u16,
    desc: *mut VirtqDesc,
    avail: *mut VirtqAvail,
    used: *mut VirtqUsed,
    /// Head of the descriptor free list
    free_head: u16,
    /// Descriptors currently on the free list
    num_free: u16,
    /// Shadow of `avail.idx`; only the driver writes that field
    avail_idx: u16,
    /// Next used-ring entry to harvest
    last_used_idx: u16,
}

// SAFETY: the raw pointers all target the owned `memory` allocation, and
// both mutating entry points take `&mut self`, so moving the queue to
// another thread hands over exclusive access.
unsafe impl Send for Virtqueue {}

impl Virtqueue {
    /// Build a virtqueue over zeroed ring memory.
    ///
    /// `memory` must come from a [`pinion_dma::DmaAllocator`] (which
    /// guarantees zeroed, physically contiguous, page-aligned frames) and
    /// be at least [`QueueLayout::total_size`] for `queue_size`. The queue
    /// keeps the buffer; callers that tear the device down are
    /// responsible for returning it to the allocator afterwards.
    pub fn new(memory: DmaBuffer, queue_size: u16) -> Result<Self, VirtioError> {
        if queue_size == 0 || !queue_size.is_power_of_two() {
            return Err(VirtioError::InvalidArgument {
                reason: "queue size must be a nonzero power of two",
            });
        }
        if !memory.bus_addr().is_page_aligned() {
            return Err(VirtioError::InvalidArgument {
                reason: "queue memory must be page-aligned",
            });
        }
        let layout = QueueLayout::for_size(queue_size);
        if memory.len() < layout.total_size {
            return Err(VirtioError::InvalidArgument {
                reason: "queue memory smaller than ring layout",
            });
        }

        let base = memory.virt();
        let vq = Self {
            memory,
            queue_size,
            desc: base.as_mut_ptr::<VirtqDesc>(),
            avail: base.offset(layout.avail_offset as u64).as_mut_ptr(),
            used: base.offset(layout.used_offset as u64).as_mut_ptr(),
            free_head: 0,
            num_free: queue_size,
            avail_idx: 0,
            last_used_idx: 0,
        };

        // Thread the free list through the zeroed descriptor table as the
        // identity permutation. The last descriptor's next stays 0 and is
        // never followed while the free count is honoured.
        for i in 0..queue_size - 1 {
            // SAFETY: i < queue_size and the allocation covers the table.
            unsafe {
                write_volatile(addr_of_mut!((*vq.desc_ptr(i)).next), i + 1);
            }
        }

        Ok(vq)
    }

    /// Number of descriptors in this queue.
    pub fn size(&self) -> u16 {
        self.queue_size
    }

    /// Descriptors currently available for new chains.
    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    /// Bus address of the descriptor table.
    pub fn desc_addr(&self) -> BusAddr {
        self.memory.bus_addr()
    }

    /// Bus address of the available ring.
    pub fn avail_addr(&self) -> BusAddr {
        let layout = QueueLayout::for_size(self.queue_size);
        self.memory.bus_addr().offset(layout.avail_offset as u64)
    }

    /// Bus address of the used ring.
    pub fn used_addr(&self) -> BusAddr {
        let layout = QueueLayout::for_size(self.queue_size);
        self.memory.bus_addr().offset(layout.used_offset as u64)
    }

    /// Publish one descriptor chain to the device.
    ///
    /// Writes one descriptor per buffer, links them via `NEXT`, puts the
    /// head index on the available ring and advances `avail.idx`. Returns
    /// the head index, which the device echoes back on completion.
    ///
    /// On `QueueFull` the queue is left exactly as it was; the caller may
    /// retry after harvesting completions. The caller still has to notify
    /// the device, so several chains can be published per notification.
    pub fn add_buf(&mut self, bufs: &[Buffer]) -> Result<u16, VirtioError> {
        if bufs.is_empty() {
            return Err(VirtioError::InvalidArgument {
                reason: "empty descriptor chain",
            });
        }
        if bufs.len() > self.num_free as usize {
            return Err(VirtioError::QueueFull {
                needed: u16::try_from(bufs.len()).unwrap_or(u16::MAX),
                free: self.num_free,
            });
        }

        let head = self.free_head;
        let mut idx = head;
        for (i, buf) in bufs.iter().enumerate() {
            let p = self.desc_ptr(idx);
            // SAFETY: idx walks the free list, which only holds in-range
            // indices while `num_free` is honoured.
            let free_next = unsafe { read_volatile(addr_of!((*p).next)) };

            let last = i + 1 == bufs.len();
            let mut flags = if last { 0 } else { desc_flags::NEXT };
            if matches!(buf.direction, DmaDirection::FromDevice) {
                flags |= desc_flags::WRITE;
            }

            // SAFETY: as above; the free-list successor doubles as the
            // chain link, so `next` is written back unchanged.
            unsafe {
                write_volatile(
                    p,
                    VirtqDesc {
                        addr: buf.addr.as_u64(),
                        len: buf.len,
                        flags,
                        next: free_next,
                    },
                );
            }
            idx = free_next;
        }

        self.free_head = idx;
        self.num_free -= bufs.len() as u16;

        let slot = self.avail_idx % self.queue_size;
        // SAFETY: slot < queue_size, within the available ring.
        unsafe {
            write_volatile(self.avail_slot_ptr(slot), head);
        }

        // The device must not observe the new avail.idx before the
        // descriptors and the ring entry are in memory.
        barrier::write_barrier();
        self.avail_idx = self.avail_idx.wrapping_add(1);
        // SAFETY: avail points at the available ring header.
        unsafe {
            write_volatile(addr_of_mut!((*self.avail).idx), self.avail_idx);
        }

        Ok(head)
    }

    /// Whether the device has published completions not yet harvested.
    pub fn has_used(&self) -> bool {
        // SAFETY: used points at the used ring header.
        let used_idx = unsafe { read_volatile(addr_of!((*self.used).idx)) };
        used_idx != self.last_used_idx
    }

    /// Harvest one completion from the used ring.
    ///
    /// Returns the chain head and the byte count the device reported, and
    /// splices the whole chain back onto the free list. Returns `None`
    /// when nothing is pending, without touching any queue state.
    pub fn pop_used(&mut self) -> Option<(u16, u32)> {
        // SAFETY: used points at the used ring header.
        let used_idx = unsafe { read_volatile(addr_of!((*self.used).idx)) };
        if used_idx == self.last_used_idx {
            return None;
        }

        // Pairs with the device's publication barrier: the index read
        // above must not be reordered past the ring entry read below.
        barrier::read_barrier();

        let slot = self.last_used_idx % self.queue_size;
        // SAFETY: slot < queue_size, within the used ring.
        let elem = unsafe { read_volatile(self.used_elem_ptr(slot)) };
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        if elem.id >= u32::from(self.queue_size) {
            log::error!(
                "virtqueue: device completed out-of-range descriptor {} (queue size {})",
                elem.id,
                self.queue_size
            );
            return None;
        }

        let head = elem.id as u16;
        self.recycle_chain(head);
        Some((head, elem.len))
    }

    /// Splice the chain starting at `head` back onto the free list.
    fn recycle_chain(&mut self, head: u16) {
        let mut tail = head;
        let mut count = 1u16;
        loop {
            // SAFETY: tail is validated below before each advance.
            let d = unsafe { read_volatile(self.desc_ptr(tail)) };
            if d.flags & desc_flags::NEXT == 0 {
                break;
            }
            if d.next >= self.queue_size || count >= self.queue_size {
                log::error!("virtqueue: corrupt descriptor chain at {}", tail);
                break;
            }
            tail = d.next;
            count += 1;
        }

        // SAFETY: tail < queue_size.
        unsafe {
            write_volatile(addr_of_mut!((*self.desc_ptr(tail)).next), self.free_head);
        }
        self.free_head = head;
        self.num_free += count;
    }

    fn desc_ptr(&self, index: u16) -> *mut VirtqDesc {
        debug_assert!(index < self.queue_size);
        // SAFETY: index < queue_size keeps this within the table.
        unsafe { self.desc.add(index as usize) }
    }

    fn avail_slot_ptr(&self, slot: u16) -> *mut u16 {
        debug_assert!(slot < self.queue_size);
        // SAFETY: the ring of `queue_size` u16 entries starts directly
        // after the 4-byte header.
        unsafe { (self.avail.add(1) as *mut u16).add(slot as usize) }
    }

    fn used_elem_ptr(&self, slot: u16) -> *mut VirtqUsedElem {
        debug_assert!(slot < self.queue_size);
        // SAFETY: the ring of `queue_size` elements starts directly after
        // the 4-byte header.
        unsafe { (self.used.add(1) as *mut VirtqUsedElem).add(slot as usize) }
    }
}

impl core::fmt::Debug for Virtqueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Virtqueue")
            .field("size", &self.queue_size)
            .field("num_free", &self.num_free)
            .field("avail_idx", &self.avail_idx)
            .field("last_used_idx", &self.last_used_idx)
            .finish()
    }
}
