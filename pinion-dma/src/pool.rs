//! Bitmap DMA Frame Pool
//!
//! Device drivers need physically-contiguous, zero-initialised memory the
//! device can address over the bus: virtqueue rings, request headers,
//! completion buffers. This module provides that as a bitmap allocator over
//! a caller-supplied region, at 4 KiB frame granularity.
//!
//! # Design
//!
//! One bit per frame (1 = allocated, 0 = free), first-fit search for
//! contiguous runs with a rotating hint, and a free-frame count maintained
//! as an invariant. Allocation rounds up to whole frames; every handed-out
//! frame is zeroed before the caller sees it. The pool translates between
//! CPU-visible and bus-visible addresses by the fixed offset between the
//! two base addresses given at construction.
//!
//! Consumers program against the [`DmaAllocator`] trait; the pool is the one
//! concrete implementation, bound at driver construction.

use pinion_common::addr::page;
use pinion_common::{BusAddr, VirtAddr};
use spin::mutex::SpinMutex;

use crate::buffer::DmaBuffer;
use crate::error::DmaError;

/// Allocation interface handed to drivers.
///
/// The contract: returned buffers are physically contiguous, page-aligned,
/// zero-initialised, and addressable by the device at
/// [`DmaBuffer::bus_addr`]. `free` returns a buffer obtained from the same
/// allocator; buffers have no destructor of their own.
pub trait DmaAllocator {
    /// Allocate at least `len` bytes (rounded up to whole frames).
    fn alloc_zeroed(&self, len: usize) -> Result<DmaBuffer, DmaError>;

    /// Return a buffer to the pool.
    fn free(&self, buf: &DmaBuffer) -> Result<(), DmaError>;
}

/// Bits per bitmap word
const BITS_PER_WORD: usize = 64;

/// Bitmap storage, fixed at 64 words = 4096 frames = 16 MiB of pool
const BITMAP_WORDS: usize = 64;

/// Largest pool this bitmap can manage, in frames
pub const MAX_FRAMES: usize = BITMAP_WORDS * BITS_PER_WORD;

/// Mutable allocator state, kept behind a lock so the pool can be shared
/// by plain reference between the transport and its device clients.
struct PoolInner {
    /// Bitmap of allocated frames (1 = allocated, 0 = free)
    bitmap: [u64; BITMAP_WORDS],
    /// Number of free frames (invariant: equals the zero bits in range)
    free_frames: usize,
    /// Next-allocation search hint
    search_hint: usize,
}

impl PoolInner {
    #[inline]
    fn bitmap_pos(frame: usize) -> (usize, usize) {
        (frame / BITS_PER_WORD, frame % BITS_PER_WORD)
    }

    #[inline]
    fn is_frame_free(&self, frame: usize) -> bool {
        let (word, bit) = Self::bitmap_pos(frame);
        (self.bitmap[word] >> bit) & 1 == 0
    }

    /// Find a contiguous run of `count` free frames in `[start, end)`.
    fn find_contiguous_run(&self, start: usize, end: usize, count: usize) -> Option<usize> {
        if start >= end || count == 0 {
            return None;
        }

        let mut run_start = start;
        let mut run_length = 0;
        let mut frame = start;

        while frame < end {
            let (word, _) = Self::bitmap_pos(frame);

            // Skip fully-allocated words in one step
            if self.bitmap[word] == !0 {
                frame = ((word + 1) * BITS_PER_WORD).min(end);
                run_length = 0;
                continue;
            }

            if self.is_frame_free(frame) {
                if run_length == 0 {
                    run_start = frame;
                }
                run_length += 1;

                if run_length >= count {
                    return Some(run_start);
                }
            } else {
                run_length = 0;
            }

            frame += 1;
        }

        None
    }

    /// Set the allocated bit on `count` frames from `start`.
    fn mark_allocated(&mut self, start: usize, count: usize) {
        for frame in start..start + count {
            let (word, bit) = Self::bitmap_pos(frame);
            debug_assert!(
                (self.bitmap[word] >> bit) & 1 == 0,
                "marking an already-allocated frame"
            );
            self.bitmap[word] |= 1 << bit;
        }
        assert!(
            self.free_frames >= count,
            "free_frames accounting error: tried to subtract {} from {}",
            count,
            self.free_frames
        );
        self.free_frames -= count;
    }

    /// Clear the allocated bit on `count` frames from `start`.
    ///
    /// Returns how many frames were actually allocated beforehand, so a
    /// double free is visible to the caller.
    fn mark_free(&mut self, start: usize, count: usize) -> usize {
        let mut freed = 0;
        for frame in start..start + count {
            let (word, bit) = Self::bitmap_pos(frame);
            if (self.bitmap[word] >> bit) & 1 == 1 {
                self.bitmap[word] &= !(1 << bit);
                freed += 1;
            }
        }
        self.free_frames += freed;
        if start < self.search_hint {
            self.search_hint = start;
        }
        freed
    }
}

/// DMA frame pool over one physically-contiguous region.
pub struct DmaPool {
    inner: SpinMutex<PoolInner>,
    /// CPU-visible base of the managed region (page-aligned)
    virt_base: u64,
    /// Device-visible base of the managed region (page-aligned)
    bus_base: u64,
    /// Frames managed
    total_frames: usize,
}

impl DmaPool {
    /// Create a pool over `[virt_base, virt_base + len)`, device-visible at
    /// `[bus_base, bus_base + len)`.
    ///
    /// # Errors
    ///
    /// `BadRegion` if either base is not page-aligned or the region is
    /// smaller than one frame; `TooLarge` if it exceeds [`MAX_FRAMES`].
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - the virtual range is mapped, writable, and unused by anything else
    ///   for the lifetime of the pool
    /// - the region is physically contiguous and reachable by the device at
    ///   the given bus base
    pub unsafe fn new(virt_base: VirtAddr, bus_base: BusAddr, len: usize) -> Result<Self, DmaError> {
        if !virt_base.is_page_aligned() || !bus_base.is_page_aligned() || len < page::SIZE_4K {
            return Err(DmaError::BadRegion);
        }

        let total_frames = len / page::SIZE_4K;
        if total_frames > MAX_FRAMES {
            return Err(DmaError::TooLarge {
                requested_frames: total_frames,
                total_frames: MAX_FRAMES,
            });
        }

        log::debug!(
            "dma: pool of {} frames at {} (bus {})",
            total_frames,
            virt_base,
            bus_base
        );

        // Frames beyond total_frames stay marked allocated so the search
        // never hands them out.
        let mut bitmap = [!0u64; BITMAP_WORDS];
        for frame in 0..total_frames {
            let (word, bit) = PoolInner::bitmap_pos(frame);
            bitmap[word] &= !(1 << bit);
        }

        Ok(Self {
            inner: SpinMutex::new(PoolInner {
                bitmap,
                free_frames: total_frames,
                search_hint: 0,
            }),
            virt_base: virt_base.as_u64(),
            bus_base: bus_base.as_u64(),
            total_frames,
        })
    }

    /// Number of currently free frames.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.inner.lock().free_frames
    }

    /// Number of frames managed by this pool.
    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.total_frames
    }
}

impl DmaAllocator for DmaPool {
    fn alloc_zeroed(&self, len: usize) -> Result<DmaBuffer, DmaError> {
        if len == 0 {
            return Err(DmaError::ZeroSize);
        }

        let frames = len.div_ceil(page::SIZE_4K);
        if frames > self.total_frames {
            return Err(DmaError::TooLarge {
                requested_frames: frames,
                total_frames: self.total_frames,
            });
        }

        let start = {
            let mut inner = self.inner.lock();
            if inner.free_frames < frames {
                return Err(DmaError::Exhausted {
                    requested_frames: frames,
                    free_frames: inner.free_frames,
                });
            }

            let hint = inner.search_hint;
            let found = inner
                .find_contiguous_run(hint, self.total_frames, frames)
                .or_else(|| inner.find_contiguous_run(0, hint, frames));

            let Some(start) = found else {
                let free_frames = inner.free_frames;
                log::warn!(
                    "dma: no contiguous run of {} frames ({} free but fragmented)",
                    frames,
                    free_frames
                );
                return Err(DmaError::Exhausted {
                    requested_frames: frames,
                    free_frames,
                });
            };

            inner.mark_allocated(start, frames);
            inner.search_hint = start + frames;
            if inner.search_hint >= self.total_frames {
                inner.search_hint = 0;
            }
            start
        };

        let virt = self.virt_base + (start * page::SIZE_4K) as u64;
        // SAFETY: the frames [start, start + frames) were just taken out of
        // the free set, so this range is exclusively ours; the region was
        // declared valid at pool construction.
        unsafe {
            core::ptr::write_bytes(virt as *mut u8, 0, frames * page::SIZE_4K);
        }

        Ok(DmaBuffer::new(
            VirtAddr::new(virt),
            BusAddr::new(self.bus_base + (start * page::SIZE_4K) as u64),
            len,
        ))
    }

    fn free(&self, buf: &DmaBuffer) -> Result<(), DmaError> {
        let virt = buf.virt().as_u64();
        let region_len = (self.total_frames * page::SIZE_4K) as u64;
        if virt < self.virt_base
            || virt >= self.virt_base + region_len
            || !buf.virt().is_page_aligned()
        {
            return Err(DmaError::ForeignBuffer);
        }

        let start = ((virt - self.virt_base) as usize) / page::SIZE_4K;
        let frames = buf.len().div_ceil(page::SIZE_4K);
        if start + frames > self.total_frames {
            return Err(DmaError::ForeignBuffer);
        }

        let freed = self.inner.lock().mark_free(start, frames);
        if freed != frames {
            log::warn!(
                "dma: freed {} of {} frames at {} (double free?)",
                freed,
                frames,
                buf.virt()
            );
        }
        Ok(())
    }
}
