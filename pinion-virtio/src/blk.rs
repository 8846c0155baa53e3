//! Virtio Block Device Client
//!
//! The block protocol over one virtqueue: every request is a header
//! descriptor the device reads, an optional data descriptor in the
//! direction of the transfer, and a one-byte status descriptor the device
//! writes last.
//!
//! Completion is inherently asynchronous, but this client is synchronous
//! over it: submit, ring the doorbell, then poll the used ring under a
//! wall-clock deadline. On a timeout the descriptors and scratch buffers
//! of the request are deliberately not reclaimed, because the device may
//! still DMA into them at any point; the queue slot is lost for good.

use core::mem::size_of;

use pinion_common::time::spin_for;
use pinion_common::{Duration, MonotonicClock};
use pinion_dma::{DmaAllocator, DmaBuffer, DmaDirection};
use pinion_mmio::MmioRegion;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::device::VirtioDevice;
use crate::error::VirtioError;
use crate::mmio::{interrupt, DeviceType};
use crate::virtqueue::Buffer;

/// Sector size this driver assumes, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Block request types
pub mod req_type {
    /// Read sectors from the device
    pub const IN: u32 = 0;
    /// Write sectors to the device
    pub const OUT: u32 = 1;
    /// Flush the device write cache
    pub const FLUSH: u32 = 4;
}

/// Block request completion status
pub mod req_status {
    /// Success
    pub const OK: u8 = 0;
    /// I/O error
    pub const IOERR: u8 = 1;
    /// Request type not supported
    pub const UNSUPP: u8 = 2;
}

/// The block device serves requests on queue 0.
const REQUEST_QUEUE: u16 = 0;

/// Pause between used-ring polls.
const POLL_INTERVAL: Duration = Duration::from_micros(1);

/// Deadline for one request unless overridden.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

const REQ_HEADER_LEN: usize = 16;

/// Request header, exactly as the device reads it.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
struct ReqHeader {
    type_: u32,
    reserved: u32,
    sector: u64,
}

const _: () = assert!(size_of::<ReqHeader>() == REQ_HEADER_LEN);

/// Device configuration space, wire layout.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawBlkConfig {
    capacity: u64,
    size_max: u32,
    seg_max: u32,
    geometry: [u8; 4],
    blk_size: u32,
}

/// Disk-style geometry from config space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

/// Parsed block device configuration.
#[derive(Debug, Clone, Copy)]
pub struct BlkConfig {
    /// Device capacity in 512-byte sectors
    pub capacity_sectors: u64,
    /// Maximum bytes in a single segment
    pub size_max: u32,
    /// Maximum segments in a single request
    pub seg_max: u32,
    /// Advertised geometry
    pub geometry: Geometry,
    /// Device block size; this driver requires [`SECTOR_SIZE`]
    pub blk_size: u32,
}

impl BlkConfig {
    /// Device capacity in bytes.
    pub const fn capacity_bytes(&self) -> u64 {
        self.capacity_sectors * SECTOR_SIZE as u64
    }
}

/// One in-flight request: the chain head plus the scratch DMA buffers
/// named by its descriptors.
struct Request {
    head: u16,
    header: DmaBuffer,
    data: Option<DmaBuffer>,
    status: DmaBuffer,
}

/// Synchronous block device driver over a virtio transport.
pub struct VirtioBlk<'a> {
    device: VirtioDevice<'a>,
    allocator: &'a dyn DmaAllocator,
    clock: &'a dyn MonotonicClock,
    config: BlkConfig,
    request_timeout: Duration,
}

impl<'a> VirtioBlk<'a> {
    /// Probe an MMIO window for a virtio block device and initialise it.
    ///
    /// Returns `Ok(None)` when the window holds something other than a
    /// block device. On success the device is fully operational: config
    /// read and validated, request queue programmed, `DRIVER_OK` set.
    pub fn probe(
        region: MmioRegion,
        allocator: &'a dyn DmaAllocator,
        clock: &'a dyn MonotonicClock,
    ) -> Result<Option<Self>, VirtioError> {
        let Some(mut device) = VirtioDevice::probe(region, DeviceType::Block, allocator)? else {
            return Ok(None);
        };

        let raw: RawBlkConfig = device.read_config(0);
        if raw.blk_size != SECTOR_SIZE as u32 {
            log::error!(
                "virtio-blk: device block size {} unsupported (need {})",
                raw.blk_size,
                SECTOR_SIZE
            );
            return Err(VirtioError::InvalidDevice {
                reason: "unsupported block size",
            });
        }
        let config = BlkConfig {
            capacity_sectors: raw.capacity,
            size_max: raw.size_max,
            seg_max: raw.seg_max,
            geometry: Geometry {
                cylinders: u16::from_le_bytes([raw.geometry[0], raw.geometry[1]]),
                heads: raw.geometry[2],
                sectors: raw.geometry[3],
            },
            blk_size: raw.blk_size,
        };

        device.setup_queue(REQUEST_QUEUE)?;
        device.finish_init();

        log::info!(
            "virtio-blk: {} sectors ({} KiB), queue depth {}",
            config.capacity_sectors,
            config.capacity_bytes() / 1024,
            device.queue(REQUEST_QUEUE).map_or(0, |q| q.size())
        );
        Ok(Some(Self {
            device,
            allocator,
            clock,
            config,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }))
    }

    /// Device configuration read at probe time.
    pub fn config(&self) -> &BlkConfig {
        &self.config
    }

    /// Override the per-request completion deadline.
    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
    }

    /// Read whole sectors starting at `lba` into `out`.
    ///
    /// `out.len()` must be a nonzero multiple of [`SECTOR_SIZE`] and the
    /// addressed range must lie within the device capacity.
    pub fn read_sectors(&mut self, lba: u64, out: &mut [u8]) -> Result<(), VirtioError> {
        let count = sector_count(out.len())?;
        self.check_range(lba, count)?;

        let req = self.submit(req_type::IN, lba, out.len(), DmaDirection::FromDevice, None)?;
        self.execute(&req)?;
        if let Some(data) = &req.data {
            data.copy_to_slice(0, out);
        }
        self.release(&req);
        Ok(())
    }

    /// Write whole sectors starting at `lba` from `data`.
    pub fn write_sectors(&mut self, lba: u64, data: &[u8]) -> Result<(), VirtioError> {
        let count = sector_count(data.len())?;
        self.check_range(lba, count)?;

        let req = self.submit(req_type::OUT, lba, data.len(), DmaDirection::ToDevice, Some(data))?;
        self.execute(&req)?;
        self.release(&req);
        Ok(())
    }

    /// Flush the device write cache.
    pub fn flush(&mut self) -> Result<(), VirtioError> {
        let req = self.submit(req_type::FLUSH, 0, 0, DmaDirection::ToDevice, None)?;
        self.execute(&req)?;
        self.release(&req);
        Ok(())
    }

    fn check_range(&self, lba: u64, count: u64) -> Result<(), VirtioError> {
        let in_range = lba
            .checked_add(count)
            .is_some_and(|end| end <= self.config.capacity_sectors);
        if in_range {
            Ok(())
        } else {
            Err(VirtioError::InvalidArgument {
                reason: "transfer beyond device capacity",
            })
        }
    }

    /// Build and publish one request chain, then ring the doorbell.
    ///
    /// Allocates the header, optional data and status scratch buffers. If
    /// anything fails, everything already allocated goes back to the pool
    /// before the error propagates, so backpressure (`QueueFull`) leaves
    /// no residue.
    fn submit(
        &mut self,
        kind: u32,
        sector: u64,
        data_len: usize,
        direction: DmaDirection,
        payload: Option<&[u8]>,
    ) -> Result<Request, VirtioError> {
        let allocator = self.allocator;
        let queue = self
            .device
            .queue_mut(REQUEST_QUEUE)
            .ok_or(VirtioError::QueueNotAvail {
                index: REQUEST_QUEUE,
            })?;

        let header = allocator.alloc_zeroed(REQ_HEADER_LEN)?;
        let data = if data_len > 0 {
            match allocator.alloc_zeroed(data_len) {
                Ok(buf) => Some(buf),
                Err(e) => {
                    free_quiet(allocator, &header);
                    return Err(e.into());
                }
            }
        } else {
            None
        };
        let status = match allocator.alloc_zeroed(1) {
            Ok(buf) => buf,
            Err(e) => {
                free_quiet(allocator, &header);
                if let Some(d) = &data {
                    free_quiet(allocator, d);
                }
                return Err(e.into());
            }
        };

        let req_header = ReqHeader {
            type_: kind,
            reserved: 0,
            sector,
        };
        header.copy_from_slice(0, req_header.as_bytes());
        if let (Some(buf), Some(bytes)) = (&data, payload) {
            debug_assert_eq!(bytes.len(), data_len);
            buf.copy_from_slice(0, bytes);
        }

        let header_desc = Buffer::to_device(header.bus_addr(), REQ_HEADER_LEN as u32);
        let status_desc = Buffer::from_device(status.bus_addr(), 1);
        let added = match &data {
            Some(buf) => queue.add_buf(&[
                header_desc,
                Buffer {
                    addr: buf.bus_addr(),
                    len: data_len as u32,
                    direction,
                },
                status_desc,
            ]),
            None => queue.add_buf(&[header_desc, status_desc]),
        };
        let head = match added {
            Ok(head) => head,
            Err(e) => {
                free_quiet(allocator, &header);
                if let Some(d) = &data {
                    free_quiet(allocator, d);
                }
                free_quiet(allocator, &status);
                return Err(e);
            }
        };

        self.device.notify_queue(REQUEST_QUEUE);
        Ok(Request {
            head,
            header,
            data,
            status,
        })
    }

    /// Wait for the request to complete and validate its status byte.
    ///
    /// Returns the device-reported byte count. On a bad status the
    /// request's buffers are released here; on a timeout they are left
    /// in flight (see the module docs).
    fn execute(&mut self, req: &Request) -> Result<u32, VirtioError> {
        let len = self.wait(req.head)?;
        let status = req.status.read_u8(0);
        if status != req_status::OK {
            self.release(req);
            log::error!(
                "virtio-blk: request {} failed with device status {}",
                req.head,
                status
            );
            return Err(VirtioError::Io { status });
        }
        Ok(len)
    }

    /// Poll the used ring for `head` under the request deadline.
    ///
    /// A clock reporting frequency 0 cannot measure the deadline; the
    /// wait then degrades to a fixed poll budget, matching what
    /// `spin_for` does for the spin itself, so a dead device still
    /// cannot hang the caller.
    fn wait(&mut self, head: u16) -> Result<u32, VirtioError> {
        let timeout_ns = self.request_timeout.as_nanos();
        let clock_running = self.clock.frequency_hz() != 0;
        // One budgeted poll per microsecond of the nominal timeout.
        let mut poll_budget = self.request_timeout.as_micros().max(1);
        let start = self.clock.now_ns();
        loop {
            let queue = self
                .device
                .queue_mut(REQUEST_QUEUE)
                .ok_or(VirtioError::QueueNotAvail {
                    index: REQUEST_QUEUE,
                })?;
            if let Some((id, len)) = queue.pop_used() {
                let causes = self.device.ack_interrupt();
                if causes & interrupt::CONFIG_CHANGE != 0 {
                    log::debug!("virtio-blk: configuration change signalled mid-request");
                }
                if id == head {
                    return Ok(len);
                }
                // Devices may complete out of submission order; anything
                // that is not ours has already been recycled by pop_used.
                log::warn!(
                    "virtio-blk: completion for descriptor {} while waiting on {}",
                    id,
                    head
                );
                continue;
            }

            let deadline_hit = if clock_running {
                self.clock.now_ns().wrapping_sub(start) >= timeout_ns
            } else {
                poll_budget -= 1;
                poll_budget == 0
            };
            if deadline_hit {
                log::error!(
                    "virtio-blk: request {} timed out after {} ms",
                    head,
                    self.request_timeout.as_millis()
                );
                return Err(VirtioError::Timeout);
            }
            spin_for(self.clock, POLL_INTERVAL);
        }
    }

    /// Return a request's scratch buffers to the pool.
    fn release(&self, req: &Request) {
        free_quiet(self.allocator, &req.header);
        if let Some(data) = &req.data {
            free_quiet(self.allocator, data);
        }
        free_quiet(self.allocator, &req.status);
    }
}

fn free_quiet(allocator: &dyn DmaAllocator, buf: &DmaBuffer) {
    if let Err(e) = allocator.free(buf) {
        log::warn!("virtio-blk: failed to return request buffer: {}", e);
    }
}

impl core::fmt::Debug for VirtioBlk<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtioBlk")
            .field("capacity_sectors", &self.config.capacity_sectors)
            .field("timeout_ms", &self.request_timeout.as_millis())
            .finish()
    }
}

/// Whole-sector length validation shared by the read and write paths.
fn sector_count(len: usize) -> Result<u64, VirtioError> {
    if len == 0 {
        return Err(VirtioError::InvalidArgument {
            reason: "zero-length transfer",
        });
    }
    if !len.is_multiple_of(SECTOR_SIZE) {
        return Err(VirtioError::InvalidArgument {
            reason: "transfer length not a whole number of sectors",
        });
    }
    if len > u32::MAX as usize {
        return Err(VirtioError::InvalidArgument {
            reason: "transfer too large for one descriptor",
        });
    }
    Ok((len / SECTOR_SIZE) as u64)
}
