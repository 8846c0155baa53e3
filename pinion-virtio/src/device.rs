//! Virtio Device Lifecycle
//!
//! Drives the status state machine over a virtio-mmio window and owns the
//! virtqueues of one device: probe and identify, negotiate features, set
//! up queues, then hand the device to a client with `DRIVER_OK`.
//!
//! Status bits are only ever added (the initial reset write excepted), so
//! the sequence is `RESET -> ACKNOWLEDGE -> DRIVER -> FEATURES_OK ->
//! DRIVER_OK`. Queue programming sits between the last two: the device
//! must not be notified before `DRIVER_OK`.

use pinion_common::addr::page;
use pinion_dma::DmaAllocator;
use pinion_mmio::{barrier, MmioRegion};
use zerocopy::{FromBytes, IntoBytes};

use crate::error::VirtioError;
use crate::mmio::{features, status, DeviceType, MmioVersion, VirtioMmio, MAGIC_VALUE};
use crate::virtqueue::{QueueLayout, Virtqueue};

/// Queue size used when the device allows more.
pub const DEFAULT_QUEUE_SIZE: u16 = 128;

/// Queue slots per device. Plenty for every device type this stack
/// drives; a block device uses one.
pub const MAX_QUEUES: usize = 4;

/// One probed virtio device and its queues.
///
/// Holds the transport state (version, negotiated features) and up to
/// [`MAX_QUEUES`] virtqueues keyed by queue index. Ring memory comes from
/// the allocator bound at probe time; there is no teardown path, matching
/// the run-to-completion lifetime of this driver stack.
pub struct VirtioDevice<'a> {
    mmio: VirtioMmio,
    version: MmioVersion,
    device_type: DeviceType,
    /// Feature bits accepted during negotiation
    driver_features: u64,
    allocator: &'a dyn DmaAllocator,
    queues: [Option<Virtqueue>; MAX_QUEUES],
}

impl<'a> VirtioDevice<'a> {
    /// Probe an MMIO window for a virtio device of the expected type.
    ///
    /// Returns `Ok(None)` when the window holds no device of that type (a
    /// placeholder window or some other device type) so callers can walk
    /// a list of candidate windows. A window that is not a virtio device
    /// at all, or one whose version this driver cannot speak, is an
    /// [`VirtioError::InvalidDevice`].
    ///
    /// On success the device has been taken through feature negotiation
    /// and is left one `finish_init` call short of operational.
    pub fn probe(
        region: MmioRegion,
        expected: DeviceType,
        allocator: &'a dyn DmaAllocator,
    ) -> Result<Option<Self>, VirtioError> {
        let mmio = VirtioMmio::new(region);

        if mmio.magic() != MAGIC_VALUE {
            return Err(VirtioError::InvalidDevice {
                reason: "bad magic value",
            });
        }
        let Some(version) = MmioVersion::from_register(mmio.version()) else {
            return Err(VirtioError::InvalidDevice {
                reason: "unsupported device version",
            });
        };

        let device_id = mmio.device_id();
        if device_id == 0 {
            // Placeholder window with no device behind it.
            return Ok(None);
        }
        match DeviceType::from_register(device_id) {
            Some(found) if found == expected => {}
            found => {
                log::debug!(
                    "virtio: window at {:#x} holds {:?} (id {}), not {:?}",
                    region.base(),
                    found,
                    device_id,
                    expected
                );
                return Ok(None);
            }
        }

        let mut device = Self {
            mmio,
            version,
            device_type: expected,
            driver_features: 0,
            allocator,
            queues: [None, None, None, None],
        };
        device.negotiate()?;

        log::info!(
            "virtio: {:?} device at {:#x}, {:?} transport, features {:#x}",
            device.device_type,
            region.base(),
            device.version,
            device.driver_features
        );
        Ok(Some(device))
    }

    /// Run the status machine up to `FEATURES_OK`.
    fn negotiate(&mut self) -> Result<(), VirtioError> {
        self.mmio.reset();
        self.mmio.set_status_bits(status::ACKNOWLEDGE);
        self.mmio.set_status_bits(status::DRIVER);

        self.driver_features = match self.version {
            MmioVersion::Legacy => {
                // One 32-bit feature word; none of it is needed to drive
                // the transport, so accept nothing.
                let offered = self.mmio.device_features(0);
                log::debug!("virtio: legacy device offers {:#x}", offered);
                self.mmio.set_driver_features(0, 0);
                0
            }
            MmioVersion::Modern => {
                let low = u64::from(self.mmio.device_features(0));
                let high = u64::from(self.mmio.device_features(1));
                let offered = (high << 32) | low;
                if offered & features::VERSION_1 == 0 {
                    self.fail("device does not offer VERSION_1")?;
                }
                // Only the transport-version bit; device-specific feature
                // selection is not part of this driver's surface.
                let accepted = features::VERSION_1;
                self.mmio.set_driver_features(0, accepted as u32);
                self.mmio.set_driver_features(1, (accepted >> 32) as u32);
                accepted
            }
        };

        self.mmio.set_status_bits(status::FEATURES_OK);
        self.confirm_features()?;

        if matches!(self.version, MmioVersion::Legacy) {
            self.mmio.set_guest_page_size(page::SIZE_4K as u32);
        }
        Ok(())
    }

    /// Re-read status after offering `FEATURES_OK`.
    ///
    /// A device that cannot operate with the negotiated set clears the
    /// bit; that is a refusal, answered with `FAILED`.
    fn confirm_features(&self) -> Result<(), VirtioError> {
        if self.mmio.device_status() & status::FEATURES_OK == 0 {
            self.fail("device rejected negotiated features")?;
        }
        Ok(())
    }

    /// Mark the device failed and report why.
    fn fail(&self, reason: &'static str) -> Result<(), VirtioError> {
        log::error!("virtio: {}", reason);
        self.mmio.set_status_bits(status::FAILED);
        Err(VirtioError::InvalidDevice { reason })
    }

    /// Allocate and program the virtqueue at `index`.
    ///
    /// The queue size is the smaller of the device's maximum and
    /// [`DEFAULT_QUEUE_SIZE`]. How the rings are handed to the device is
    /// the one place the two transport versions genuinely differ: legacy
    /// takes a page frame number, modern takes the three ring addresses
    /// and an explicit ready bit.
    pub fn setup_queue(&mut self, index: u16) -> Result<(), VirtioError> {
        let slot = index as usize;
        if slot >= MAX_QUEUES || self.queues[slot].is_some() {
            return Err(VirtioError::QueueNotAvail { index });
        }

        self.mmio.select_queue(u32::from(index));
        let max = self.mmio.queue_num_max();
        if max == 0 {
            return Err(VirtioError::QueueNotAvail { index });
        }
        let size = max.min(u32::from(DEFAULT_QUEUE_SIZE)) as u16;

        let layout = QueueLayout::for_size(size);
        let memory = self.allocator.alloc_zeroed(layout.total_size)?;
        let vq = Virtqueue::new(memory, size)?;

        self.mmio.set_queue_num(u32::from(size));
        match self.version {
            MmioVersion::Legacy => {
                self.mmio.set_queue_align(page::SIZE_4K as u32);
                self.mmio
                    .set_queue_pfn(vq.desc_addr().page_frame_number() as u32);
            }
            MmioVersion::Modern => {
                self.mmio.set_queue_desc(vq.desc_addr().as_u64());
                self.mmio.set_queue_avail(vq.avail_addr().as_u64());
                self.mmio.set_queue_used(vq.used_addr().as_u64());
                self.mmio.set_queue_ready(true);
            }
        }

        log::debug!(
            "virtio: queue {} ready, {} descriptors at {}",
            index,
            size,
            vq.desc_addr()
        );
        self.queues[slot] = Some(vq);
        Ok(())
    }

    /// Complete initialisation: the device may be used after this.
    pub fn finish_init(&self) {
        self.mmio.set_status_bits(
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK,
        );
    }

    /// Tell the device queue `index` has new available buffers.
    ///
    /// Fire-and-forget; completion arrives on the used ring.
    pub fn notify_queue(&self, index: u16) {
        // Ring writes in ordinary memory must be visible to the device
        // before the doorbell write in device memory.
        barrier::dmb_sy();
        self.mmio.queue_notify(u32::from(index));
    }

    /// The virtqueue at `index`, if configured.
    pub fn queue(&self, index: u16) -> Option<&Virtqueue> {
        self.queues.get(index as usize)?.as_ref()
    }

    /// Mutable access to the virtqueue at `index`, if configured.
    pub fn queue_mut(&mut self, index: u16) -> Option<&mut Virtqueue> {
        self.queues.get_mut(index as usize)?.as_mut()
    }

    /// Read a typed value from the device-specific config space.
    ///
    /// Re-reads until the generation counter is stable around the byte
    /// copy, so multi-field reads cannot observe a torn update. Legacy
    /// devices pin the counter at zero and take a single pass.
    pub fn read_config<T: FromBytes + IntoBytes>(&self, offset: usize) -> T {
        loop {
            let generation = self.mmio.config_generation();
            if let Some(value) = self.read_config_once(offset, generation) {
                return value;
            }
        }
    }

    /// One pass over the config bytes. `None` means the generation
    /// counter no longer reads `generation`: the device updated the
    /// space mid-copy and the bytes cannot be trusted.
    fn read_config_once<T: FromBytes + IntoBytes>(
        &self,
        offset: usize,
        generation: u32,
    ) -> Option<T> {
        let mut value = T::new_zeroed();
        for (i, byte) in value.as_mut_bytes().iter_mut().enumerate() {
            *byte = self.mmio.config_read8(offset + i);
        }
        if self.mmio.config_generation() == generation {
            Some(value)
        } else {
            None
        }
    }

    /// Read and acknowledge pending interrupt causes. Returns the causes
    /// that were pending (possibly 0 when polling).
    pub fn ack_interrupt(&self) -> u32 {
        let causes = self.mmio.interrupt_status();
        if causes != 0 {
            self.mmio.interrupt_ack(causes);
        }
        causes
    }

    /// Negotiated feature bits.
    pub fn driver_features(&self) -> u64 {
        self.driver_features
    }

    /// Transport version of the underlying window.
    pub fn version(&self) -> MmioVersion {
        self.version
    }

    /// Device type confirmed at probe time.
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }
}

impl core::fmt::Debug for VirtioDevice<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtioDevice")
            .field("type", &self.device_type)
            .field("version", &self.version)
            .field("features", &format_args!("{:#x}", self.driver_features))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    use pinion_common::{BusAddr, VirtAddr};
    use pinion_dma::DmaPool;

    use crate::mmio::{interrupt, regs};

    const BUS_BASE: u64 = 0x8000_0000;

    #[repr(align(4096))]
    struct RegPage([u8; 0x200]);

    impl RegPage {
        fn new() -> Self {
            Self([0; 0x200])
        }

        fn region(&mut self) -> MmioRegion {
            // SAFETY: backing array outlives the region within each test.
            unsafe { MmioRegion::new(self.0.as_mut_ptr() as usize, self.0.len()) }
        }
    }

    /// Passive register page pretending to be a block device. Reads
    /// return whatever was last written, which is enough for the
    /// write-path assertions these tests make.
    fn seed_block_device(region: &MmioRegion, version: u32) {
        region.write32(regs::MAGIC, MAGIC_VALUE);
        region.write32(regs::VERSION, version);
        region.write32(regs::DEVICE_ID, 2);
        // Both feature-word reads hit the same cell; value 1 makes the
        // modern driver see bit 32 (VERSION_1) offered.
        region.write32(regs::DEVICE_FEATURES, 1);
        region.write32(regs::QUEUE_NUM_MAX, 8);
    }

    /// Page-aligned heap backing. The Vec must outlive the pool.
    fn backing(frames: usize) -> (Vec<u8>, VirtAddr) {
        let mut mem = Vec::new();
        mem.resize((frames + 1) * page::SIZE_4K, 0xa5u8);
        let base = page::align_up_4k(mem.as_mut_ptr() as usize);
        (mem, VirtAddr::new(base as u64))
    }

    fn pool(virt: VirtAddr, frames: usize) -> DmaPool {
        // SAFETY: test backing is valid heap memory for the pool's lifetime.
        unsafe { DmaPool::new(virt, BusAddr::new(BUS_BASE), frames * page::SIZE_4K) }.unwrap()
    }

    #[test]
    fn test_probe_rejects_bad_magic() {
        let mut page = RegPage::new();
        let region = page.region();
        region.write32(regs::MAGIC, 0x0bad_0bad);
        region.write32(regs::VERSION, 2);

        let (_mem, virt) = backing(8);
        let pool = pool(virt, 8);
        assert!(matches!(
            VirtioDevice::probe(region, DeviceType::Block, &pool),
            Err(VirtioError::InvalidDevice { .. })
        ));
    }

    #[test]
    fn test_probe_rejects_unknown_version() {
        let mut page = RegPage::new();
        let region = page.region();
        seed_block_device(&region, 3);

        let (_mem, virt) = backing(8);
        let pool = pool(virt, 8);
        assert!(matches!(
            VirtioDevice::probe(region, DeviceType::Block, &pool),
            Err(VirtioError::InvalidDevice { .. })
        ));
    }

    #[test]
    fn test_probe_type_mismatch_is_not_found() {
        let (_mem, virt) = backing(8);
        let pool = pool(virt, 8);

        let mut page = RegPage::new();
        let region = page.region();
        seed_block_device(&region, 2);
        region.write32(regs::DEVICE_ID, 1); // network
        let r = VirtioDevice::probe(region, DeviceType::Block, &pool).unwrap();
        assert!(r.is_none());

        // Placeholder window: id 0.
        region.write32(regs::DEVICE_ID, 0);
        let r = VirtioDevice::probe(region, DeviceType::Block, &pool).unwrap();
        assert!(r.is_none());
    }

    #[test]
    fn test_probe_negotiates_modern_transport() {
        let mut page = RegPage::new();
        let region = page.region();
        seed_block_device(&region, 2);

        let (_mem, virt) = backing(8);
        let pool = pool(virt, 8);
        let device = VirtioDevice::probe(region, DeviceType::Block, &pool)
            .unwrap()
            .unwrap();

        assert_eq!(device.version(), MmioVersion::Modern);
        assert_eq!(device.device_type(), DeviceType::Block);
        assert_eq!(device.driver_features(), features::VERSION_1);
        assert_eq!(
            region.read32(regs::STATUS),
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK
        );
        // Accepted features were written back through the selector.
        assert_eq!(region.read32(regs::DRIVER_FEATURES_SEL), 1);
        assert_eq!(region.read32(regs::DRIVER_FEATURES), 1);
        // Modern transports are not told a guest page size.
        assert_eq!(region.read32(regs::GUEST_PAGE_SIZE), 0);
    }

    #[test]
    fn test_probe_rejects_modern_without_version1() {
        let mut page = RegPage::new();
        let region = page.region();
        seed_block_device(&region, 2);
        region.write32(regs::DEVICE_FEATURES, 0);

        let (_mem, virt) = backing(8);
        let pool = pool(virt, 8);
        assert!(matches!(
            VirtioDevice::probe(region, DeviceType::Block, &pool),
            Err(VirtioError::InvalidDevice { .. })
        ));
        assert_ne!(region.read32(regs::STATUS) & status::FAILED, 0);
    }

    #[test]
    fn test_probe_legacy_accepts_nothing_and_sets_page_size() {
        let mut page = RegPage::new();
        let region = page.region();
        seed_block_device(&region, 1);

        let (_mem, virt) = backing(8);
        let pool = pool(virt, 8);
        let device = VirtioDevice::probe(region, DeviceType::Block, &pool)
            .unwrap()
            .unwrap();

        assert_eq!(device.version(), MmioVersion::Legacy);
        assert_eq!(device.driver_features(), 0);
        assert_eq!(region.read32(regs::DRIVER_FEATURES), 0);
        assert_eq!(region.read32(regs::GUEST_PAGE_SIZE), 4096);
    }

    #[test]
    fn test_setup_queue_legacy_programs_pfn_only() {
        let mut page = RegPage::new();
        let region = page.region();
        seed_block_device(&region, 1);

        let (_mem, virt) = backing(8);
        let pool = pool(virt, 8);
        let mut device = VirtioDevice::probe(region, DeviceType::Block, &pool)
            .unwrap()
            .unwrap();
        device.setup_queue(0).unwrap();

        let vq = device.queue(0).unwrap();
        assert_eq!(vq.size(), 8);
        assert_eq!(region.read32(regs::QUEUE_NUM), 8);
        assert_eq!(region.read32(regs::QUEUE_ALIGN), 4096);
        assert_eq!(
            u64::from(region.read32(regs::QUEUE_PFN)),
            vq.desc_addr().as_u64() >> 12
        );
        // None of the modern registers were touched.
        assert_eq!(region.read32(regs::QUEUE_READY), 0);
        assert_eq!(region.read32(regs::QUEUE_DESC_LOW), 0);
        assert_eq!(region.read32(regs::QUEUE_USED_HIGH), 0);
    }

    #[test]
    fn test_setup_queue_modern_programs_addresses_and_ready() {
        let mut page = RegPage::new();
        let region = page.region();
        seed_block_device(&region, 2);

        let (_mem, virt) = backing(8);
        let pool = pool(virt, 8);
        let mut device = VirtioDevice::probe(region, DeviceType::Block, &pool)
            .unwrap()
            .unwrap();
        device.setup_queue(0).unwrap();

        let vq = device.queue(0).unwrap();
        let lo = |a: u64| a as u32;
        let hi = |a: u64| (a >> 32) as u32;
        assert_eq!(region.read32(regs::QUEUE_DESC_LOW), lo(vq.desc_addr().as_u64()));
        assert_eq!(region.read32(regs::QUEUE_DESC_HIGH), hi(vq.desc_addr().as_u64()));
        assert_eq!(region.read32(regs::QUEUE_AVAIL_LOW), lo(vq.avail_addr().as_u64()));
        assert_eq!(region.read32(regs::QUEUE_AVAIL_HIGH), hi(vq.avail_addr().as_u64()));
        assert_eq!(region.read32(regs::QUEUE_USED_LOW), lo(vq.used_addr().as_u64()));
        assert_eq!(region.read32(regs::QUEUE_USED_HIGH), hi(vq.used_addr().as_u64()));
        assert_eq!(region.read32(regs::QUEUE_READY), 1);
        // The legacy PFN register stays untouched.
        assert_eq!(region.read32(regs::QUEUE_PFN), 0);
    }

    #[test]
    fn test_setup_queue_clamps_size_to_default() {
        let mut page = RegPage::new();
        let region = page.region();
        seed_block_device(&region, 2);
        region.write32(regs::QUEUE_NUM_MAX, 1024);

        let (_mem, virt) = backing(8);
        let pool = pool(virt, 8);
        let mut device = VirtioDevice::probe(region, DeviceType::Block, &pool)
            .unwrap()
            .unwrap();
        device.setup_queue(0).unwrap();

        assert_eq!(device.queue(0).unwrap().size(), DEFAULT_QUEUE_SIZE);
        assert_eq!(region.read32(regs::QUEUE_NUM), u32::from(DEFAULT_QUEUE_SIZE));
    }

    #[test]
    fn test_setup_queue_rejects_absent_and_reused_queues() {
        let mut page = RegPage::new();
        let region = page.region();
        seed_block_device(&region, 2);

        let (_mem, virt) = backing(16);
        let pool = pool(virt, 16);
        let mut device = VirtioDevice::probe(region, DeviceType::Block, &pool)
            .unwrap()
            .unwrap();

        assert_eq!(
            device.setup_queue(9),
            Err(VirtioError::QueueNotAvail { index: 9 })
        );

        device.setup_queue(0).unwrap();
        assert_eq!(
            device.setup_queue(0),
            Err(VirtioError::QueueNotAvail { index: 0 })
        );

        // A device that reports max size 0 has no queue to set up.
        region.write32(regs::QUEUE_NUM_MAX, 0);
        assert_eq!(
            device.setup_queue(1),
            Err(VirtioError::QueueNotAvail { index: 1 })
        );
        assert!(device.queue(1).is_none());
    }

    #[test]
    fn test_finish_init_and_notify() {
        let mut page = RegPage::new();
        let region = page.region();
        seed_block_device(&region, 2);

        let (_mem, virt) = backing(8);
        let pool = pool(virt, 8);
        let device = VirtioDevice::probe(region, DeviceType::Block, &pool)
            .unwrap()
            .unwrap();

        device.finish_init();
        assert_eq!(
            region.read32(regs::STATUS),
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK
        );

        region.write32(regs::QUEUE_NOTIFY, 0xdead_dead);
        device.notify_queue(0);
        assert_eq!(region.read32(regs::QUEUE_NOTIFY), 0);
    }

    #[test]
    fn test_read_config_typed() {
        let mut page = RegPage::new();
        let region = page.region();
        seed_block_device(&region, 2);
        region.write32(regs::CONFIG, 0x0000_2000);
        region.write32(regs::CONFIG + 4, 0x0000_0001);

        let (_mem, virt) = backing(8);
        let pool = pool(virt, 8);
        let device = VirtioDevice::probe(region, DeviceType::Block, &pool)
            .unwrap()
            .unwrap();

        let capacity: u64 = device.read_config(0);
        assert_eq!(capacity, 0x0000_0001_0000_2000);
        let word: u32 = device.read_config(4);
        assert_eq!(word, 1);
    }

    #[test]
    fn test_read_config_discards_torn_pass() {
        let mut page = RegPage::new();
        let region = page.region();
        seed_block_device(&region, 2);

        let (_mem, virt) = backing(8);
        let pool = pool(virt, 8);
        let device = VirtioDevice::probe(region, DeviceType::Block, &pool)
            .unwrap()
            .unwrap();

        region.write32(regs::CONFIG, 0x1111_1111);
        region.write32(regs::CONFIG + 4, 0x2222_2222);
        region.write32(regs::CONFIG_GENERATION, 1);

        // A pass that sampled the counter before the bump is thrown away,
        // whatever it copied.
        let torn: Option<u64> = device.read_config_once(0, 0);
        assert!(torn.is_none());

        // A pass whose counter held is kept, and the public read (which
        // samples the current counter) returns the coherent value.
        let stable: Option<u64> = device.read_config_once(0, 1);
        assert_eq!(stable, Some(0x2222_2222_1111_1111));
        let value: u64 = device.read_config(0);
        assert_eq!(value, 0x2222_2222_1111_1111);
    }

    #[test]
    fn test_dropped_features_ok_marks_device_failed() {
        let mut page = RegPage::new();
        let region = page.region();
        seed_block_device(&region, 2);

        let (_mem, virt) = backing(8);
        let pool = pool(virt, 8);
        let device = VirtioDevice::probe(region, DeviceType::Block, &pool)
            .unwrap()
            .unwrap();

        // Simulate a device withdrawing FEATURES_OK between the driver's
        // status write and its confirming re-read.
        region.write32(regs::STATUS, status::ACKNOWLEDGE | status::DRIVER);
        assert!(matches!(
            device.confirm_features(),
            Err(VirtioError::InvalidDevice { .. })
        ));
        assert_ne!(region.read32(regs::STATUS) & status::FAILED, 0);
    }

    #[test]
    fn test_ack_interrupt_passes_causes_through() {
        let mut page = RegPage::new();
        let region = page.region();
        seed_block_device(&region, 2);

        let (_mem, virt) = backing(8);
        let pool = pool(virt, 8);
        let device = VirtioDevice::probe(region, DeviceType::Block, &pool)
            .unwrap()
            .unwrap();

        assert_eq!(device.ack_interrupt(), 0);
        assert_eq!(region.read32(regs::INTERRUPT_ACK), 0);

        region.write32(regs::INTERRUPT_STATUS, interrupt::USED_BUFFER);
        assert_eq!(device.ack_interrupt(), interrupt::USED_BUFFER);
        assert_eq!(region.read32(regs::INTERRUPT_ACK), interrupt::USED_BUFFER);
    }
}
