//! Virtio-mmio Transport Registers
//!
//! Register-level view of a virtio-mmio device window. Covers both the
//! legacy (version 1) and modern (version 2) register layouts; which
//! queue-programming registers a driver may touch depends on the version
//! it read at probe time, and [`crate::device::VirtioDevice`] enforces
//! that split.
//!
//! Registers follow modern virtio nomenclature: the feature words the
//! device offers are `device_features`, the words the driver accepts are
//! `driver_features`.

use pinion_mmio::MmioRegion;

/// The magic value identifying a virtio-mmio window ("virt", little-endian).
pub const MAGIC_VALUE: u32 = 0x7472_6976;

/// Register offsets within a virtio-mmio window.
pub mod regs {
    /// Magic value (R)
    pub const MAGIC: usize = 0x000;
    /// Device version: 1 = legacy, 2 = modern (R)
    pub const VERSION: usize = 0x004;
    /// Device type (R)
    pub const DEVICE_ID: usize = 0x008;
    /// Vendor ID (R)
    pub const VENDOR_ID: usize = 0x00c;
    /// Features offered by the device, 32 bits per selected word (R)
    pub const DEVICE_FEATURES: usize = 0x010;
    /// Selects which device feature word is visible (W)
    pub const DEVICE_FEATURES_SEL: usize = 0x014;
    /// Features accepted by the driver, 32 bits per selected word (W)
    pub const DRIVER_FEATURES: usize = 0x020;
    /// Selects which driver feature word is written (W)
    pub const DRIVER_FEATURES_SEL: usize = 0x024;
    /// Guest page size in bytes (W, legacy only)
    pub const GUEST_PAGE_SIZE: usize = 0x028;
    /// Selects the queue the queue registers refer to (W)
    pub const QUEUE_SEL: usize = 0x030;
    /// Maximum size of the selected queue, 0 if absent (R)
    pub const QUEUE_NUM_MAX: usize = 0x034;
    /// Size of the selected queue (W)
    pub const QUEUE_NUM: usize = 0x038;
    /// Used-ring alignment of the selected queue (W, legacy only)
    pub const QUEUE_ALIGN: usize = 0x03c;
    /// Page frame number of the selected queue (RW, legacy only)
    pub const QUEUE_PFN: usize = 0x040;
    /// Marks the selected queue ready (RW, modern only)
    pub const QUEUE_READY: usize = 0x044;
    /// Queue notifier (W)
    pub const QUEUE_NOTIFY: usize = 0x050;
    /// Pending interrupt causes (R)
    pub const INTERRUPT_STATUS: usize = 0x060;
    /// Interrupt acknowledge (W)
    pub const INTERRUPT_ACK: usize = 0x064;
    /// Device status (RW)
    pub const STATUS: usize = 0x070;
    /// Descriptor table address of the selected queue (W, modern only)
    pub const QUEUE_DESC_LOW: usize = 0x080;
    pub const QUEUE_DESC_HIGH: usize = 0x084;
    /// Available ring address of the selected queue (W, modern only)
    pub const QUEUE_AVAIL_LOW: usize = 0x090;
    pub const QUEUE_AVAIL_HIGH: usize = 0x094;
    /// Used ring address of the selected queue (W, modern only)
    pub const QUEUE_USED_LOW: usize = 0x0a0;
    pub const QUEUE_USED_HIGH: usize = 0x0a4;
    /// Configuration space generation counter (R)
    pub const CONFIG_GENERATION: usize = 0x0fc;
    /// Start of the device-specific configuration space
    pub const CONFIG: usize = 0x100;
}

/// Device status bits, set cumulatively during initialisation.
pub mod status {
    /// Driver has noticed the device
    pub const ACKNOWLEDGE: u32 = 1;
    /// Driver knows how to drive the device
    pub const DRIVER: u32 = 2;
    /// Driver is ready; the device may be used
    pub const DRIVER_OK: u32 = 4;
    /// Feature negotiation is complete
    pub const FEATURES_OK: u32 = 8;
    /// Device hit an error and needs a reset
    pub const DEVICE_NEEDS_RESET: u32 = 64;
    /// Driver has given up on the device
    pub const FAILED: u32 = 128;
}

/// Device-independent feature bits.
pub mod features {
    /// Device complies with the modern (1.0+) specification
    pub const VERSION_1: u64 = 1 << 32;
}

/// Interrupt cause bits in `INTERRUPT_STATUS`.
pub mod interrupt {
    /// The device used a buffer in at least one virtqueue
    pub const USED_BUFFER: u32 = 1 << 0;
    /// The device configuration changed
    pub const CONFIG_CHANGE: u32 = 1 << 1;
}

/// Register layouts a virtio-mmio window may present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioVersion {
    /// Version 1: page-based queue addressing via `GUEST_PAGE_SIZE`,
    /// `QUEUE_ALIGN` and `QUEUE_PFN`.
    Legacy,
    /// Version 2: byte-addressed queue areas plus `QUEUE_READY`.
    Modern,
}

impl MmioVersion {
    /// Decode the `VERSION` register. Anything but 1 or 2 is unknown.
    pub fn from_register(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Legacy),
            2 => Some(Self::Modern),
            _ => None,
        }
    }
}

/// Device types this driver stack knows about.
///
/// The `DEVICE_ID` register carries one of these; 0 means the window is a
/// placeholder with no device behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceType {
    Network = 1,
    Block = 2,
    Console = 3,
    Entropy = 4,
    Gpu = 16,
    Input = 18,
}

impl DeviceType {
    /// Decode the `DEVICE_ID` register.
    pub fn from_register(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Network),
            2 => Some(Self::Block),
            3 => Some(Self::Console),
            4 => Some(Self::Entropy),
            16 => Some(Self::Gpu),
            18 => Some(Self::Input),
            _ => None,
        }
    }
}

/// Typed accessors over a virtio-mmio register window.
///
/// This is a thin layer: one method per register, no sequencing logic.
/// Initialisation ordering and version-dependent register choice live in
/// [`crate::device::VirtioDevice`].
#[derive(Clone, Copy)]
pub struct VirtioMmio {
    region: MmioRegion,
}

impl VirtioMmio {
    /// Wrap an MMIO region as a virtio-mmio register window.
    ///
    /// The region must be at least `0x100` bytes; device configuration
    /// accessors additionally require it to cover `0x100 +` the config
    /// offsets read.
    pub const fn new(region: MmioRegion) -> Self {
        Self { region }
    }

    /// Read the magic value register.
    pub fn magic(&self) -> u32 {
        self.region.read32(regs::MAGIC)
    }

    /// Read the device version register.
    pub fn version(&self) -> u32 {
        self.region.read32(regs::VERSION)
    }

    /// Read the device type register.
    pub fn device_id(&self) -> u32 {
        self.region.read32(regs::DEVICE_ID)
    }

    /// Read the vendor ID register.
    pub fn vendor_id(&self) -> u32 {
        self.region.read32(regs::VENDOR_ID)
    }

    /// Read the device status register.
    pub fn device_status(&self) -> u32 {
        self.region.read32(regs::STATUS)
    }

    /// Write the device status register.
    pub fn set_device_status(&self, value: u32) {
        self.region.write32(regs::STATUS, value);
    }

    /// OR the given bits into the device status register.
    pub fn set_status_bits(&self, bits: u32) {
        self.region.set_bits32(regs::STATUS, bits);
    }

    /// Reset the device by writing 0 to the status register.
    pub fn reset(&self) {
        self.region.write32(regs::STATUS, 0);
    }

    /// Read one 32-bit word of the device feature bits.
    pub fn device_features(&self, select: u32) -> u32 {
        self.region.write32(regs::DEVICE_FEATURES_SEL, select);
        self.region.read32(regs::DEVICE_FEATURES)
    }

    /// Write one 32-bit word of the accepted driver feature bits.
    pub fn set_driver_features(&self, select: u32, value: u32) {
        self.region.write32(regs::DRIVER_FEATURES_SEL, select);
        self.region.write32(regs::DRIVER_FEATURES, value);
    }

    /// Tell a legacy device the guest page size.
    pub fn set_guest_page_size(&self, size: u32) {
        self.region.write32(regs::GUEST_PAGE_SIZE, size);
    }

    /// Select the queue the queue registers refer to.
    pub fn select_queue(&self, index: u32) {
        self.region.write32(regs::QUEUE_SEL, index);
    }

    /// Read the maximum size of the selected queue. 0 means the queue
    /// does not exist.
    pub fn queue_num_max(&self) -> u32 {
        self.region.read32(regs::QUEUE_NUM_MAX)
    }

    /// Write the size of the selected queue.
    pub fn set_queue_num(&self, size: u32) {
        self.region.write32(regs::QUEUE_NUM, size);
    }

    /// Write the used-ring alignment of the selected queue (legacy).
    pub fn set_queue_align(&self, align: u32) {
        self.region.write32(regs::QUEUE_ALIGN, align);
    }

    /// Write the page frame number of the selected queue (legacy).
    pub fn set_queue_pfn(&self, pfn: u32) {
        self.region.write32(regs::QUEUE_PFN, pfn);
    }

    /// Mark the selected queue ready (modern).
    pub fn set_queue_ready(&self, ready: bool) {
        self.region.write32(regs::QUEUE_READY, ready as u32);
    }

    /// Write the descriptor table address of the selected queue (modern).
    pub fn set_queue_desc(&self, addr: u64) {
        self.region.write32(regs::QUEUE_DESC_LOW, addr as u32);
        self.region.write32(regs::QUEUE_DESC_HIGH, (addr >> 32) as u32);
    }

    /// Write the available ring address of the selected queue (modern).
    pub fn set_queue_avail(&self, addr: u64) {
        self.region.write32(regs::QUEUE_AVAIL_LOW, addr as u32);
        self.region.write32(regs::QUEUE_AVAIL_HIGH, (addr >> 32) as u32);
    }

    /// Write the used ring address of the selected queue (modern).
    pub fn set_queue_used(&self, addr: u64) {
        self.region.write32(regs::QUEUE_USED_LOW, addr as u32);
        self.region.write32(regs::QUEUE_USED_HIGH, (addr >> 32) as u32);
    }

    /// Notify the device that a queue has new available buffers.
    pub fn queue_notify(&self, index: u32) {
        self.region.write32(regs::QUEUE_NOTIFY, index);
    }

    /// Read the pending interrupt causes.
    pub fn interrupt_status(&self) -> u32 {
        self.region.read32(regs::INTERRUPT_STATUS)
    }

    /// Acknowledge the given interrupt causes.
    pub fn interrupt_ack(&self, causes: u32) {
        self.region.write32(regs::INTERRUPT_ACK, causes);
    }

    /// Read the configuration space generation counter.
    pub fn config_generation(&self) -> u32 {
        self.region.read32(regs::CONFIG_GENERATION)
    }

    /// Read one byte of device configuration space.
    pub fn config_read8(&self, offset: usize) -> u8 {
        self.region.read8(regs::CONFIG + offset)
    }

    /// Read a 32-bit device configuration field.
    pub fn config_read32(&self, offset: usize) -> u32 {
        self.region.read32(regs::CONFIG + offset)
    }

    /// Read a 64-bit device configuration field as two 32-bit halves,
    /// low first. Callers wanting a torn-read guarantee wrap this in a
    /// generation-counter loop.
    pub fn config_read64(&self, offset: usize) -> u64 {
        let low = self.region.read32(regs::CONFIG + offset) as u64;
        let high = self.region.read32(regs::CONFIG + offset + 4) as u64;
        (high << 32) | low
    }
}

impl core::fmt::Debug for VirtioMmio {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtioMmio")
            .field("region", &self.region)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_identity_registers() {
        let mut page = RegPage::new();
        let region = page.region();
        region.write32(regs::MAGIC, MAGIC_VALUE);
        region.write32(regs::VERSION, 2);
        region.write32(regs::DEVICE_ID, 2);
        region.write32(regs::VENDOR_ID, 0x554d_4551);

        let mmio = VirtioMmio::new(region);
        assert_eq!(mmio.magic(), MAGIC_VALUE);
        assert_eq!(mmio.version(), 2);
        assert_eq!(mmio.device_id(), 2);
        assert_eq!(mmio.vendor_id(), 0x554d_4551);
    }

    #[test]
    fn test_status_accumulates_bits() {
        let mut page = RegPage::new();
        let mmio = VirtioMmio::new(page.region());

        mmio.set_status_bits(status::ACKNOWLEDGE);
        mmio.set_status_bits(status::DRIVER);
        assert_eq!(mmio.device_status(), status::ACKNOWLEDGE | status::DRIVER);

        mmio.reset();
        assert_eq!(mmio.device_status(), 0);
    }

    #[test]
    fn test_feature_word_selection() {
        let mut page = RegPage::new();
        let region = page.region();
        region.write32(regs::DEVICE_FEATURES, 0x0000_0001);

        let mmio = VirtioMmio::new(region);
        assert_eq!(mmio.device_features(1), 0x0000_0001);
        // Backing memory is passive, but the selector write must land.
        assert_eq!(region.read32(regs::DEVICE_FEATURES_SEL), 1);

        mmio.set_driver_features(1, 0x0000_0001);
        assert_eq!(region.read32(regs::DRIVER_FEATURES_SEL), 1);
        assert_eq!(region.read32(regs::DRIVER_FEATURES), 0x0000_0001);
    }

    #[test]
    fn test_queue_address_halves() {
        let mut page = RegPage::new();
        let region = page.region();
        let mmio = VirtioMmio::new(region);

        mmio.set_queue_desc(0x0000_0001_8000_4000);
        assert_eq!(region.read32(regs::QUEUE_DESC_LOW), 0x8000_4000);
        assert_eq!(region.read32(regs::QUEUE_DESC_HIGH), 0x0000_0001);

        mmio.set_queue_used(0x9000_0000);
        assert_eq!(region.read32(regs::QUEUE_USED_LOW), 0x9000_0000);
        assert_eq!(region.read32(regs::QUEUE_USED_HIGH), 0);
    }

    #[test]
    fn test_config_read64_combines_halves() {
        let mut page = RegPage::new();
        let region = page.region();
        region.write32(regs::CONFIG, 0x0000_2000); // capacity low
        region.write32(regs::CONFIG + 4, 0x0000_0001); // capacity high

        let mmio = VirtioMmio::new(region);
        assert_eq!(mmio.config_read64(0), 0x0000_0001_0000_2000);
        assert_eq!(mmio.config_read8(0), 0x00);
        assert_eq!(mmio.config_read8(1), 0x20);
    }

    #[test]
    fn test_version_and_type_decoding() {
        assert_eq!(MmioVersion::from_register(1), Some(MmioVersion::Legacy));
        assert_eq!(MmioVersion::from_register(2), Some(MmioVersion::Modern));
        assert_eq!(MmioVersion::from_register(0), None);
        assert_eq!(MmioVersion::from_register(3), None);

        assert_eq!(DeviceType::from_register(2), Some(DeviceType::Block));
        assert_eq!(DeviceType::from_register(16), Some(DeviceType::Gpu));
        assert_eq!(DeviceType::from_register(0), None);
        assert_eq!(DeviceType::from_register(7), None);
    }
}
