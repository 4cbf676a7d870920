//! VirtIO MMIO transport (modern, register layout v2).
//!
//! Register access for a virtio device exposed as an MMIO register block.
//! The transport handles the feature-word select protocol, the status
//! field, and queue programming; what to do with the feature bits it
//! reads is the probe layer's business.
//!
//! Register access goes through the [`RegisterIo`] seam so the probe flow
//! can be exercised against an in-memory register file.

use crate::features::{DeviceStatus, FeatureSet};

// ── Register offsets ────────────────────────────────────────────────
const MAGIC_VALUE: usize = 0x000;
const VERSION: usize = 0x004;
const DEVICE_ID: usize = 0x008;
const DEVICE_FEATURES: usize = 0x010;
const DEVICE_FEATURES_SEL: usize = 0x014;
const DRIVER_FEATURES: usize = 0x020;
const DRIVER_FEATURES_SEL: usize = 0x024;
const QUEUE_SEL: usize = 0x030;
const QUEUE_NUM_MAX: usize = 0x034;
const QUEUE_NUM: usize = 0x038;
const QUEUE_READY: usize = 0x044;
const QUEUE_NOTIFY: usize = 0x050;
const STATUS: usize = 0x070;
const QUEUE_DESC_LOW: usize = 0x080;
const QUEUE_DESC_HIGH: usize = 0x084;
const QUEUE_DRIVER_LOW: usize = 0x090;
const QUEUE_DRIVER_HIGH: usize = 0x094;
const QUEUE_DEVICE_LOW: usize = 0x0A0;
const QUEUE_DEVICE_HIGH: usize = 0x0A4;

// ── Magic and version ───────────────────────────────────────────────
const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976; // "virt"
const VIRTIO_MMIO_VERSION: u32 = 2; // Modern (non-legacy)

/// 32-bit register access, implemented by real MMIO and by the test
/// register file.
pub trait RegisterIo {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&mut self, offset: usize, value: u32);
}

impl<T: RegisterIo + ?Sized> RegisterIo for &mut T {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    #[inline]
    fn write32(&mut self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }
}

/// Volatile MMIO register access at a fixed base address.
pub struct MmioIo {
    base: usize,
}

impl MmioIo {
    /// # Safety
    /// - `base` must point to a virtio MMIO register block mapped
    ///   uncached for this guest
    /// - The block must remain mapped for the lifetime of the value
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

impl RegisterIo for MmioIo {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        let value = unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) };
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        value
    }

    #[inline]
    fn write32(&mut self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) };
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

/// Transport-level errors (device not usable as a virtio MMIO device).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Register block does not carry the virtio magic.
    BadMagic(u32),
    /// Device speaks a register layout this driver does not (legacy v1,
    /// or something newer).
    UnsupportedVersion(u32),
    /// Device ID 0: placeholder slot with no device behind it.
    NoDevice,
}

impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BadMagic(m) => write!(f, "bad virtio-mmio magic {:#x}", m),
            Self::UnsupportedVersion(v) => write!(f, "unsupported virtio-mmio version {}", v),
            Self::NoDevice => write!(f, "no device behind register block"),
        }
    }
}

/// VirtIO MMIO transport bound to one device's register block.
#[derive(Debug)]
pub struct MmioTransport<R: RegisterIo> {
    io: R,
    device_type: u32,
}

impl<R: RegisterIo> MmioTransport<R> {
    /// Validate the register block and bind to it.
    pub fn probe(io: R) -> Result<Self, TransportError> {
        let magic = io.read32(MAGIC_VALUE);
        if magic != VIRTIO_MMIO_MAGIC {
            return Err(TransportError::BadMagic(magic));
        }

        let version = io.read32(VERSION);
        if version != VIRTIO_MMIO_VERSION {
            return Err(TransportError::UnsupportedVersion(version));
        }

        let device_type = io.read32(DEVICE_ID);
        if device_type == 0 {
            return Err(TransportError::NoDevice);
        }

        Ok(Self { io, device_type })
    }

    /// Virtio device type (1 = net, 2 = block, ...).
    pub fn device_type(&self) -> u32 {
        self.device_type
    }

    /// Reset the device (status = 0).
    pub fn reset(&mut self) {
        self.io.write32(STATUS, 0);
    }

    /// Current device status.
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_truncate(self.io.read32(STATUS) as u8)
    }

    /// OR the given bits into the device status.
    pub fn add_status(&mut self, bits: DeviceStatus) {
        let current = self.io.read32(STATUS) as u8;
        self.io.write32(STATUS, (current | bits.bits()) as u32);
    }

    /// Read the device's full 64-bit feature word.
    pub fn read_device_features(&mut self) -> FeatureSet {
        self.io.write32(DEVICE_FEATURES_SEL, 0);
        let lo = self.io.read32(DEVICE_FEATURES);
        self.io.write32(DEVICE_FEATURES_SEL, 1);
        let hi = self.io.read32(DEVICE_FEATURES);
        FeatureSet::from_words(lo, hi)
    }

    /// Write the driver-acknowledged feature word.
    pub fn write_driver_features(&mut self, features: FeatureSet) {
        let (lo, hi) = features.words();
        self.io.write32(DRIVER_FEATURES_SEL, 0);
        self.io.write32(DRIVER_FEATURES, lo);
        self.io.write32(DRIVER_FEATURES_SEL, 1);
        self.io.write32(DRIVER_FEATURES, hi);
    }

    /// Maximum queue size the device supports for the given queue.
    ///
    /// Zero means the queue does not exist.
    pub fn queue_max_size(&mut self, queue: u16) -> u16 {
        self.io.write32(QUEUE_SEL, queue as u32);
        self.io.read32(QUEUE_NUM_MAX) as u16
    }

    /// Program a queue's size and ring addresses, then mark it ready.
    pub fn setup_queue(&mut self, queue: u16, size: u16, desc: u64, avail: u64, used: u64) {
        self.io.write32(QUEUE_SEL, queue as u32);
        self.io.write32(QUEUE_NUM, size as u32);
        self.io.write32(QUEUE_DESC_LOW, desc as u32);
        self.io.write32(QUEUE_DESC_HIGH, (desc >> 32) as u32);
        self.io.write32(QUEUE_DRIVER_LOW, avail as u32);
        self.io.write32(QUEUE_DRIVER_HIGH, (avail >> 32) as u32);
        self.io.write32(QUEUE_DEVICE_LOW, used as u32);
        self.io.write32(QUEUE_DEVICE_HIGH, (used >> 32) as u32);
        self.io.write32(QUEUE_READY, 1);
    }

    /// Notify the device that a queue has new buffers.
    pub fn notify(&mut self, queue: u16) {
        self.io.write32(QUEUE_NOTIFY, queue as u32);
    }
}
