//! Device probe and attach flow.
//!
//! Scans PCI for virtio functions and drives each one from reset to
//! DRIVER_OK. The restricted-memory policy gates the flow: a rejected
//! device is marked FAILED and never reaches feature acknowledgement,
//! and the resolved DMA addressing mode decides how the device's
//! virtqueue memory is translated.
//!
//! # Attach sequence
//! 1. Validate transport (magic, version, device present)
//! 2. Reset device
//! 3. Set ACKNOWLEDGE, DRIVER
//! 4. Read device features
//! 5. Policy check (abort here on rejection)
//! 6. Resolve DMA addressing mode
//! 7. Write driver features, set FEATURES_OK, verify
//! 8. Carve and program virtqueue memory
//! 9. Set DRIVER_OK, record audit verdict

use cocoon_hwinit::MemoryAccessMode;
use dma_pool::{BusTranslation, DmaError, DmaPool};

use crate::features::{self, DeviceStatus, FeatureSet};
use crate::pci::config::command;
use crate::pci::{offset, pci_cfg_read16, pci_cfg_read32, pci_cfg_write16, PciAddr};
use crate::policy::{self, AttachmentVerdict, DmaAddressingMode};
use crate::queue::QueueRegion;
use crate::registry::{attach_log, AttachRecord, VerdictKind};
use crate::transport::{MmioIo, MmioTransport, RegisterIo, TransportError};

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

/// VirtIO vendor ID.
pub const VIRTIO_VENDOR_ID: u16 = 0x1AF4;
/// First virtio PCI device ID (transitional range starts here).
const VIRTIO_PCI_DEVICE_MIN: u16 = 0x1000;
/// Last virtio PCI device ID.
const VIRTIO_PCI_DEVICE_MAX: u16 = 0x107F;

/// Human-readable virtio device type, for diagnostics.
pub fn device_type_name(device_type: u32) -> &'static str {
    match device_type {
        1 => "net",
        2 => "block",
        3 => "console",
        4 => "entropy",
        9 => "9p",
        16 => "gpu",
        _ => "unknown",
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PROBE ERRORS
// ═══════════════════════════════════════════════════════════════════════════

/// Probe and attach errors.
///
/// `IncompatibleDevice` is the policy rejection, distinguishable from
/// transport and resource failures so the caller can report "device
/// unavailable" without tearing anything else down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeError {
    /// Register block is not a usable virtio device.
    Transport(TransportError),
    /// Rejected by the restricted-memory compatibility check.
    IncompatibleDevice(&'static str),
    /// Device refused the negotiated feature set.
    FeaturesRejected,
    /// Device exposes no usable virtqueue.
    QueueUnavailable,
    /// Virtqueue memory could not be allocated.
    Dma(DmaError),
}

impl From<TransportError> for ProbeError {
    fn from(e: TransportError) -> Self {
        ProbeError::Transport(e)
    }
}

impl From<DmaError> for ProbeError {
    fn from(e: DmaError) -> Self {
        ProbeError::Dma(e)
    }
}

impl core::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport: {}", e),
            Self::IncompatibleDevice(reason) => write!(f, "device unavailable: {}", reason),
            Self::FeaturesRejected => write!(f, "device rejected negotiated features"),
            Self::QueueUnavailable => write!(f, "device exposes no virtqueue"),
            Self::Dma(e) => write!(f, "virtqueue memory: {}", e),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

/// Probe-time configuration, shared by all devices.
#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    /// Virtqueue size to request (clamped to the device maximum).
    pub queue_size: u16,
    /// Base bus address of the platform translation window, used for
    /// devices resolved to platform-mediated DMA. Zero places the window
    /// at the bottom of bus space.
    pub iommu_window: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            queue_size: 32,
            iommu_window: 0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DETECTED DEVICE INFO
// ═══════════════════════════════════════════════════════════════════════════

/// A virtio PCI function found by [`scan`], not yet attached.
#[derive(Debug, Clone, Copy)]
pub struct VirtioCandidate {
    pub addr: PciAddr,
    pub pci_device_id: u16,
    pub mmio_base: u64,
}

impl VirtioCandidate {
    /// Placeholder for scan result arrays.
    pub const EMPTY: VirtioCandidate = VirtioCandidate {
        addr: PciAddr::new(0, 0, 0),
        pci_device_id: 0,
        mmio_base: 0,
    };
}

// ═══════════════════════════════════════════════════════════════════════════
// PCI SCANNING
// ═══════════════════════════════════════════════════════════════════════════

/// Scan the PCI bus for virtio functions.
///
/// Fills `found` in discovery order and returns the number of candidates
/// written; stops early when the slice is full.
pub fn scan(found: &mut [VirtioCandidate]) -> usize {
    let mut count = 0usize;

    for bus in 0..=255u8 {
        for device in 0..32u8 {
            for function in 0..8u8 {
                if count == found.len() {
                    return count;
                }
                let addr = PciAddr::new(bus, device, function);

                let vendor_id = pci_cfg_read16(addr, offset::VENDOR_ID);
                if vendor_id == 0xFFFF {
                    if function == 0 {
                        break;
                    }
                    continue;
                }

                if function == 0 {
                    let header = pci_cfg_read16(addr, offset::HEADER_TYPE) & 0x80;
                    if vendor_id != VIRTIO_VENDOR_ID && header == 0 {
                        break;
                    }
                }
                if vendor_id != VIRTIO_VENDOR_ID {
                    continue;
                }

                let device_id = pci_cfg_read16(addr, offset::DEVICE_ID);
                if !(VIRTIO_PCI_DEVICE_MIN..=VIRTIO_PCI_DEVICE_MAX).contains(&device_id) {
                    continue;
                }

                let Some(mmio_base) = read_bar0(addr) else {
                    continue;
                };

                found[count] = VirtioCandidate {
                    addr,
                    pci_device_id: device_id,
                    mmio_base,
                };
                count += 1;
            }
        }
    }

    count
}

fn read_bar0(addr: PciAddr) -> Option<u64> {
    let bar0 = pci_cfg_read32(addr, offset::BAR0);
    let bar1 = pci_cfg_read32(addr, offset::BAR1);
    decode_mmio_bar(bar0, bar1)
}

/// Decode a BAR pair into an MMIO base. Returns `None` for I/O BARs and
/// unassigned BARs.
fn decode_mmio_bar(bar0: u32, bar1: u32) -> Option<u64> {
    if bar0 & 0x01 != 0 {
        // I/O BAR - need MMIO
        return None;
    }

    let is_64bit = (bar0 & 0x06) == 0x04;
    let base = if is_64bit {
        ((bar1 as u64) << 32) | ((bar0 & 0xFFFF_FFF0) as u64)
    } else {
        (bar0 & 0xFFFF_FFF0) as u64
    };

    if base == 0 {
        None
    } else {
        Some(base)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ATTACH FLOW
// ═══════════════════════════════════════════════════════════════════════════

/// A device that passed the compatibility check and reached DRIVER_OK.
///
/// Holds the transport for the device's lifetime; the DMA addressing
/// mode and queue region are fixed at attach time and never revisited.
#[derive(Debug)]
pub struct AttachedDevice<R: RegisterIo> {
    transport: MmioTransport<R>,
    addr: PciAddr,
    advertised: FeatureSet,
    negotiated: FeatureSet,
    dma_mode: DmaAddressingMode,
    queue: QueueRegion,
}

impl<R: RegisterIo> AttachedDevice<R> {
    pub fn addr(&self) -> PciAddr {
        self.addr
    }

    /// Virtio device type (1 = net, 2 = block, ...).
    pub fn device_type(&self) -> u32 {
        self.transport.device_type()
    }

    /// Features the device advertised before negotiation.
    pub fn advertised(&self) -> FeatureSet {
        self.advertised
    }

    /// Features acknowledged to the device.
    pub fn features(&self) -> FeatureSet {
        self.negotiated
    }

    /// DMA addressing mode, fixed for the device's lifetime.
    pub fn dma_mode(&self) -> DmaAddressingMode {
        self.dma_mode
    }

    pub fn queue(&self) -> &QueueRegion {
        &self.queue
    }

    pub fn transport(&self) -> &MmioTransport<R> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut MmioTransport<R> {
        &mut self.transport
    }
}

/// Drive one device through the attach sequence.
///
/// `mode` is the guest's memory-access mode, passed in explicitly so the
/// flow stays a pure function of its inputs (the boot-time cell is read
/// by the caller, typically via `cocoon_hwinit::memmode::current`).
pub fn probe_device<R: RegisterIo>(
    addr: PciAddr,
    io: R,
    mode: MemoryAccessMode,
    pool: &DmaPool,
    config: &ProbeConfig,
) -> Result<AttachedDevice<R>, ProbeError> {
    let mut transport = MmioTransport::probe(io)?;
    let device_type = transport.device_type();

    transport.reset();
    transport.add_status(DeviceStatus::ACKNOWLEDGE);
    transport.add_status(DeviceStatus::DRIVER);

    let advertised = transport.read_device_features();
    let dma_mode = policy::resolve_dma_mode(advertised);

    let verdict = match policy::check(addr, advertised, mode) {
        AttachmentVerdict::Proceed => VerdictKind::Clean,
        AttachmentVerdict::ProceedWithWarning(_) => VerdictKind::Warned,
        AttachmentVerdict::Reject(reason) => {
            transport.add_status(DeviceStatus::FAILED);
            attach_log().record(AttachRecord {
                addr,
                device_type,
                features: advertised,
                verdict: VerdictKind::Rejected,
                dma_mode,
            });
            return Err(ProbeError::IncompatibleDevice(reason));
        }
    };

    let mut negotiated = advertised.intersection(features::driver_supported());
    if !advertised.contains(FeatureSet::VERSION_1) {
        // Pre-VERSION_1 devices negotiate only the legacy 32-bit word.
        negotiated = FeatureSet::from_bits_retain(negotiated.bits() & 0xFFFF_FFFF);
    }
    transport.write_driver_features(negotiated);

    transport.add_status(DeviceStatus::FEATURES_OK);
    if !transport.status().contains(DeviceStatus::FEATURES_OK) {
        transport.add_status(DeviceStatus::FAILED);
        return Err(ProbeError::FeaturesRejected);
    }

    let translation = match dma_mode {
        DmaAddressingMode::LegacyDirect => BusTranslation::Identity,
        DmaAddressingMode::PlatformMediated => BusTranslation::Offset(config.iommu_window),
    };

    let queue_max = transport.queue_max_size(0);
    if queue_max == 0 {
        transport.add_status(DeviceStatus::FAILED);
        return Err(ProbeError::QueueUnavailable);
    }
    let queue_size = queue_max.min(config.queue_size);
    let queue = QueueRegion::carve(pool, translation, queue_size)?;
    transport.setup_queue(
        0,
        queue_size,
        queue.desc_bus(),
        queue.avail_bus(),
        queue.used_bus(),
    );

    transport.add_status(DeviceStatus::DRIVER_OK);

    attach_log().record(AttachRecord {
        addr,
        device_type,
        features: advertised,
        verdict,
        dma_mode,
    });

    log::info!(
        "{}: attached virtio-{} queue={} dma={:?}",
        addr,
        device_type_name(device_type),
        queue_size,
        dma_mode,
    );

    Ok(AttachedDevice {
        transport,
        addr,
        advertised,
        negotiated,
        dma_mode,
        queue,
    })
}

/// Enable and attach a scanned candidate.
///
/// # Safety
/// - `cand.mmio_base` must be the device's live register block, mapped
///   for this guest
/// - The DMA pool must hand out memory the device may reach
pub unsafe fn attach_candidate(
    cand: &VirtioCandidate,
    mode: MemoryAccessMode,
    pool: &DmaPool,
    config: &ProbeConfig,
) -> Result<AttachedDevice<MmioIo>, ProbeError> {
    // Enable memory decoding and bus mastering before touching BAR0.
    let cmd = pci_cfg_read16(cand.addr, offset::COMMAND);
    pci_cfg_write16(
        cand.addr,
        offset::COMMAND,
        cmd | command::MEM_SPACE | command::BUS_MASTER,
    );

    let io = MmioIo::new(cand.mmio_base as usize);
    probe_device(cand.addr, io, mode, pool, config)
}

/// Most virtio functions a single machine is expected to expose.
const MAX_CANDIDATES: usize = 16;

/// Scan the bus and attach every compatible virtio device.
///
/// Judges devices against the boot-pinned memory access mode. Devices
/// that are rejected or fail mid-attach are logged and skipped; `out`
/// receives the attached handles in discovery order. Returns the number
/// attached.
///
/// # Safety
/// - Same requirements as [`attach_candidate`], for every device the
///   scan discovers
/// - `cocoon_hwinit::memmode` must be pinned before calling
pub unsafe fn scan_and_attach(
    pool: &DmaPool,
    config: &ProbeConfig,
    out: &mut [Option<AttachedDevice<MmioIo>>],
) -> usize {
    let mode = cocoon_hwinit::memmode::current();

    let mut candidates = [VirtioCandidate::EMPTY; MAX_CANDIDATES];
    let found = scan(&mut candidates);

    let mut attached = 0usize;
    for cand in &candidates[..found] {
        if attached == out.len() {
            break;
        }
        match attach_candidate(cand, mode, pool, config) {
            Ok(device) => {
                out[attached] = Some(device);
                attached += 1;
            }
            Err(e) => {
                log::warn!("{}: not attached: {}", cand.addr, e);
            }
        }
    }

    attached
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{MSG_NO_ACCESS_PLATFORM, MSG_NO_VERSION_1};
    use crate::testutil::FakeRegs;
    use dma_pool::MIN_REGION_SIZE;

    const DEV: PciAddr = PciAddr::new(0, 3, 0);

    macro_rules! test_pool {
        () => {{
            #[repr(C, align(4096))]
            struct TestStorage {
                data: [u8; MIN_REGION_SIZE],
            }
            static mut STORAGE: TestStorage = TestStorage {
                data: [0; MIN_REGION_SIZE],
            };
            let pool = DmaPool::new();
            let base = unsafe { core::ptr::addr_of_mut!(STORAGE) as usize };
            unsafe { pool.init_external(base, MIN_REGION_SIZE).unwrap() };
            pool
        }};
    }

    #[test]
    fn test_modern_device_attaches_mediated() {
        let pool = test_pool!();
        let config = ProbeConfig {
            queue_size: 64,
            iommu_window: 0x8000_0000,
        };
        let mut regs = FakeRegs::new(
            1,
            FeatureSet::VERSION_1 | FeatureSet::ACCESS_PLATFORM | FeatureSet::RING_PACKED,
        );

        {
            let device = probe_device(
                DEV,
                &mut regs,
                MemoryAccessMode::Restricted,
                &pool,
                &config,
            )
            .unwrap();

            assert_eq!(device.dma_mode(), DmaAddressingMode::PlatformMediated);
            assert_eq!(device.device_type(), 1);
            // RING_PACKED is offered but not acknowledged.
            assert!(device.advertised().contains(FeatureSet::RING_PACKED));
            assert!(!device.features().contains(FeatureSet::RING_PACKED));
            assert!(device.features().contains(FeatureSet::VERSION_1));
            assert!(device
                .transport()
                .status()
                .contains(DeviceStatus::DRIVER_OK | DeviceStatus::FEATURES_OK));

            // Queue addresses the device sees sit inside the IOMMU window.
            let q = device.queue();
            assert_eq!(
                q.desc_bus(),
                config.iommu_window + q.region().cpu_base() as u64
            );
        }

        // Device-side registers were programmed to match.
        assert_eq!(regs.queue_num, 64);
        assert_ne!(regs.queue_desc, 0);
        assert_eq!(regs.queue_ready, 1);
        assert_eq!(
            regs.driver_features & FeatureSet::RING_PACKED.bits(),
            0
        );
    }

    #[test]
    fn test_modern_without_access_platform_rejected() {
        let pool = test_pool!();
        let config = ProbeConfig::default();
        let mut regs = FakeRegs::new(1, FeatureSet::VERSION_1);

        let err = probe_device(
            DEV,
            &mut regs,
            MemoryAccessMode::Restricted,
            &pool,
            &config,
        )
        .unwrap_err();

        assert_eq!(err, ProbeError::IncompatibleDevice(MSG_NO_ACCESS_PLATFORM));
        // Device marked FAILED, never acknowledged features.
        assert_ne!(regs.status & DeviceStatus::FAILED.bits() as u32, 0);
        assert_eq!(regs.status & DeviceStatus::FEATURES_OK.bits() as u32, 0);
        assert_eq!(regs.driver_features, 0);
        assert_eq!(regs.queue_ready, 0);
    }

    #[test]
    fn test_legacy_device_attaches_direct_with_warning() {
        let pool = test_pool!();
        // Window configured, but a legacy device must not be put behind it.
        let config = ProbeConfig {
            queue_size: 32,
            iommu_window: 0x8000_0000,
        };
        let mut regs = FakeRegs::new(2, FeatureSet::ACCESS_PLATFORM);

        let device = probe_device(
            DEV,
            &mut regs,
            MemoryAccessMode::Restricted,
            &pool,
            &config,
        )
        .unwrap();

        assert_eq!(device.dma_mode(), DmaAddressingMode::LegacyDirect);
        // The legacy word is all the device gets acknowledged.
        assert!(!device.features().contains(FeatureSet::ACCESS_PLATFORM));
        let q = device.queue();
        assert_eq!(q.desc_bus(), q.region().cpu_base() as u64);
    }

    #[test]
    fn test_unrestricted_attaches_anything() {
        let pool = test_pool!();
        let config = ProbeConfig::default();
        let mut regs = FakeRegs::new(1, FeatureSet::empty());

        let device = probe_device(
            DEV,
            &mut regs,
            MemoryAccessMode::Unrestricted,
            &pool,
            &config,
        )
        .unwrap();
        assert_eq!(device.dma_mode(), DmaAddressingMode::LegacyDirect);
    }

    #[test]
    fn test_device_refusing_features_fails() {
        let pool = test_pool!();
        let config = ProbeConfig::default();
        let mut regs = FakeRegs::new(
            1,
            FeatureSet::VERSION_1 | FeatureSet::ACCESS_PLATFORM,
        );
        regs.features_ok_honored = false;

        let err = probe_device(
            DEV,
            &mut regs,
            MemoryAccessMode::Restricted,
            &pool,
            &config,
        )
        .unwrap_err();
        assert_eq!(err, ProbeError::FeaturesRejected);
        assert_ne!(regs.status & DeviceStatus::FAILED.bits() as u32, 0);
    }

    #[test]
    fn test_device_without_queue_fails() {
        let pool = test_pool!();
        let config = ProbeConfig::default();
        let mut regs = FakeRegs::new(
            1,
            FeatureSet::VERSION_1 | FeatureSet::ACCESS_PLATFORM,
        );
        regs.queue_num_max = 0;

        let err = probe_device(
            DEV,
            &mut regs,
            MemoryAccessMode::Restricted,
            &pool,
            &config,
        )
        .unwrap_err();
        assert_eq!(err, ProbeError::QueueUnavailable);
    }

    #[test]
    fn test_queue_size_clamped_to_device_max() {
        let pool = test_pool!();
        let config = ProbeConfig {
            queue_size: 256,
            iommu_window: 0,
        };
        let mut regs = FakeRegs::new(
            1,
            FeatureSet::VERSION_1 | FeatureSet::ACCESS_PLATFORM,
        );
        regs.queue_num_max = 16;

        let device = probe_device(
            DEV,
            &mut regs,
            MemoryAccessMode::Restricted,
            &pool,
            &config,
        )
        .unwrap();
        assert_eq!(device.queue().layout().queue_size(), 16);
    }

    #[test]
    fn test_bar_decoding() {
        // I/O BAR is unusable.
        assert_eq!(decode_mmio_bar(0xC001, 0), None);
        // 32-bit MMIO BAR.
        assert_eq!(decode_mmio_bar(0xFEBD_0000, 0xFFFF), Some(0xFEBD_0000));
        // 64-bit MMIO BAR spans both registers.
        assert_eq!(
            decode_mmio_bar(0xFE00_000C, 0x0000_0008),
            Some(0x8_FE00_0000)
        );
        // Unassigned BAR.
        assert_eq!(decode_mmio_bar(0, 0), None);
    }

    #[test]
    fn test_probe_error_display_is_distinguishable() {
        use core::fmt::Write;

        struct Buf {
            data: [u8; 128],
            len: usize,
        }
        impl Write for Buf {
            fn write_str(&mut self, s: &str) -> core::fmt::Result {
                let bytes = s.as_bytes();
                self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
                self.len += bytes.len();
                Ok(())
            }
        }

        let mut buf = Buf {
            data: [0; 128],
            len: 0,
        };
        let err = ProbeError::IncompatibleDevice(MSG_NO_VERSION_1);
        write!(buf, "{}", err).unwrap();
        let text = core::str::from_utf8(&buf.data[..buf.len]).unwrap();
        assert!(text.starts_with("device unavailable:"));
    }
}
