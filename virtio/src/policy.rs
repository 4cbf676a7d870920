//! Restricted-memory probe policy.
//!
//! Two decisions, made once per device at attach time:
//!
//! - [`check`]: may this device attach at all, given what it advertises
//!   and the guest's memory-access mode?
//! - [`resolve_dma_mode`]: must the device's DMA path be platform-mediated,
//!   or does it use legacy direct physical addressing?
//!
//! Both are pure functions of their inputs; the memory-access mode is
//! passed in explicitly rather than read from the global cell, so the
//! decisions are independently testable. The only side effect is the
//! mandatory diagnostic on the warn/reject paths.
//!
//! The two functions must stay aligned on one point: a device without
//! `VERSION_1` is judged by that absence alone. `check` warns and lets it
//! through; `resolve_dma_mode` pins it to legacy direct addressing no
//! matter what else it claims.

use cocoon_hwinit::MemoryAccessMode;
use log::{error, warn};

use crate::features::FeatureSet;
use crate::pci::PciAddr;

/// Diagnostic for the pre-VERSION_1 relaxation path.
pub const MSG_NO_VERSION_1: &str =
    "device does not advertise VIRTIO_F_VERSION_1; continuing with restricted memory access";

/// Diagnostic for the mandatory platform-mediation rejection.
pub const MSG_NO_ACCESS_PLATFORM: &str = "device must advertise VIRTIO_F_ACCESS_PLATFORM";

/// Outcome of the feature compatibility check.
///
/// Consumed immediately by the probe flow; the reason strings also land
/// in the attach registry for post-hoc audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentVerdict {
    /// Device is fully compatible.
    Proceed,
    /// Device attaches despite a compatibility gap; the diagnostic has
    /// already been emitted.
    ProceedWithWarning(&'static str),
    /// Device must not attach.
    Reject(&'static str),
}

impl AttachmentVerdict {
    /// True when attachment must be aborted.
    #[inline]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, AttachmentVerdict::Reject(_))
    }
}

/// DMA addressing behavior for a device's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaAddressingMode {
    /// Device issues raw guest-physical addresses (legacy quirk).
    LegacyDirect,
    /// Device addresses are translated by the platform (IOMMU path).
    PlatformMediated,
}

/// Feature compatibility check, run during probe before any feature is
/// acknowledged.
///
/// With unrestricted memory access the check is a no-op. Under
/// restriction:
///
/// 1. A device without `VERSION_1` is allowed through with a mandatory
///    warning. Known-safe legacy devices must stay usable; the warning
///    (and the audit record the caller writes) keeps the relaxation
///    observable rather than silent.
/// 2. A modern device without `ACCESS_PLATFORM` claims direct access to
///    protected memory and is rejected.
///
/// The branches are mutually exclusive: a pre-`VERSION_1` device is never
/// additionally judged against `ACCESS_PLATFORM`.
pub fn check(device: PciAddr, features: FeatureSet, mode: MemoryAccessMode) -> AttachmentVerdict {
    if !mode.is_restricted() {
        return AttachmentVerdict::Proceed;
    }

    if !features.contains(FeatureSet::VERSION_1) {
        warn!("{}: {}", device, MSG_NO_VERSION_1);
        return AttachmentVerdict::ProceedWithWarning(MSG_NO_VERSION_1);
    }

    if !features.contains(FeatureSet::ACCESS_PLATFORM) {
        error!("{}: {}", device, MSG_NO_ACCESS_PLATFORM);
        return AttachmentVerdict::Reject(MSG_NO_ACCESS_PLATFORM);
    }

    AttachmentVerdict::Proceed
}

/// Legacy DMA quirk resolution.
///
/// A device that never negotiated the modern protocol generation cannot
/// be assumed to understand platform-mediated addressing, so `VERSION_1`
/// absence dominates: such a device is always `LegacyDirect`, regardless
/// of its other bits.
pub fn resolve_dma_mode(features: FeatureSet) -> DmaAddressingMode {
    if !features.contains(FeatureSet::VERSION_1) {
        return DmaAddressingMode::LegacyDirect;
    }

    if features.contains(FeatureSet::ACCESS_PLATFORM) {
        DmaAddressingMode::PlatformMediated
    } else {
        DmaAddressingMode::LegacyDirect
    }
}
