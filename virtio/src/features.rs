//! VirtIO feature bits and device status field.
//!
//! Only the reserved (device-independent) feature word is modeled here;
//! device-class bits stay opaque inside [`FeatureSet`] and pass through
//! negotiation untouched.
//!
//! # Reference
//! VirtIO Spec 1.2 §2.1 (status), §6 (reserved feature bits)

use bitflags::bitflags;

bitflags! {
    /// Reserved virtio feature bits, as advertised in the device's 64-bit
    /// feature word.
    ///
    /// Immutable once read from the transport; the probe policy only ever
    /// inspects it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureSet: u64 {
        /// Driver may use indirect descriptors.
        const INDIRECT_DESC = 1 << 28;
        /// used_event / avail_event fields are honored.
        const EVENT_IDX = 1 << 29;
        /// Device complies with the modern (v1.0+) protocol generation.
        const VERSION_1 = 1 << 32;
        /// Device addresses memory through the platform's DMA translation
        /// (IOMMU / encryption aware) instead of raw physical addresses.
        const ACCESS_PLATFORM = 1 << 33;
        /// Packed virtqueue layout support.
        const RING_PACKED = 1 << 34;
        /// Device uses buffers in the order they were made available.
        const IN_ORDER = 1 << 35;
        /// Memory ordering is as described by the platform, not SMP rules.
        const ORDER_PLATFORM = 1 << 36;

        // Device-class bits (bits 0..24) are retained but not named here.
        const _ = !0;
    }
}

impl FeatureSet {
    /// Assemble from the two 32-bit feature words the transport exposes.
    #[inline]
    pub const fn from_words(lo: u32, hi: u32) -> Self {
        Self::from_bits_retain(((hi as u64) << 32) | lo as u64)
    }

    /// Split into (lo, hi) 32-bit words for the transport.
    #[inline]
    pub const fn words(self) -> (u32, u32) {
        let bits = self.bits();
        (bits as u32, (bits >> 32) as u32)
    }
}

/// Feature bits this driver understands and will acknowledge.
///
/// Everything else a device offers is dropped during negotiation.
pub fn driver_supported() -> FeatureSet {
    FeatureSet::VERSION_1
        .union(FeatureSet::ACCESS_PLATFORM)
        .union(FeatureSet::INDIRECT_DESC)
}

bitflags! {
    /// Device status field, written step-by-step during initialization.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        /// Guest has found the device.
        const ACKNOWLEDGE = 1;
        /// Guest knows how to drive the device.
        const DRIVER = 2;
        /// Driver is ready.
        const DRIVER_OK = 4;
        /// Feature negotiation is complete.
        const FEATURES_OK = 8;
        /// Device hit an unrecoverable error.
        const DEVICE_NEEDS_RESET = 64;
        /// Guest has given up on the device.
        const FAILED = 128;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_round_trip() {
        let f = FeatureSet::VERSION_1 | FeatureSet::ACCESS_PLATFORM;
        let (lo, hi) = f.words();
        assert_eq!(lo, 0);
        assert_eq!(hi, 0b11);
        assert_eq!(FeatureSet::from_words(lo, hi), f);
    }

    #[test]
    fn test_device_class_bits_survive() {
        // VIRTIO_NET_F_MAC (bit 5) is not named but must round-trip.
        let f = FeatureSet::from_words(1 << 5, 1);
        assert!(f.contains(FeatureSet::VERSION_1));
        assert_eq!(f.bits() & (1 << 5), 1 << 5);
    }

    #[test]
    fn test_driver_supported_is_modern() {
        let s = driver_supported();
        assert!(s.contains(FeatureSet::VERSION_1));
        assert!(s.contains(FeatureSet::ACCESS_PLATFORM));
        assert!(!s.contains(FeatureSet::RING_PACKED));
    }
}
