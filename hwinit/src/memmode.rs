//! Guest Memory-Access-Mode Detection
//!
//! Whether this guest runs with restricted memory access (memory
//! encryption / confidential computing) is decided once at boot and never
//! changes. Device probes read the mode to judge feature compatibility;
//! they must never re-detect it.
//!
//! # Detection
//!
//! On x86_64 the AMD memory-encryption leaf is consulted: CPUID
//! `0x8000_001F` EAX reports SEV capability, and the `SEV_STATUS` MSR
//! (`0xC001_0131`) bit 0 reports whether SEV is actually enabled for this
//! guest. Anything short of "enabled" is treated as unrestricted. Other
//! architectures report unrestricted.
//!
//! Platforms with out-of-band knowledge (e.g., measured boot parameters)
//! can skip detection and pin the mode with [`init`].

use spin::Once;

/// CPUID leaf for AMD memory encryption capabilities.
#[cfg(target_arch = "x86_64")]
const CPUID_MEM_ENCRYPT: u32 = 0x8000_001F;

/// EAX bit 1: SEV supported.
#[cfg(target_arch = "x86_64")]
const CPUID_SEV_SUPPORTED: u32 = 1 << 1;

/// MSR reporting the active SEV state for this guest.
#[cfg(target_arch = "x86_64")]
const MSR_SEV_STATUS: u32 = 0xC001_0131;

/// SEV_STATUS bit 0: SEV enabled.
#[cfg(target_arch = "x86_64")]
const SEV_STATUS_ENABLED: u64 = 1;

/// Guest-wide memory access restriction state.
///
/// Fixed at boot; read-only for the rest of the guest's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccessMode {
    /// Device DMA may reach guest memory without platform mediation.
    Unrestricted,
    /// Guest memory is protected; unmediated device access is withheld.
    Restricted,
}

impl MemoryAccessMode {
    /// True when memory access restriction is active.
    #[inline]
    pub const fn is_restricted(self) -> bool {
        matches!(self, MemoryAccessMode::Restricted)
    }

    /// Human-readable name for diagnostics.
    pub const fn as_str(self) -> &'static str {
        match self {
            MemoryAccessMode::Unrestricted => "unrestricted",
            MemoryAccessMode::Restricted => "restricted",
        }
    }
}

static MODE: Once<MemoryAccessMode> = Once::new();

/// Pin the memory access mode from boot configuration.
///
/// First caller wins; returns the effective mode. Use this when the boot
/// environment already knows the answer, otherwise use [`init_detected`].
pub fn init(mode: MemoryAccessMode) -> MemoryAccessMode {
    *MODE.call_once(|| mode)
}

/// Detect and pin the memory access mode.
///
/// Returns the effective mode (which may come from an earlier `init`).
///
/// # Safety
///
/// Must run at CPL0: detection reads the `SEV_STATUS` MSR. Call once at
/// boot, before any device probing.
pub unsafe fn init_detected() -> MemoryAccessMode {
    let detected = detect();
    init(detected)
}

/// The pinned memory access mode.
///
/// # Panics
///
/// Panics if called before [`init`] / [`init_detected`]; probing before
/// the mode is fixed would silently skip the compatibility checks.
pub fn current() -> MemoryAccessMode {
    *MODE
        .get()
        .expect("BUG: memory access mode queried before init")
}

/// True once the mode has been pinned.
pub fn is_initialized() -> bool {
    MODE.get().is_some()
}

/// Detect restriction from the hardware.
///
/// # Safety
///
/// Must run at CPL0 (reads an MSR).
#[cfg(target_arch = "x86_64")]
unsafe fn detect() -> MemoryAccessMode {
    use core::arch::x86_64::__cpuid;

    let max_extended = __cpuid(0x8000_0000).eax;
    if max_extended < CPUID_MEM_ENCRYPT {
        return MemoryAccessMode::Unrestricted;
    }

    let leaf = __cpuid(CPUID_MEM_ENCRYPT);
    if leaf.eax & CPUID_SEV_SUPPORTED == 0 {
        return MemoryAccessMode::Unrestricted;
    }

    if rdmsr(MSR_SEV_STATUS) & SEV_STATUS_ENABLED != 0 {
        MemoryAccessMode::Restricted
    } else {
        MemoryAccessMode::Unrestricted
    }
}

/// Stub for non-x86_64 targets.
#[cfg(not(target_arch = "x86_64"))]
unsafe fn detect() -> MemoryAccessMode {
    MemoryAccessMode::Unrestricted
}

/// Read an MSR.
///
/// # Safety
///
/// CPL0 only; the MSR must exist (guarded by CPUID above).
#[cfg(target_arch = "x86_64")]
#[inline]
unsafe fn rdmsr(msr: u32) -> u64 {
    let lo: u32;
    let hi: u32;
    core::arch::asm!(
        "rdmsr",
        in("ecx") msr,
        out("eax") lo,
        out("edx") hi,
        options(nostack, preserves_flags)
    );
    ((hi as u64) << 32) | lo as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_predicates() {
        assert!(MemoryAccessMode::Restricted.is_restricted());
        assert!(!MemoryAccessMode::Unrestricted.is_restricted());
        assert_eq!(MemoryAccessMode::Restricted.as_str(), "restricted");
    }

    #[test]
    fn test_init_first_caller_wins() {
        // The cell is process-global; both calls land on the same value.
        let first = init(MemoryAccessMode::Restricted);
        let second = init(MemoryAccessMode::Unrestricted);
        assert_eq!(first, second);
        assert_eq!(current(), first);
        assert!(is_initialized());
    }
}
