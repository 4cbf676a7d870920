//! Firmware-agnostic DMA memory pool allocator.
//!
//! This crate provides the DMA memory that device drivers hand to hardware,
//! together with the translation from CPU-physical addresses to the bus
//! addresses a device actually sees.
//!
//! # Design Philosophy
//!
//! - **Zero firmware dependencies**: Works on any platform
//! - **Flexible memory sources**: Built-in static pool or external region
//! - **Addressing-mode aware**: Bus addresses are derived through an explicit
//!   [`BusTranslation`], so a driver can serve devices doing legacy direct
//!   physical addressing and devices behind a platform translation window
//!   from the same pool
//! - **Thread-safe**: Spin-lock based synchronization
//!
//! # Usage
//!
//! ```ignore
//! use dma_pool::{BusTranslation, DmaPool};
//!
//! // Option 1: Use the built-in static pool
//! dma_pool::global().init_static();
//!
//! // Option 2: External memory (e.g., from the boot memory map)
//! unsafe { dma_pool::global().init_external(base_addr, size)? };
//!
//! // Carve a device-visible region. The translation comes from the
//! // device's resolved DMA addressing mode.
//! let region = dma_pool::global().alloc_region(4, BusTranslation::Identity)?;
//! ```

#![no_std]

use core::ptr::NonNull;

use spin::Mutex;

/// Page size (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Built-in static pool size (2MB).
pub const DEFAULT_POOL_SIZE: usize = 2 * 1024 * 1024;

/// Minimum usable external region size (64KB).
pub const MIN_REGION_SIZE: usize = 64 * 1024;

// ============================================================================
// Utility functions
// ============================================================================

/// Align a value up to the given alignment.
#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Align a value down to the given alignment.
#[inline]
pub const fn align_down(val: usize, align: usize) -> usize {
    val & !(align - 1)
}

/// Convert pages to bytes.
#[inline]
pub const fn pages_to_bytes(pages: usize) -> usize {
    pages * PAGE_SIZE
}

/// Convert bytes to pages (rounded up).
#[inline]
pub const fn bytes_to_pages(bytes: usize) -> usize {
    align_up(bytes, PAGE_SIZE) / PAGE_SIZE
}

// ============================================================================
// Bus address translation
// ============================================================================

/// How CPU-physical addresses map to the bus addresses a device sees.
///
/// Selected once per device when its DMA addressing mode is resolved,
/// then fixed for the device's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusTranslation {
    /// Device addresses memory by raw guest-physical address.
    ///
    /// Used for devices on the legacy direct addressing path.
    Identity,
    /// Device addresses pass through a platform translation window that
    /// starts at the given bus address. The platform programs the window;
    /// this pool only derives addresses inside it.
    Offset(u64),
}

impl BusTranslation {
    /// Bus address a device must use for the given CPU-physical address.
    #[inline]
    pub const fn bus_addr(&self, phys: u64) -> u64 {
        match self {
            BusTranslation::Identity => phys,
            BusTranslation::Offset(window) => window.wrapping_add(phys),
        }
    }
}

// ============================================================================
// Memory regions
// ============================================================================

/// A raw memory region suitable for backing the pool.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    /// Base address (physical = virtual in identity mapping).
    pub base: usize,
    /// Size in bytes.
    pub size: usize,
}

impl MemoryRegion {
    /// Create a new memory region.
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Check if region is usable as pool backing (page-aligned, large enough).
    pub fn is_usable(&self) -> bool {
        self.base % PAGE_SIZE == 0 && self.size >= MIN_REGION_SIZE
    }

    /// Get the page-aligned sub-region.
    pub fn aligned(&self) -> Self {
        let aligned_base = align_up(self.base, PAGE_SIZE);
        let adjustment = aligned_base - self.base;
        let aligned_size = align_down(self.size.saturating_sub(adjustment), PAGE_SIZE);
        Self {
            base: aligned_base,
            size: aligned_size,
        }
    }
}

/// A device-visible DMA region carved from the pool.
///
/// Pairs the CPU-accessible pointer with the bus address the device must
/// use for the same bytes. The bus address is fixed at carve time from the
/// device's [`BusTranslation`].
#[derive(Clone, Copy)]
pub struct DmaRegion {
    cpu_ptr: *mut u8,
    bus_base: u64,
    size: usize,
}

impl DmaRegion {
    /// CPU base pointer.
    #[inline]
    pub const fn cpu_base(&self) -> *mut u8 {
        self.cpu_ptr
    }

    /// Bus base address (what the device sees).
    #[inline]
    pub const fn bus_base(&self) -> u64 {
        self.bus_base
    }

    /// Total size in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Get CPU pointer at offset.
    ///
    /// # Safety
    /// Offset must be within region bounds.
    #[inline]
    pub unsafe fn cpu_at(&self, offset: usize) -> *mut u8 {
        self.cpu_ptr.add(offset)
    }

    /// Get bus address at offset.
    #[inline]
    pub const fn bus_at(&self, offset: usize) -> u64 {
        self.bus_base + offset as u64
    }
}

unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl core::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("cpu_ptr", &self.cpu_ptr)
            .field("bus_base", &format_args!("{:#x}", self.bus_base))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

// ============================================================================
// Error types
// ============================================================================

/// DMA pool errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// Pool not initialized.
    NotInitialized,
    /// Requested 0 pages.
    ZeroPages,
    /// Not enough memory in pool.
    OutOfMemory,
    /// Pool already initialized.
    AlreadyInitialized,
    /// Invalid memory region.
    InvalidRegion,
}

impl core::fmt::Display for DmaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "DMA pool not initialized"),
            Self::ZeroPages => write!(f, "zero-page allocation"),
            Self::OutOfMemory => write!(f, "DMA pool exhausted"),
            Self::AlreadyInitialized => write!(f, "DMA pool already initialized"),
            Self::InvalidRegion => write!(f, "invalid backing region"),
        }
    }
}

/// Result type for DMA operations.
pub type Result<T> = core::result::Result<T, DmaError>;

// ============================================================================
// Pool
// ============================================================================

struct PoolInner {
    /// Base address of the backing region.
    base: usize,
    /// Size of the backing region.
    size: usize,
    /// Bump allocator offset.
    offset: usize,
}

/// DMA memory pool.
///
/// Page-granular bump allocator over a single backing region. Memory is
/// zeroed on allocation and only reclaimed wholesale via [`DmaPool::reset`];
/// device rings live for the guest's lifetime, so there is no free list.
pub struct DmaPool {
    inner: Mutex<Option<PoolInner>>,
}

impl DmaPool {
    /// Create an uninitialized pool.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Initialize with an externally-provided memory region.
    ///
    /// # Safety
    ///
    /// - `base` must be a valid, page-aligned address.
    /// - The region must be identity-mapped (phys == virt).
    /// - The region must not be used by anything else and must remain
    ///   valid for the lifetime of the pool.
    pub unsafe fn init_external(&self, base: usize, size: usize) -> Result<()> {
        let region = MemoryRegion::new(base, size);
        if !region.is_usable() {
            return Err(DmaError::InvalidRegion);
        }
        let aligned = region.aligned();

        let mut inner = self.inner.lock();
        if inner.is_some() {
            return Err(DmaError::AlreadyInitialized);
        }
        core::ptr::write_bytes(aligned.base as *mut u8, 0, aligned.size);
        *inner = Some(PoolInner {
            base: aligned.base,
            size: aligned.size,
            offset: 0,
        });
        Ok(())
    }

    /// Check if the pool is initialized.
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Allocate contiguous DMA pages.
    ///
    /// Returns (physical_address, cpu_pointer). Memory is zeroed.
    pub fn alloc_pages(&self, pages: usize) -> Result<(usize, NonNull<u8>)> {
        if pages == 0 {
            return Err(DmaError::ZeroPages);
        }
        let size = pages_to_bytes(pages);

        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(DmaError::NotInitialized)?;

        let aligned_offset = align_up(inner.offset, PAGE_SIZE);
        let new_offset = aligned_offset.checked_add(size).ok_or(DmaError::OutOfMemory)?;
        if new_offset > inner.size {
            return Err(DmaError::OutOfMemory);
        }
        inner.offset = new_offset;
        let paddr = inner.base + aligned_offset;
        drop(guard);

        let ptr = paddr as *mut u8;
        // Zero outside the lock; the range is exclusively ours now.
        unsafe {
            core::ptr::write_bytes(ptr, 0, size);
        }
        let vaddr = NonNull::new(ptr).ok_or(DmaError::OutOfMemory)?;
        Ok((paddr, vaddr))
    }

    /// Carve a device-visible region from the pool.
    ///
    /// The region's bus addresses are derived through `translation`, which
    /// the caller selects from the device's resolved DMA addressing mode.
    pub fn alloc_region(&self, pages: usize, translation: BusTranslation) -> Result<DmaRegion> {
        let (paddr, vaddr) = self.alloc_pages(pages)?;
        Ok(DmaRegion {
            cpu_ptr: vaddr.as_ptr(),
            bus_base: translation.bus_addr(paddr as u64),
            size: pages_to_bytes(pages),
        })
    }

    /// Get remaining free space in bytes.
    pub fn free_space(&self) -> usize {
        match self.inner.lock().as_ref() {
            Some(inner) => inner.size.saturating_sub(align_up(inner.offset, PAGE_SIZE)),
            None => 0,
        }
    }

    /// Get total pool size in bytes.
    pub fn total_size(&self) -> usize {
        match self.inner.lock().as_ref() {
            Some(inner) => inner.size,
            None => 0,
        }
    }

    /// Reset the allocator.
    ///
    /// # Safety
    ///
    /// All previously carved regions must be abandoned; devices must no
    /// longer reference any address inside the pool.
    pub unsafe fn reset(&self) {
        if let Some(inner) = self.inner.lock().as_mut() {
            inner.offset = 0;
        }
    }
}

impl Default for DmaPool {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Global pool
// ============================================================================

/// Page-aligned static storage for the built-in pool.
#[repr(C, align(4096))]
struct StaticStorage {
    data: [u8; DEFAULT_POOL_SIZE],
}

static mut STATIC_STORAGE: StaticStorage = StaticStorage {
    data: [0u8; DEFAULT_POOL_SIZE],
};

static GLOBAL: DmaPool = DmaPool::new();

/// The global DMA pool shared by all device drivers.
pub fn global() -> &'static DmaPool {
    &GLOBAL
}

impl DmaPool {
    /// Initialize the pool with the built-in static storage.
    ///
    /// This is the simplest option - uses compiled-in memory. Subsequent
    /// calls are no-ops.
    pub fn init_static(&self) {
        // SAFETY: the static storage is page-aligned, identity-mapped, and
        // reserved for this pool; double-init is rejected by init_external.
        let _ = unsafe {
            let base = core::ptr::addr_of_mut!(STATIC_STORAGE) as usize;
            self.init_external(base, DEFAULT_POOL_SIZE)
        };
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(4096))]
    struct TestStorage {
        data: [u8; MIN_REGION_SIZE],
    }

    #[test]
    fn test_align_functions() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(bytes_to_pages(1), 1);
        assert_eq!(bytes_to_pages(4097), 2);
    }

    #[test]
    fn test_memory_region() {
        let region = MemoryRegion::new(4096, 65536);
        assert!(region.is_usable());

        let small = MemoryRegion::new(4096, 1024);
        assert!(!small.is_usable());

        let unaligned = MemoryRegion::new(100, 65536 + PAGE_SIZE);
        assert!(!unaligned.is_usable());
        let fixed = unaligned.aligned();
        assert_eq!(fixed.base % PAGE_SIZE, 0);
        assert!(fixed.size >= MIN_REGION_SIZE);
    }

    #[test]
    fn test_bus_translation() {
        assert_eq!(BusTranslation::Identity.bus_addr(0x1000), 0x1000);
        assert_eq!(
            BusTranslation::Offset(0x8000_0000).bus_addr(0x1000),
            0x8000_1000
        );
    }

    #[test]
    fn test_alloc_and_exhaustion() {
        static mut STORAGE: TestStorage = TestStorage {
            data: [0xAA; MIN_REGION_SIZE],
        };
        let pool = DmaPool::new();
        assert_eq!(pool.alloc_pages(1), Err(DmaError::NotInitialized));

        let base = unsafe { core::ptr::addr_of_mut!(STORAGE) as usize };
        unsafe { pool.init_external(base, MIN_REGION_SIZE).unwrap() };
        assert!(pool.is_initialized());
        assert_eq!(
            unsafe { pool.init_external(base, MIN_REGION_SIZE) },
            Err(DmaError::AlreadyInitialized)
        );

        assert_eq!(pool.alloc_pages(0), Err(DmaError::ZeroPages));

        let (paddr, ptr) = pool.alloc_pages(2).unwrap();
        assert_eq!(paddr % PAGE_SIZE, 0);
        // Allocation is zeroed despite the 0xAA backing fill.
        let slice = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 2 * PAGE_SIZE) };
        assert!(slice.iter().all(|&b| b == 0));

        let total_pages = MIN_REGION_SIZE / PAGE_SIZE;
        assert_eq!(
            pool.alloc_pages(total_pages),
            Err(DmaError::OutOfMemory)
        );
        assert!(pool.alloc_pages(total_pages - 2).is_ok());
        assert_eq!(pool.free_space(), 0);
    }

    #[test]
    fn test_alloc_region_translation() {
        static mut STORAGE: TestStorage = TestStorage {
            data: [0; MIN_REGION_SIZE],
        };
        let pool = DmaPool::new();
        let base = unsafe { core::ptr::addr_of_mut!(STORAGE) as usize };
        unsafe { pool.init_external(base, MIN_REGION_SIZE).unwrap() };

        let direct = pool.alloc_region(1, BusTranslation::Identity).unwrap();
        assert_eq!(direct.bus_base(), direct.cpu_base() as u64);
        assert_eq!(direct.bus_at(16), direct.bus_base() + 16);

        let window = 0x4000_0000u64;
        let mediated = pool.alloc_region(1, BusTranslation::Offset(window)).unwrap();
        assert_eq!(
            mediated.bus_base(),
            window.wrapping_add(mediated.cpu_base() as u64)
        );
        assert_eq!(mediated.size(), PAGE_SIZE);
    }
}
