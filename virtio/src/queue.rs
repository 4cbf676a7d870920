//! Split-virtqueue memory layout.
//!
//! Sizes and carves the DMA memory for one split virtqueue: descriptor
//! table, available ring, used ring. Ring processing itself is device
//! driver territory; this module only owns the geometry so the probe flow
//! can program queue addresses that match what it allocated.
//!
//! # Layout
//! ```text
//! offset 0                          descriptor table  (16 bytes * size)
//! desc_bytes                        available ring    (6 + 2 * size)
//! align_up(.., 4)                   used ring         (6 + 8 * size)
//! ```
//!
//! # Reference
//! VirtIO Spec 1.2 §2.7 (split virtqueues)

use dma_pool::{align_up, bytes_to_pages, BusTranslation, DmaError, DmaPool, DmaRegion};

/// One descriptor is 16 bytes (addr, len, flags, next).
const DESC_BYTES: usize = 16;

/// Geometry of a split virtqueue of a given size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtqueueLayout {
    queue_size: u16,
}

impl VirtqueueLayout {
    pub const fn new(queue_size: u16) -> Self {
        Self { queue_size }
    }

    pub const fn queue_size(&self) -> u16 {
        self.queue_size
    }

    /// Descriptor table size in bytes.
    pub const fn desc_bytes(&self) -> usize {
        self.queue_size as usize * DESC_BYTES
    }

    /// Available ring size in bytes (flags, idx, ring[], used_event).
    pub const fn avail_bytes(&self) -> usize {
        6 + 2 * self.queue_size as usize
    }

    /// Used ring size in bytes (flags, idx, ring[], avail_event).
    pub const fn used_bytes(&self) -> usize {
        6 + 8 * self.queue_size as usize
    }

    /// Offset of the available ring within the queue region.
    pub const fn avail_offset(&self) -> usize {
        self.desc_bytes()
    }

    /// Offset of the used ring within the queue region.
    pub const fn used_offset(&self) -> usize {
        align_up(self.avail_offset() + self.avail_bytes(), 4)
    }

    /// Total bytes the queue occupies.
    pub const fn total_bytes(&self) -> usize {
        self.used_offset() + self.used_bytes()
    }

    /// Pages to allocate for the queue.
    pub const fn pages(&self) -> usize {
        bytes_to_pages(self.total_bytes())
    }
}

/// DMA memory for one virtqueue, carved from the pool with the device's
/// bus translation already applied.
#[derive(Debug, Clone, Copy)]
pub struct QueueRegion {
    region: DmaRegion,
    layout: VirtqueueLayout,
}

impl QueueRegion {
    /// Allocate and zero the memory for a queue of `queue_size` entries.
    pub fn carve(
        pool: &DmaPool,
        translation: BusTranslation,
        queue_size: u16,
    ) -> Result<Self, DmaError> {
        let layout = VirtqueueLayout::new(queue_size);
        let region = pool.alloc_region(layout.pages(), translation)?;
        Ok(Self { region, layout })
    }

    pub const fn layout(&self) -> VirtqueueLayout {
        self.layout
    }

    pub const fn region(&self) -> &DmaRegion {
        &self.region
    }

    /// Bus address of the descriptor table.
    pub const fn desc_bus(&self) -> u64 {
        self.region.bus_at(0)
    }

    /// Bus address of the available ring.
    pub const fn avail_bus(&self) -> u64 {
        self.region.bus_at(self.layout.avail_offset())
    }

    /// Bus address of the used ring.
    pub const fn used_bus(&self) -> u64 {
        self.region.bus_at(self.layout.used_offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dma_pool::{MIN_REGION_SIZE, PAGE_SIZE};

    #[test]
    fn test_layout_geometry() {
        let layout = VirtqueueLayout::new(128);
        assert_eq!(layout.desc_bytes(), 2048);
        assert_eq!(layout.avail_bytes(), 6 + 256);
        assert_eq!(layout.used_bytes(), 6 + 1024);
        assert_eq!(layout.avail_offset(), 2048);
        // 2048 + 262 = 2310, aligned to 2312.
        assert_eq!(layout.used_offset(), 2312);
        assert_eq!(layout.total_bytes(), 2312 + 1030);
        assert_eq!(layout.pages(), 1);
    }

    #[test]
    fn test_layout_alignments() {
        for size in [8u16, 32, 64, 256] {
            let layout = VirtqueueLayout::new(size);
            assert_eq!(layout.avail_offset() % 2, 0);
            assert_eq!(layout.used_offset() % 4, 0);
            assert!(layout.pages() >= 1);
        }
    }

    #[test]
    fn test_carve_applies_translation() {
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

        let window = 0x2000_0000u64;
        let q = QueueRegion::carve(&pool, BusTranslation::Offset(window), 64).unwrap();
        let phys = q.region().cpu_base() as u64;
        assert_eq!(q.desc_bus(), window + phys);
        assert_eq!(q.avail_bus(), window + phys + 1024);
        assert_eq!(q.used_bus(), window + phys + q.layout().used_offset() as u64);
        assert_eq!(q.region().size() % PAGE_SIZE, 0);
    }
}
