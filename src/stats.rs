//! Statistics collection for the heap
//!
//! Feature-gated under the `stats` feature. The snapshots perform the
//! same corruption checks as the allocation paths while they walk.

use crate::heap::Heap;
use crate::traits::PressureRelief;

/// Point-in-time statistics for one region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStats {
    /// Address of the region's first block header.
    pub base: usize,
    /// Usable bytes in the region.
    pub capacity_bytes: usize,
    /// Bytes currently in free blocks (headers included).
    pub free_bytes: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Number of allocated blocks.
    pub allocated_blocks: usize,
    /// Size of the largest free block in bytes.
    pub largest_free_bytes: usize,
}

/// Point-in-time statistics for the whole heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of registered regions.
    pub regions: usize,
    /// Total usable bytes across all regions.
    pub capacity_bytes: usize,
    /// Bytes currently in free blocks (headers included).
    pub free_bytes: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Number of allocated blocks.
    pub allocated_blocks: usize,
    /// Size of the largest free block in bytes.
    pub largest_free_bytes: usize,
}

impl<R: PressureRelief> Heap<R> {
    /// Visit a statistics summary of every region, in list order.
    ///
    /// Every block of a region is accounted to it, so a region's
    /// capacity equals its free and allocated bytes combined.
    pub fn region_stats(&self, mut f: impl FnMut(RegionStats)) {
        let mut current = RegionStats::default();
        let mut live = false;
        self.walk_blocks(|b| {
            if live && current.base != b.region {
                f(current);
                current = RegionStats::default();
            }
            live = true;
            current.base = b.region;
            current.capacity_bytes += b.size;
            if b.free {
                current.free_blocks += 1;
                current.free_bytes += b.size;
                current.largest_free_bytes = current.largest_free_bytes.max(b.size);
            } else {
                current.allocated_blocks += 1;
            }
        });
        if live {
            f(current);
        }
    }

    /// Take a statistics snapshot of the whole heap.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();
        self.region_stats(|r| {
            stats.regions += 1;
            stats.capacity_bytes += r.capacity_bytes;
            stats.free_bytes += r.free_bytes;
            stats.free_blocks += r.free_blocks;
            stats.allocated_blocks += r.allocated_blocks;
            stats.largest_free_bytes = stats.largest_free_bytes.max(r.largest_free_bytes);
        });
        stats
    }
}
