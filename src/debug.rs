//! Heap dump routines
//!
//! Feature-gated under the `debug-dump` feature. Both dumps validate
//! magic words exactly like the allocation paths do, so a dump of a
//! damaged heap aborts instead of printing garbage.

use crate::heap::Heap;
use crate::traits::PressureRelief;

impl<R: PressureRelief> Heap<R> {
    /// Log every free block, per region in ring order.
    pub fn dump_free(&self) {
        self.walk_free(|b| {
            log::debug!("F:{:#x}:{}", b.addr, b.size);
        });
    }

    /// Log every block of every region in address order.
    pub fn dump_blocks(&self) {
        self.walk_regions(|r| {
            log::debug!("region {:#x} ({} bytes)", r.base, r.size);
        });
        self.walk_blocks(|b| {
            if b.free {
                log::debug!("F:{:#x}:{}", b.addr, b.size);
            } else {
                log::debug!("A:{:#x}:{}", b.addr, b.size);
            }
        });
    }
}
