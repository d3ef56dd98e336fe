//! Trait definitions for runtime-provided backends
//!
//! The allocator does not know how the rest of the bootloader caches
//! disk blocks or tracks loadable modules; it only needs a way to ask
//! for memory back when every region refuses a request. These hooks are
//! that seam.

use crate::heap::Reclaim;

/// Memory-pressure relief hooks.
///
/// When a full sweep over all regions fails, the allocator calls these
/// in order, retrying the sweep after each: first the cheap option
/// (dropping disk caches), then the expensive one (unloading modules).
/// Implementations free memory by releasing pointers through the
/// [`Reclaim`] handle, which re-enters the normal release path.
///
/// Both hooks must be idempotent and safe to call when there is nothing
/// to give back; the defaults do nothing.
pub trait PressureRelief {
    /// Drop reclaimable disk caches.
    fn invalidate_disk_caches(&mut self, reclaim: Reclaim<'_>) {
        let _ = reclaim;
    }

    /// Unload modules nothing depends on any more.
    fn unload_unneeded_modules(&mut self, reclaim: Reclaim<'_>) {
        let _ = reclaim;
    }
}

/// Relief provider for heaps with nothing to reclaim.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRelief;

impl PressureRelief for NoRelief {}
