//! Heap state and the public allocation surface
//!
//! The heap owns an ordered list of regions and drives the allocation
//! protocol over them: pick regions smallest-first, ask each one to
//! serve the request under its own strategy, and squeeze the rest of
//! the bootloader for memory before giving up.
//!
//! All state transitions are single logical steps; the heap is strictly
//! single-threaded and relies on the bootloader running without
//! preemption. The global-allocator adapter in the crate root adds the
//! locking needed for the `GlobalAlloc` contract.

use core::ptr::{self, NonNull};

use crate::cell::{align_in_cells, cells_for, is_cell_aligned, CELL_SHIFT, CELL_SIZE};
use crate::error::AllocError;
use crate::header::{self, BlockHeader, FREE_MAGIC};
use crate::policy::{Policy, PolicyTable, Strategy};
use crate::region::Region;
use crate::ring::FreeRing;
use crate::traits::{NoRelief, PressureRelief};

#[cfg(feature = "debug-poison")]
const FREE_POISON: u8 = 0xDD;

/// The ordered region list and every operation that walks it.
///
/// Kept separate from [`Heap`] so pressure-relief hooks can be handed a
/// release path while the heap is mid-allocation.
pub(crate) struct RegionList {
    base: Option<NonNull<Region>>,
}

impl RegionList {
    pub(crate) const fn new() -> Self {
        Self { base: None }
    }

    pub(crate) fn regions(&self) -> RegionIter {
        RegionIter { cursor: self.base }
    }

    /// Initialise `addr..addr + size` as a region and insert it into the
    /// list, sorted ascending by usable size so small regions are
    /// exhausted before large ones. Ties keep insertion order.
    ///
    /// # Safety
    /// The range must be writable, exclusive to the heap, and live for
    /// the heap's whole lifetime.
    pub(crate) unsafe fn register(&mut self, addr: *mut u8, size: usize, policies: &PolicyTable) {
        let Some(mut region) = (unsafe { Region::init(addr, size, policies) }) else {
            return;
        };
        log::debug!(
            "using memory for heap: start={:#x}, size={:#x}",
            addr as usize,
            size
        );

        let rsize = unsafe { region.as_ref() }.size();
        let mut link: *mut Option<NonNull<Region>> = &mut self.base;
        unsafe {
            while let Some(q) = *link {
                if q.as_ref().size() > rsize {
                    break;
                }
                link = &mut (*q.as_ptr()).next;
            }
            region.as_mut().next = *link;
            *link = Some(region);
        }
    }

    /// One sweep over all regions for `n` cells aligned to `align_cells`
    /// under `policy`. No pressure relief.
    pub(crate) fn allocate_once(
        &mut self,
        align_cells: usize,
        n: usize,
        policy: Policy,
    ) -> Option<NonNull<u8>> {
        for mut r in self.regions() {
            let region = unsafe { r.as_mut() };
            let strategy = region.strategy(policy);
            if strategy == Strategy::Skip {
                continue;
            }
            if let Some(p) = unsafe { region.allocate(align_cells, n, strategy) } {
                return Some(p);
            }
        }
        None
    }

    /// Recover the header and region for a user pointer, aborting on
    /// anything that is not a live allocation of this heap.
    fn lookup(&mut self, ptr: NonNull<u8>) -> (NonNull<BlockHeader>, NonNull<Region>) {
        let addr = ptr.as_ptr() as usize;
        if !is_cell_aligned(addr) {
            panic!("unaligned pointer {:p}", ptr);
        }
        for r in self.regions() {
            if unsafe { r.as_ref() }.contains(addr) {
                // SAFETY: ptr is cell-aligned and at least one cell into
                // the region, so the preceding cell is in bounds.
                let header = unsafe { header::header_of(ptr) };
                unsafe { header::expect_alloc(header) };
                return (header, r);
            }
        }
        panic!("out of range pointer {:p}", ptr);
    }

    /// Return a block to its region's free ring. Null is a no-op.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer previously returned by this heap
    /// and not yet released.
    pub(crate) unsafe fn release(&mut self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else { return };
        let (header, mut region) = self.lookup(ptr);

        #[cfg(feature = "debug-poison")]
        unsafe {
            let cells = header.as_ref().size;
            ptr::write_bytes(ptr.as_ptr(), FREE_POISON, (cells - 1) * CELL_SIZE);
        }

        unsafe {
            region.as_mut().ring.insert_and_coalesce(header);
        }
    }

    /// Shrink in place, or grow into an immediately following free
    /// block. `None` means the caller has to relocate.
    ///
    /// # Safety
    /// `ptr` must be a live pointer returned by this heap.
    unsafe fn try_resize_in_place(&mut self, ptr: NonNull<u8>, n: usize) -> Option<NonNull<u8>> {
        let (header, mut region) = self.lookup(ptr);
        let region = unsafe { region.as_mut() };
        let h = header.as_ptr();

        unsafe {
            if (*h).size >= n {
                // Shrink keeps the whole block; the trailing cells stay
                // with it until release.
                return Some(ptr);
            }

            let next = header.add((*h).size);
            if (next.as_ptr() as usize) < region.end()
                && (*next.as_ptr()).magic == FREE_MAGIC
                && (*h).size + (*next.as_ptr()).size >= n
            {
                FreeRing::split(next, n - (*h).size);
                region.ring.unlink(next);
                // The absorbed header becomes payload; deface it so
                // stale references to it are observable.
                (*next.as_ptr()).magic = 0;
                (*h).size = n;
                return Some(ptr);
            }
        }
        None
    }
}

/// An iterator over the region list.
pub(crate) struct RegionIter {
    cursor: Option<NonNull<Region>>,
}

impl Iterator for RegionIter {
    type Item = NonNull<Region>;

    fn next(&mut self) -> Option<NonNull<Region>> {
        let r = self.cursor?;
        self.cursor = unsafe { r.as_ref() }.next;
        Some(r)
    }
}

/// Release-only view of the heap handed to pressure-relief hooks.
///
/// The hooks run while an allocation is in progress; this handle is how
/// they re-enter the allocator, and it exposes exactly the release path.
pub struct Reclaim<'a> {
    list: &'a mut RegionList,
}

impl Reclaim<'_> {
    /// Release a pointer back to its region. Null is a no-op.
    ///
    /// # Safety
    /// `ptr` must be null or a live pointer previously returned by this
    /// heap.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        unsafe { self.list.release(ptr) }
    }
}

/// A block reported by the diagnostic walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Base address of the region the block belongs to.
    pub region: usize,
    /// Address of the block's header.
    pub addr: usize,
    /// Block size in bytes, header included.
    pub size: usize,
    pub free: bool,
}

/// A registered region as reported by [`Heap::walk_regions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// Address of the first block header.
    pub base: usize,
    /// Usable bytes past the region record.
    pub size: usize,
}

/// The bootloader heap.
///
/// All memory it manages arrives through [`register_region`]; the heap
/// itself never allocates from anywhere else and is never torn down.
/// `R` supplies the memory-pressure hooks consulted when every region
/// refuses a request.
///
/// [`register_region`]: Heap::register_region
pub struct Heap<R: PressureRelief = NoRelief> {
    regions: RegionList,
    relief: R,
}

impl Heap<NoRelief> {
    /// An empty heap with no pressure-relief hooks.
    pub const fn new() -> Self {
        Self::with_relief(NoRelief)
    }
}

impl Default for Heap<NoRelief> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: PressureRelief> Heap<R> {
    /// An empty heap that will consult `relief` when memory runs out.
    pub const fn with_relief(relief: R) -> Self {
        Self {
            regions: RegionList::new(),
            relief,
        }
    }

    /// Access the pressure-relief provider.
    pub fn relief_mut(&mut self) -> &mut R {
        &mut self.relief
    }

    /// Contribute `addr..addr + size` to the heap. Areas too small to
    /// host the region record and a block are silently ignored.
    ///
    /// # Safety
    /// The range must be writable memory exclusive to the heap for the
    /// heap's whole lifetime.
    pub unsafe fn register_region(&mut self, addr: *mut u8, size: usize, policies: &PolicyTable) {
        unsafe { self.regions.register(addr, size, policies) }
    }

    /// Allocate `size` bytes at natural cell alignment. Returns null
    /// when out of memory.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        self.allocate_aligned(0, size)
    }

    /// Allocate `size` bytes aligned to `align` (a power of two; zero
    /// means cell alignment) under the default policy.
    pub fn allocate_aligned(&mut self, align: usize, size: usize) -> *mut u8 {
        self.allocate_aligned_policy(align, size, Policy::Default)
    }

    /// Allocate `size` bytes at natural alignment and clear them.
    pub fn allocate_zeroed(&mut self, size: usize) -> *mut u8 {
        let p = self.allocate(size);
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, size) };
        }
        p
    }

    /// Allocate under a caller-selected policy. Returns null when out of
    /// memory.
    pub fn allocate_aligned_policy(&mut self, align: usize, size: usize, policy: Policy) -> *mut u8 {
        match self.try_allocate_aligned_policy(align, size, policy) {
            Ok(p) => p.as_ptr(),
            Err(err) => {
                log::error!("{}", err);
                ptr::null_mut()
            }
        }
    }

    /// Allocate under a caller-selected policy, reporting failure as a
    /// value.
    ///
    /// Runs the full protocol: sweep all regions in size order, and on
    /// exhaustion invoke the pressure-relief hooks one at a time,
    /// retrying the sweep after each.
    pub fn try_allocate_aligned_policy(
        &mut self,
        align: usize,
        size: usize,
        policy: Policy,
    ) -> Result<NonNull<u8>, AllocError> {
        let n = cells_for(size) + 1;
        let align_cells = align_in_cells(align);

        let Self { regions, relief } = self;
        let mut attempt = 0;
        loop {
            if let Some(p) = regions.allocate_once(align_cells, n, policy) {
                return Ok(p);
            }
            match attempt {
                0 => {
                    log::debug!("allocation of {} bytes failed, invalidating disk caches", size);
                    relief.invalidate_disk_caches(Reclaim { list: &mut *regions });
                }
                1 => {
                    log::debug!("allocation of {} bytes failed, unloading unneeded modules", size);
                    relief.unload_unneeded_modules(Reclaim { list: &mut *regions });
                }
                _ => return Err(AllocError::OutOfMemory),
            }
            attempt += 1;
        }
    }

    /// Release a pointer. Null is a no-op.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer previously returned by this heap
    /// and not yet released.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        unsafe { self.regions.release(ptr) }
    }

    /// Resize `ptr` to `size` bytes under the default policy.
    ///
    /// # Safety
    /// `ptr` must be null or a live pointer returned by this heap.
    pub unsafe fn resize(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        unsafe { self.resize_aligned_policy(ptr, 0, size, Policy::Default) }
    }

    /// Resize `ptr` to `size` bytes, allocating any relocation under
    /// `align` and `policy`.
    ///
    /// Shrinking returns the pointer unchanged. Growing first tries to
    /// absorb an immediately following free block; otherwise the data
    /// moves to a fresh allocation and the old block is released. On
    /// allocation failure the original block is left untouched and null
    /// is returned.
    ///
    /// # Safety
    /// `ptr` must be null or a live pointer returned by this heap.
    pub unsafe fn resize_aligned_policy(
        &mut self,
        ptr: *mut u8,
        align: usize,
        size: usize,
        policy: Policy,
    ) -> *mut u8 {
        let Some(nn) = NonNull::new(ptr) else {
            return self.allocate_aligned_policy(align, size, policy);
        };
        if size == 0 {
            unsafe { self.release(ptr) };
            return ptr::null_mut();
        }

        let n = cells_for(size) + 1;
        if let Some(p) = unsafe { self.regions.try_resize_in_place(nn, n) } {
            return p.as_ptr();
        }

        // Relocate. Growth reads only the original payload.
        let old_payload = unsafe { (header::header_of(nn).as_ref().size - 1) * CELL_SIZE };
        let new = self.allocate_aligned_policy(align, size, policy);
        if new.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            ptr::copy_nonoverlapping(ptr, new, size.min(old_payload));
            self.release(ptr);
        }
        new
    }

    /// Visit every registered region in list (size) order.
    pub fn walk_regions(&self, mut f: impl FnMut(RegionInfo)) {
        for r in self.regions.regions() {
            let region = unsafe { r.as_ref() };
            f(RegionInfo {
                base: region.base(),
                size: region.size(),
            });
        }
    }

    /// Visit every block of every region in address order, validating
    /// magic words along the way.
    pub fn walk_blocks(&self, mut f: impl FnMut(BlockInfo)) {
        for r in self.regions.regions() {
            let region = unsafe { r.as_ref() };
            unsafe {
                region.for_each_block(|h, free| {
                    f(BlockInfo {
                        region: region.base(),
                        addr: h.as_ptr() as usize,
                        size: h.as_ref().size << CELL_SHIFT,
                        free,
                    })
                });
            }
        }
    }

    /// Visit every free block in ring order, validating magic words
    /// along the way.
    pub fn walk_free(&self, mut f: impl FnMut(BlockInfo)) {
        for r in self.regions.regions() {
            let region = unsafe { r.as_ref() };
            unsafe {
                region.ring.for_each(|h| {
                    f(BlockInfo {
                        region: region.base(),
                        addr: h.as_ptr() as usize,
                        size: h.as_ref().size << CELL_SHIFT,
                        free: true,
                    })
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[repr(C, align(64))]
    struct Arena<const N: usize>([u8; N]);

    impl<const N: usize> Arena<N> {
        fn new() -> Self {
            Arena([0; N])
        }

        fn ptr(&mut self) -> *mut u8 {
            self.0.as_mut_ptr()
        }

        fn range(&self) -> (usize, usize) {
            let base = self.0.as_ptr() as usize;
            (base, base + N)
        }
    }

    fn general_heap<const N: usize>(mem: &mut Arena<N>) -> Heap {
        let mut heap = Heap::new();
        unsafe { heap.register_region(mem.ptr(), N, &PolicyTable::GENERAL) };
        heap
    }

    fn free_blocks<R: PressureRelief>(heap: &Heap<R>) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        heap.walk_free(|b| out.push((b.addr, b.size)));
        out
    }

    /// Full structural audit: magic words valid, per-region accounting
    /// exact, ring sorted, free sets from both walks identical, and no
    /// two adjacent free blocks.
    fn assert_consistent<R: PressureRelief>(heap: &Heap<R>) {
        let mut regions = Vec::new();
        heap.walk_regions(|r| regions.push(r));

        let mut blocks = Vec::new();
        heap.walk_blocks(|b| blocks.push(b));
        let mut ring = Vec::new();
        heap.walk_free(|b| ring.push(b));

        for r in &regions {
            let in_region: Vec<_> = blocks.iter().filter(|b| b.region == r.base).collect();
            let total: usize = in_region.iter().map(|b| b.size).sum();
            assert_eq!(total, r.size, "region accounting broken");

            let frees: Vec<_> = in_region.iter().filter(|b| b.free).collect();
            for pair in frees.windows(2) {
                assert_ne!(
                    pair[0].addr + pair[0].size,
                    pair[1].addr,
                    "adjacent free blocks survived coalescing"
                );
            }

            let ring_in_region: Vec<_> = ring.iter().filter(|b| b.region == r.base).collect();
            assert_eq!(ring_in_region.len(), frees.len());
            for (a, b) in ring_in_region.iter().zip(&frees) {
                assert_eq!(a.addr, b.addr);
                assert_eq!(a.size, b.size);
            }
            for pair in ring_in_region.windows(2) {
                assert!(pair[0].addr < pair[1].addr, "free ring not address-ordered");
            }
        }
    }

    #[test]
    fn test_single_region_tight_fit_roundtrip() {
        let mut mem = Arena::<1024>::new();
        let mut heap = general_heap(&mut mem);
        let initial = free_blocks(&heap);
        assert_eq!(initial.len(), 1);

        let p1 = heap.allocate(16);
        let p2 = heap.allocate(16);
        assert!(!p1.is_null() && !p2.is_null());
        assert_ne!(p1, p2);
        unsafe {
            heap.release(p1);
            heap.release(p2);
        }

        assert_eq!(free_blocks(&heap), initial);
        assert_consistent(&heap);
    }

    #[test]
    fn test_second_fit_takes_second_free_block() {
        let mut mem = Arena::<1024>::new();
        let mut heap = general_heap(&mut mem);

        let p1 = heap.allocate(16);
        let p2 = heap.allocate(16);
        let p3 = heap.allocate(16);
        let p4 = heap.allocate(16);
        assert!(!p4.is_null());
        unsafe {
            heap.release(p2);
            heap.release(p4);
        }
        assert_consistent(&heap);

        // Two free blocks now: p2's and the one starting at p4. The
        // default strategy must serve from the second.
        let next = heap.allocate(16);
        assert_eq!(next, p4);
        let _ = (p1, p3);
    }

    #[test]
    fn test_adjacent_releases_coalesce_to_one_block() {
        let mut mem = Arena::<1024>::new();
        let mut heap = general_heap(&mut mem);
        let capacity = free_blocks(&heap)[0].1;

        let p1 = heap.allocate(16);
        let p2 = heap.allocate(16);
        let p3 = heap.allocate(16);
        unsafe {
            heap.release(p1);
            heap.release(p3);
            heap.release(p2);
        }

        let frees = free_blocks(&heap);
        assert_eq!(frees.len(), 1);
        assert_eq!(frees[0].1, capacity);
        assert_consistent(&heap);
    }

    #[test]
    fn test_aligned_allocation_and_front_sliver() {
        let mut mem = Arena::<4096>::new();
        let mut heap = general_heap(&mut mem);
        let free_before = free_blocks(&heap)[0];

        let p = heap.allocate_aligned(64, 16);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        assert_consistent(&heap);

        // If alignment skipped cells at the front, they must have stayed
        // behind as a well-formed free block at the old head address.
        let frees = free_blocks(&heap);
        let header = p as usize - CELL_SIZE;
        if header != free_before.0 {
            assert_eq!(frees[0].0, free_before.0);
            assert_eq!(frees[0].1, header - free_before.0);
        }
    }

    #[test]
    fn test_cell_alignment_never_splits_the_front() {
        let mut mem = Arena::<1024>::new();
        let mut heap = general_heap(&mut mem);

        let p = heap.allocate_aligned(CELL_SIZE, 16);
        assert!(!p.is_null());
        assert_eq!(p as usize % CELL_SIZE, 0);
        // One allocation out of one free block: exactly one free block
        // remains, no sliver.
        assert_eq!(free_blocks(&heap).len(), 1);
        assert_consistent(&heap);
    }

    #[test]
    fn test_alignment_invariant_over_power_of_two_aligns() {
        let mut mem = Arena::<8192>::new();
        let mut heap = general_heap(&mut mem);

        for align in [0usize, 16, 32, 64, 128, 256] {
            let p = heap.allocate_aligned(align, 24);
            assert!(!p.is_null(), "align {} failed", align);
            let effective = align.max(1);
            assert_eq!(p as usize % effective, 0, "align {} violated", align);
        }
        assert_consistent(&heap);
    }

    #[test]
    fn test_resize_grows_in_place_into_free_neighbour() {
        let mut mem = Arena::<1024>::new();
        let mut heap = general_heap(&mut mem);

        let p = heap.allocate(16);
        let q = heap.allocate(16);
        unsafe { heap.release(q) };
        let before = free_blocks(&heap);
        assert_eq!(before.len(), 1);

        let grown = 2 * CELL_SIZE;
        let r = unsafe { heap.resize(p, grown) };
        assert_eq!(r, p);

        // The free block shifted up by exactly the absorbed cells; no
        // allocation happened anywhere else.
        let after = free_blocks(&heap);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].0, before[0].0 + CELL_SIZE);
        assert_eq!(after[0].1, before[0].1 - CELL_SIZE);
        assert_consistent(&heap);
    }

    #[test]
    fn test_resize_shrink_is_bookkeeping_only() {
        let mut mem = Arena::<1024>::new();
        let mut heap = general_heap(&mut mem);

        let p = heap.allocate(3 * CELL_SIZE);
        let blocks_before = free_blocks(&heap);
        let r = unsafe { heap.resize(p, CELL_SIZE) };
        assert_eq!(r, p);
        // No split on shrink: the free picture is untouched.
        assert_eq!(free_blocks(&heap), blocks_before);
        assert_consistent(&heap);
    }

    #[test]
    fn test_resize_relocates_when_blocked() {
        let mut mem = Arena::<2048>::new();
        let mut heap = general_heap(&mut mem);

        let p = heap.allocate(CELL_SIZE);
        let barrier = heap.allocate(CELL_SIZE);
        unsafe {
            ptr::write_bytes(p, 0x5A, CELL_SIZE);
            let r = heap.resize(p, 4 * CELL_SIZE);
            assert!(!r.is_null());
            assert_ne!(r, p);
            // Old payload survived the move.
            for i in 0..CELL_SIZE {
                assert_eq!(*r.add(i), 0x5A);
            }
            heap.release(r);
            heap.release(barrier);
        }
        assert_consistent(&heap);
    }

    #[test]
    fn test_resize_null_allocates_and_zero_releases() {
        let mut mem = Arena::<1024>::new();
        let mut heap = general_heap(&mut mem);
        let initial = free_blocks(&heap);

        let p = unsafe { heap.resize(ptr::null_mut(), 16) };
        assert!(!p.is_null());
        let q = unsafe { heap.resize(p, 0) };
        assert!(q.is_null());
        assert_eq!(free_blocks(&heap), initial);
    }

    #[test]
    fn test_release_null_is_noop() {
        let mut mem = Arena::<1024>::new();
        let mut heap = general_heap(&mut mem);
        let initial = free_blocks(&heap);
        unsafe { heap.release(ptr::null_mut()) };
        assert_eq!(free_blocks(&heap), initial);
    }

    #[test]
    fn test_zero_size_allocations_are_distinct_and_releasable() {
        let mut mem = Arena::<1024>::new();
        let mut heap = general_heap(&mut mem);
        let initial = free_blocks(&heap);

        let a = heap.allocate(0);
        let b = heap.allocate(0);
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        unsafe {
            heap.release(a);
            heap.release(b);
        }
        assert_eq!(free_blocks(&heap), initial);
    }

    #[test]
    fn test_oversized_request_reports_out_of_memory() {
        let mut mem = Arena::<1024>::new();
        let mut heap = general_heap(&mut mem);

        let err = heap.try_allocate_aligned_policy(0, 1 << 20, Policy::Default);
        assert_eq!(err, Err(AllocError::OutOfMemory));
        assert!(heap.allocate(1 << 20).is_null());
        // The failure left the heap intact.
        assert_consistent(&heap);
        assert!(!heap.allocate(16).is_null());
    }

    #[test]
    fn test_regions_are_kept_sorted_by_size() {
        let mut big = Arena::<4096>::new();
        let mut small = Arena::<512>::new();
        let big_range = big.range();
        let small_range = small.range();
        let mut heap = Heap::new();
        unsafe {
            heap.register_region(big.ptr(), 4096, &PolicyTable::GENERAL);
            heap.register_region(small.ptr(), 512, &PolicyTable::GENERAL);
        }

        let mut sizes = Vec::new();
        heap.walk_regions(|r| sizes.push(r.size));
        assert_eq!(sizes.len(), 2);
        assert!(sizes[0] < sizes[1]);

        // Small regions are consumed first...
        let p = heap.allocate(16);
        assert!((p as usize) > small_range.0 && (p as usize) < small_range.1);

        // ...and large ones take over once the small one cannot serve.
        let q = heap.allocate(900);
        assert!((q as usize) > big_range.0 && (q as usize) < big_range.1);
        assert_consistent(&heap);
    }

    #[test]
    fn test_too_small_region_leaves_heap_unchanged() {
        let mut mem = Arena::<256>::new();
        let mut heap = Heap::new();
        unsafe { heap.register_region(mem.ptr(), 4 * CELL_SIZE - 1, &PolicyTable::GENERAL) };
        let mut count = 0;
        heap.walk_regions(|_| count += 1);
        assert_eq!(count, 0);
        assert!(heap.allocate(16).is_null());
    }

    #[test]
    fn test_policy_routing_between_regions() {
        let mut ram = Arena::<2048>::new();
        let mut low = Arena::<1024>::new();
        let (ram_lo, ram_hi) = ram.range();
        let (low_lo, low_hi) = low.range();
        let mut heap = Heap::new();
        unsafe {
            heap.register_region(ram.ptr(), 2048, &PolicyTable::GENERAL);
            heap.register_region(low.ptr(), 1024, &PolicyTable::LOW_MEMORY);
        }

        let d = heap.allocate(16) as usize;
        assert!(d > ram_lo && d < ram_hi, "default must stay out of low memory");

        let l = heap.allocate_aligned_policy(0, 16, Policy::Low) as usize;
        assert!(l > low_lo && l < low_hi);

        let e = heap.allocate_aligned_policy(0, 16, Policy::LowEnd) as usize;
        assert!(e > low_lo && e < low_hi);
        assert!(e > l, "low-end placement must prefer the high addresses");
        assert_consistent(&heap);
    }

    struct CountingRelief {
        victim: *mut u8,
        disk_calls: usize,
        module_calls: usize,
    }

    impl PressureRelief for CountingRelief {
        fn invalidate_disk_caches(&mut self, _reclaim: Reclaim<'_>) {
            self.disk_calls += 1;
        }

        fn unload_unneeded_modules(&mut self, mut reclaim: Reclaim<'_>) {
            self.module_calls += 1;
            if !self.victim.is_null() {
                unsafe { reclaim.release(self.victim) };
                self.victim = ptr::null_mut();
            }
        }
    }

    #[test]
    fn test_pressure_relief_protocol() {
        let mut mem = Arena::<256>::new();
        let mut heap = Heap::with_relief(CountingRelief {
            victim: ptr::null_mut(),
            disk_calls: 0,
            module_calls: 0,
        });
        unsafe { heap.register_region(mem.ptr(), 256, &PolicyTable::GENERAL) };

        // Exhaust the region with 16-byte allocations.
        let mut held = Vec::new();
        loop {
            let p = heap.try_allocate_aligned_policy(0, 16, Policy::Default);
            match p {
                Ok(p) => held.push(p.as_ptr()),
                Err(_) => break,
            }
        }
        assert!(held.len() >= 2);
        // That probing failure already ran both hooks once.
        assert_eq!(heap.relief_mut().disk_calls, 1);
        assert_eq!(heap.relief_mut().module_calls, 1);

        // Arm the second hook with a victim: the next allocation must
        // succeed only after both hooks ran again, and must reuse the
        // victim's block.
        let victim = held[0];
        heap.relief_mut().victim = victim;
        let p = heap.allocate(16);
        assert_eq!(p, victim);
        assert_eq!(heap.relief_mut().disk_calls, 2);
        assert_eq!(heap.relief_mut().module_calls, 2);

        // Nothing left to reclaim: the same request now fails cleanly.
        let err = heap.try_allocate_aligned_policy(0, 16, Policy::Default);
        assert_eq!(err, Err(AllocError::OutOfMemory));
        assert_consistent(&heap);
    }

    #[test]
    #[should_panic(expected = "unaligned pointer")]
    fn test_release_of_unaligned_pointer_aborts() {
        let mut mem = Arena::<1024>::new();
        let mut heap = general_heap(&mut mem);
        let p = heap.allocate(16);
        unsafe { heap.release((p as usize + 1) as *mut u8) };
    }

    #[test]
    #[should_panic(expected = "out of range pointer")]
    fn test_release_of_foreign_pointer_aborts() {
        let mut mem = Arena::<1024>::new();
        let mut other = Arena::<1024>::new();
        let mut heap = general_heap(&mut mem);
        unsafe { heap.release(other.ptr().wrapping_add(CELL_SIZE)) };
    }

    #[test]
    #[should_panic(expected = "alloc magic is broken")]
    fn test_double_release_aborts() {
        let mut mem = Arena::<1024>::new();
        let mut heap = general_heap(&mut mem);
        let p = heap.allocate(16);
        let q = heap.allocate(16);
        let _ = q;
        unsafe {
            heap.release(p);
            heap.release(p);
        }
    }

    #[test]
    fn test_full_drain_restores_every_region() {
        let mut a = Arena::<1024>::new();
        let mut b = Arena::<2048>::new();
        let mut heap = Heap::new();
        unsafe {
            heap.register_region(a.ptr(), 1024, &PolicyTable::GENERAL);
            heap.register_region(b.ptr(), 2048, &PolicyTable::GENERAL);
        }

        let mut held = Vec::new();
        for size in [16usize, 48, 0, 96, 32, 200, 8] {
            let p = heap.allocate(size);
            if !p.is_null() {
                held.push(p);
            }
        }
        for p in held.drain(..) {
            unsafe { heap.release(p) };
        }

        // Zero live allocations: each region is one spanning free block.
        let mut regions = Vec::new();
        heap.walk_regions(|r| regions.push(r));
        let frees = free_blocks(&heap);
        assert_eq!(frees.len(), regions.len());
        for (free, region) in frees.iter().zip(&regions) {
            assert_eq!(free.1, region.size);
        }
        assert_consistent(&heap);
    }
}
