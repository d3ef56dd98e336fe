//! Ember Bootloader Heap Allocator
//!
//! A multi-region, variable-alignment heap for the Ember bootloader.
//! The allocator owns a set of disjoint physical memory ranges handed
//! over at boot and serves the classic free-store interface on top of
//! them, with no operating system and no lower-level allocator beneath
//! it.
//!
//! # Features
//!
//! - **Multiple regions**: disjoint ranges registered independently,
//!   consumed smallest-first to keep large regions unfragmented
//! - **In-band metadata**: one header cell per block, free blocks
//!   threaded into a circular address-ordered ring
//! - **Per-region policies**: each region maps every allocation policy
//!   to a search strategy, or opts out of serving it
//! - **Pressure relief**: hooks into the rest of the bootloader that can
//!   give memory back before a request is failed
//! - **Corruption detection**: magic words on every header, checked on
//!   every transition; a mismatch aborts immediately
//!
//! # Optional Features
//!
//! - `stats`: statistics snapshots
//! - `debug-dump`: ring and block dump routines
//! - `debug-poison`: fill released payloads with a recognisable pattern
//!
//! # Usage
//!
//! ```ignore
//! use ember_alloc::{GlobalHeap, Heap, PolicyTable};
//!
//! #[global_allocator]
//! static ALLOCATOR: GlobalHeap = GlobalHeap;
//!
//! // In bootloader initialisation, after memory discovery:
//! unsafe {
//!     ember_alloc::init(Heap::new()).expect("failed to initialise heap");
//!     ember_alloc::register_region(base, size, &PolicyTable::GENERAL);
//! }
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod cell;
pub mod error;
pub mod header;
pub mod heap;
pub mod policy;
pub mod traits;

mod lock;
mod region;
mod ring;

#[cfg(feature = "debug-dump")]
mod debug;

#[cfg(feature = "stats")]
pub mod stats;

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

pub use cell::{CELL_SHIFT, CELL_SIZE};
pub use error::AllocError;
pub use header::{ALLOC_MAGIC, FREE_MAGIC};
pub use heap::{BlockInfo, Heap, Reclaim, RegionInfo};
pub use policy::{Policy, PolicyTable, Strategy, NUM_POLICIES};
pub use traits::{NoRelief, PressureRelief};

/// Function pointer types for type-erased heap access
type AllocFn = unsafe fn(*mut (), usize, usize) -> *mut u8;
type ReleaseFn = unsafe fn(*mut (), *mut u8);
type ResizeFn = unsafe fn(*mut (), *mut u8, usize, usize) -> *mut u8;
type RegisterFn = unsafe fn(*mut (), *mut u8, usize, *const PolicyTable);

/// Size of the global heap storage; `Heap<R>` must fit inside.
const HEAP_STORAGE_SIZE: usize = 256;

/// Type-erased storage for the global heap
///
/// The heap is stored as raw bytes and accessed through function
/// pointers recorded at init time, so the global allocator works with
/// any pressure-relief provider without naming its type.
struct HeapStorage {
    /// Whether the heap has been initialised
    initialised: AtomicBool,
    /// Raw storage for the heap value
    storage: UnsafeCell<[u8; HEAP_STORAGE_SIZE]>,
    /// Pointer to the heap inside `storage`
    heap_ptr: UnsafeCell<*mut ()>,
    alloc_fn: UnsafeCell<Option<AllocFn>>,
    release_fn: UnsafeCell<Option<ReleaseFn>>,
    resize_fn: UnsafeCell<Option<ResizeFn>>,
    register_fn: UnsafeCell<Option<RegisterFn>>,
}

// SAFETY: all access to the cells happens under HEAP_LOCK, and the
// initialised flag is an atomic.
unsafe impl Sync for HeapStorage {}

impl HeapStorage {
    const fn new() -> Self {
        Self {
            initialised: AtomicBool::new(false),
            storage: UnsafeCell::new([0u8; HEAP_STORAGE_SIZE]),
            heap_ptr: UnsafeCell::new(ptr::null_mut()),
            alloc_fn: UnsafeCell::new(None),
            release_fn: UnsafeCell::new(None),
            resize_fn: UnsafeCell::new(None),
            register_fn: UnsafeCell::new(None),
        }
    }
}

static HEAP_STORAGE: HeapStorage = HeapStorage::new();

/// Serialises every access to the global heap storage.
static HEAP_LOCK: lock::HeapLock = lock::HeapLock::new();

/// Install `heap` as the process-wide heap behind [`GlobalHeap`].
///
/// Regions can be contributed before or after this call through
/// [`Heap::register_region`] or the global [`register_region`].
///
/// # Safety
///
/// - Must be called exactly once, before any allocation through
///   [`GlobalHeap`]
/// - Every region registered with the heap must stay valid for the rest
///   of the program
pub unsafe fn init<R: PressureRelief + 'static>(heap: Heap<R>) -> Result<(), AllocError> {
    HEAP_LOCK.with(|| {
        if HEAP_STORAGE.initialised.load(Ordering::Acquire) {
            return Err(AllocError::AlreadyInitialised);
        }

        let size = size_of::<Heap<R>>();
        let align = align_of::<Heap<R>>();
        if size > HEAP_STORAGE_SIZE {
            return Err(AllocError::InvalidConfig);
        }

        // SAFETY: we hold the lock and the storage is not initialised yet.
        unsafe {
            let base = (*HEAP_STORAGE.storage.get()).as_mut_ptr() as usize;
            let aligned = (base + align - 1) & !(align - 1);
            if aligned - base + size > HEAP_STORAGE_SIZE {
                return Err(AllocError::InvalidConfig);
            }

            let location = aligned as *mut Heap<R>;
            ptr::write(location, heap);

            *HEAP_STORAGE.heap_ptr.get() = location as *mut ();
            *HEAP_STORAGE.alloc_fn.get() = Some(alloc_impl::<R>);
            *HEAP_STORAGE.release_fn.get() = Some(release_impl::<R>);
            *HEAP_STORAGE.resize_fn.get() = Some(resize_impl::<R>);
            *HEAP_STORAGE.register_fn.get() = Some(register_impl::<R>);
        }

        HEAP_STORAGE.initialised.store(true, Ordering::Release);
        Ok(())
    })
}

/// Whether the global heap is initialised.
pub fn is_initialised() -> bool {
    HEAP_STORAGE.initialised.load(Ordering::Acquire)
}

/// Contribute a memory range to the global heap.
///
/// Ignored (with a warning) when the global heap is not initialised.
///
/// # Safety
/// As for [`Heap::register_region`]; the range must additionally stay
/// valid for the rest of the program.
pub unsafe fn register_region(addr: *mut u8, size: usize, policies: &PolicyTable) {
    if !is_initialised() {
        log::warn!("region {:#x} registered before heap init, dropped", addr as usize);
        return;
    }
    HEAP_LOCK.with(|| {
        // SAFETY: initialised is true, so the pointers were recorded.
        unsafe {
            let register = (*HEAP_STORAGE.register_fn.get()).unwrap_unchecked();
            register(*HEAP_STORAGE.heap_ptr.get(), addr, size, policies);
        }
    })
}

unsafe fn alloc_impl<R: PressureRelief>(heap: *mut (), align: usize, size: usize) -> *mut u8 {
    let heap = unsafe { &mut *(heap as *mut Heap<R>) };
    heap.allocate_aligned(align, size)
}

unsafe fn release_impl<R: PressureRelief>(heap: *mut (), ptr: *mut u8) {
    let heap = unsafe { &mut *(heap as *mut Heap<R>) };
    // SAFETY: caller guarantees ptr came from this heap.
    unsafe { heap.release(ptr) }
}

unsafe fn resize_impl<R: PressureRelief>(
    heap: *mut (),
    ptr: *mut u8,
    align: usize,
    size: usize,
) -> *mut u8 {
    let heap = unsafe { &mut *(heap as *mut Heap<R>) };
    // SAFETY: caller guarantees ptr came from this heap.
    unsafe { heap.resize_aligned_policy(ptr, align, size, Policy::Default) }
}

unsafe fn register_impl<R: PressureRelief>(
    heap: *mut (),
    addr: *mut u8,
    size: usize,
    policies: *const PolicyTable,
) {
    let heap = unsafe { &mut *(heap as *mut Heap<R>) };
    // SAFETY: caller guarantees the range per register_region's contract.
    unsafe { heap.register_region(addr, size, &*policies) }
}

/// Global allocator wrapper over the heap installed with [`init`].
///
/// # Example
///
/// ```ignore
/// #[global_allocator]
/// static ALLOCATOR: ember_alloc::GlobalHeap = ember_alloc::GlobalHeap;
/// ```
pub struct GlobalHeap;

unsafe impl GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !is_initialised() {
            return ptr::null_mut();
        }

        // Zero-size allocations per the GlobalAlloc contract.
        if layout.size() == 0 {
            return layout.align() as *mut u8;
        }

        HEAP_LOCK.with(|| {
            // SAFETY: initialised is true, so the pointers were recorded.
            unsafe {
                let alloc = (*HEAP_STORAGE.alloc_fn.get()).unwrap_unchecked();
                alloc(*HEAP_STORAGE.heap_ptr.get(), layout.align(), layout.size())
            }
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if !is_initialised() || ptr.is_null() || layout.size() == 0 {
            return;
        }

        HEAP_LOCK.with(|| {
            // SAFETY: initialised is true, so the pointers were recorded.
            unsafe {
                let release = (*HEAP_STORAGE.release_fn.get()).unwrap_unchecked();
                release(*HEAP_STORAGE.heap_ptr.get(), ptr);
            }
        })
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if !is_initialised() {
            return ptr::null_mut();
        }

        // A zero-size "allocation" is a bare aligned address, not a
        // block; treat growth from it as a fresh allocation.
        if layout.size() == 0 {
            let new_layout = match Layout::from_size_align(new_size, layout.align()) {
                Ok(l) => l,
                Err(_) => return ptr::null_mut(),
            };
            return unsafe { self.alloc(new_layout) };
        }

        HEAP_LOCK.with(|| {
            // SAFETY: initialised is true, so the pointers were recorded.
            unsafe {
                let resize = (*HEAP_STORAGE.resize_fn.get()).unwrap_unchecked();
                resize(
                    *HEAP_STORAGE.heap_ptr.get(),
                    ptr,
                    layout.align(),
                    new_size,
                )
            }
        })
    }
}
