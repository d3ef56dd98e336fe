//! Cell arithmetic
//!
//! The heap is managed in cells rather than bytes. A cell is the size of
//! a block header, so the header of every block occupies exactly one cell
//! and every header sits on a cell boundary.

/// Log2 of the cell size. One cell is 16 bytes on 32-bit targets and
/// 32 bytes on 64-bit targets, matching four pointer-sized header fields.
#[cfg(target_pointer_width = "32")]
pub const CELL_SHIFT: usize = 4;
#[cfg(target_pointer_width = "64")]
pub const CELL_SHIFT: usize = 5;

/// Size of one cell in bytes. Always a power of two.
pub const CELL_SIZE: usize = 1 << CELL_SHIFT;

/// Round `addr` up to a multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// Number of cells needed to hold `bytes` bytes of payload.
#[inline]
pub fn cells_for(bytes: usize) -> usize {
    bytes.div_ceil(CELL_SIZE)
}

/// Convert a byte alignment to an alignment in cells.
///
/// Alignments at or below the cell size collapse to 1 because every cell
/// boundary already satisfies them; an alignment of zero means natural
/// cell alignment.
#[inline]
pub fn align_in_cells(align: usize) -> usize {
    let cells = align >> CELL_SHIFT;
    if cells == 0 { 1 } else { cells }
}

/// Whether `addr` sits on a cell boundary.
#[inline]
pub fn is_cell_aligned(addr: usize) -> bool {
    addr.is_multiple_of(CELL_SIZE)
}
