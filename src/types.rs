//! Tunable constants and the size-class math shared by the chunk, free-list
//! and policy modules.

use core::mem::size_of;

/// Size of a head/foot metadata word.
pub const WORD_SIZE: usize = size_of::<usize>();

/// Every chunk is padded to a multiple of this many bytes.
pub const ALIGN: usize = 16;

/// Smallest chunk the allocator ever hands out (head + foot + two free-list
/// pointers, rounded up to `ALIGN`).
pub const MIN_CHUNK_SIZE: usize = 32;

/// Largest chunk size the boundary-tag encoding can represent.
pub const MAX_CHUNK_SIZE: usize = 33_554_432;

/// Requests whose rounded chunk size exceeds this go straight to the
/// page provider's anonymous-mapping path instead of the heap.
pub const MMAP_THRESHOLD: usize = 131_072;

/// Chunk sizes at or below this go through the fast array instead of the
/// bins on both `alloc` and `free`.
pub const FAST_MAX: usize = 104;

/// Frees at or above this size flush the fast array first, since a large
/// free benefits from having small, coalesceable neighbours.
pub const FAST_CONSOLIDATE: usize = 65_536;

/// Number of free-list heads in the fast array.
pub const FAST_BINS: usize = 10;

/// Number of free-list heads in the bin array.
pub const BINS: usize = 126;

/// Geometric base for the large size classes.
pub const BIG_BIN_BASE: f64 = 1.125;

/// Requests at or below this use the linear small-class formula; above it,
/// the geometric large-class formula takes over.
pub const MAX_SMALL_BIN_SIZE: usize = 1024;

/// The page provider grows the heap in batches of this many bytes.
pub const HEAP_BATCH: usize = MMAP_THRESHOLD;

/// Round `request + 2*WORD_SIZE` up to `ALIGN`, with a floor of
/// `MIN_CHUNK_SIZE`. `request` is the number of payload bytes the caller
/// asked for.
#[inline]
pub fn chunk_size_for(request: usize) -> usize {
    let with_header = request.saturating_add(2 * WORD_SIZE);
    let rounded = (with_header + (ALIGN - 1)) / ALIGN * ALIGN;
    rounded.max(MIN_CHUNK_SIZE)
}

/// Size-class index for a chunk of `size` bytes, shared by the fast and
/// bin arrays. Sizes at or below `MAX_SMALL_BIN_SIZE` use the linear
/// 16-byte-step formula; larger sizes use the 1.125 geometric formula.
#[inline]
pub fn class_for(size: usize) -> usize {
    if size <= MAX_SMALL_BIN_SIZE {
        let index = (size / ALIGN) as isize - 2;
        index.max(0) as usize
    } else {
        let ratio = size as f64 / MAX_SMALL_BIN_SIZE as f64;
        62 + ratio.log(BIG_BIN_BASE).floor() as usize
    }
}

/// Payload pointer from a chunk (head-word) address.
#[inline]
pub unsafe fn payload_of(chunk: *mut u8) -> *mut u8 {
    chunk.add(WORD_SIZE)
}

/// Chunk (head-word) address from a payload pointer.
#[inline]
pub unsafe fn chunk_of(payload: *mut u8) -> *mut u8 {
    payload.sub(WORD_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_rounds_and_floors() {
        assert_eq!(chunk_size_for(0), MIN_CHUNK_SIZE);
        assert_eq!(chunk_size_for(24), 48);
        assert_eq!(chunk_size_for(1000), 1024);
        assert_eq!(chunk_size_for(64), 80);
    }

    #[test]
    fn small_classes_match_reference() {
        assert_eq!(class_for(32), 0);
        assert_eq!(class_for(48), 1);
        assert_eq!(class_for(80), 3);
        assert_eq!(class_for(1024), 62);
    }

    #[test]
    fn large_classes_start_past_small_range() {
        assert_eq!(class_for(1040), 62);
        assert!(class_for(2048) > 62);
    }
}
