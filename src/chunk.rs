//! Boundary-tag encoding: the head/foot metadata word every chunk carries,
//! and the validation test used to tell a real chunk boundary from garbage
//! while coalescing.
//!
//! The canonical two status bits (`occupied`, `mapped`) live at bits 0-1.
//! This crate uses a third bit, `fast`, at bit 2: chunks sitting in the fast
//! array (§4.4.4) are stamped `occupied = true, fast = true` rather than
//! `occupied = false`, so a backward/forward coalescing scan (§4.4.5) can
//! never mistake one for a coalescable free neighbour — it reads as
//! "in use" structurally, not by convention. `free()`'s double-free check
//! still needs to recognise such a chunk as already freed, which is what
//! the `fast` bit is for. Chunk sizes are always multiples of 16 (`ALIGN`),
//! so three status bits fit comfortably below the size field without
//! narrowing the encodable range.

use crate::types::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, WORD_SIZE};

const OCCUPIED_BIT: usize = 1;
const MAPPED_BIT: usize = 1 << 1;
const FAST_BIT: usize = 1 << 2;
const STATUS_MASK: usize = OCCUPIED_BIT | MAPPED_BIT | FAST_BIT;
const SIZE_MASK: usize = !STATUS_MASK;

/// A chunk's status: whether it's in use, whether it came from the large
/// mapping path, and whether it's currently parked in the fast array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub occupied: bool,
    pub mapped: bool,
    pub fast: bool,
}

/// Pack a chunk's size and status bits into a single metadata word.
///
/// `size` must already be `ALIGN`-padded; its low bits are assumed zero
/// and are overwritten by the status bits.
#[inline]
pub fn encode(size: usize, status: Status) -> usize {
    debug_assert_eq!(size & STATUS_MASK, 0);
    size
        | (status.occupied as usize)
        | ((status.mapped as usize) << 1)
        | ((status.fast as usize) << 2)
}

/// Unpack a metadata word into its size and `Status`.
#[inline]
pub fn decode(word: usize) -> (usize, Status) {
    (
        word & SIZE_MASK,
        Status {
            occupied: word & OCCUPIED_BIT != 0,
            mapped: word & MAPPED_BIT != 0,
            fast: word & FAST_BIT != 0,
        },
    )
}

/// Does `word`'s encoded size fall in the legal chunk-size range? Used as
/// the "is this a trustworthy chunk boundary" test during coalescing: a
/// word read from arbitrary memory (a stray neighbour) is accepted only if
/// its size component could plausibly be a real chunk. This rejects the
/// one forbidden bit pattern named in §4.5 as a side effect: an
/// uninitialized (all-zero) word decodes to size 0, which fails the range
/// check below.
#[inline]
pub fn is_plausible(word: usize) -> bool {
    let (size, _) = decode(word);
    size >= MIN_CHUNK_SIZE && size <= MAX_CHUNK_SIZE && size % crate::types::ALIGN == 0
}

/// Read the metadata word at a chunk address.
///
/// # Safety
/// `chunk` must point to at least `WORD_SIZE` readable bytes.
#[inline]
pub unsafe fn read_head(chunk: *const u8) -> usize {
    *(chunk as *const usize)
}

/// Write a chunk's head word (and, for heap chunks, its foot word — the
/// last `WORD_SIZE` bytes of the chunk). Mapped chunks have no foot word;
/// pass `has_foot = false` for them.
///
/// # Safety
/// `chunk` must point to a chunk of at least `size` writable bytes, and
/// `size` must be the size encoded in `word`.
#[inline]
pub unsafe fn write_meta(chunk: *mut u8, size: usize, word: usize, has_foot: bool) {
    *(chunk as *mut usize) = word;
    if has_foot {
        let foot = chunk.add(size - WORD_SIZE) as *mut usize;
        *foot = word;
    }
}

/// One past the last byte of the chunk at `chunk` with the given `size`.
#[inline]
pub unsafe fn end_of(chunk: *mut u8, size: usize) -> *mut u8 {
    chunk.add(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(occupied: bool, mapped: bool, fast: bool) -> Status {
        Status { occupied, mapped, fast }
    }

    #[test]
    fn round_trips() {
        let w = encode(48, status(true, false, false));
        assert_eq!(decode(w), (48, status(true, false, false)));
        let w = encode(200_000, status(true, true, false));
        assert_eq!(decode(w), (200_000, status(true, true, false)));
        let w = encode(96, status(false, false, false));
        assert_eq!(decode(w), (96, status(false, false, false)));
        let w = encode(96, status(true, false, true));
        assert_eq!(decode(w), (96, status(true, false, true)));
    }

    #[test]
    fn plausibility_range() {
        assert!(is_plausible(encode(32, status(false, false, false))));
        assert!(is_plausible(encode(MAX_CHUNK_SIZE, status(true, false, false))));
        assert!(!is_plausible(encode(16, status(false, false, false))));
        assert!(!is_plausible(0));
    }
}
