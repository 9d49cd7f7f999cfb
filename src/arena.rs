//! The allocation policy: fast array, segregated bins, the wilderness
//! ("top") chunk at the end of committed heap memory, and the mmap path
//! for large requests. This is where `alloc`/`zalloc`/`realloc`/`free`
//! live; everything below it (`chunk`, `freelist`, `os`) is mechanism.
//!
//! Grounded closely on `malloc.cpp`'s `stdlike::malloc/calloc/realloc/free`
//! and its `utils::MergeNeighbours`/`FreePtr`/`GetBin`/`GetFast` helpers:
//! same size-class split between a non-coalescing fast cache and a
//! coalesced bin array, same boundary-tag neighbour scan gated on a
//! plausibility check rather than tracked region bounds.

use core::ptr::null_mut;

use crate::chunk::{self, Status};
use crate::config::Config;
use crate::diagnostics::{self, Fault};
use crate::freelist;
use crate::os::PageProvider;
use crate::types::{
    self, chunk_of, chunk_size_for, class_for, payload_of, BINS, FAST_BINS, FAST_MAX,
    MMAP_THRESHOLD, WORD_SIZE,
};

/// A single arena: one heap, one page provider, one set of free-list
/// arrays. Not `Sync` on its own — callers needing shared access wrap it
/// in a mutex, as `LockedHeap` in `lib.rs` does.
pub struct Arena<P: PageProvider> {
    page_provider: P,
    config: Config,
    /// First address ever returned by `extend_break`. Backward coalescing
    /// never reads before this address, so it never dereferences memory
    /// the provider hasn't committed.
    heap_origin: *mut u8,
    /// The wilderness chunk: always-free memory at the end of the
    /// committed heap, not tracked in `bins`. Null/zero when no heap has
    /// been grown yet.
    top: *mut u8,
    top_size: usize,
    fast: [*mut u8; FAST_BINS],
    bins: [*mut u8; BINS],
}

// Raw pointers are the only non-`Send` fields, and they never alias
// across threads without a lock around the whole `Arena` (see
// `LockedHeap`), so it's sound to hand this to another thread wholesale.
unsafe impl<P: PageProvider + Send> Send for Arena<P> {}

impl<P: PageProvider> Arena<P> {
    /// Build an empty arena over `page_provider`, with default tunables.
    pub fn new(page_provider: P) -> Self {
        Self::with_config(page_provider, Config::default())
    }

    /// Build an empty arena with explicit tunables.
    pub fn with_config(page_provider: P, config: Config) -> Self {
        Arena {
            page_provider,
            config,
            heap_origin: null_mut(),
            top: null_mut(),
            top_size: 0,
            fast: [null_mut(); FAST_BINS],
            bins: [null_mut(); BINS],
        }
    }

    /// Allocate at least `size` bytes, uninitialized. Null on failure.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        let csize = chunk_size_for(size);
        if csize > MMAP_THRESHOLD {
            return unsafe { self.alloc_mapped(csize) };
        }
        if csize <= FAST_MAX {
            let class = class_for(csize).min(FAST_BINS - 1);
            let c = unsafe { freelist::pop(&mut self.fast, class) };
            if !c.is_null() {
                return unsafe { self.finish_exact_alloc(c, csize) };
            }
        }
        let class = class_for(csize).min(BINS - 1);
        let c = unsafe { freelist::find_fit(&mut self.bins, class, BINS - 1) };
        if !c.is_null() {
            return unsafe { self.carve_from_bin_chunk(c, csize) };
        }
        if self.top_size < csize {
            if !self.grow_heap(csize) {
                return null_mut();
            }
        }
        unsafe { self.carve_from_top(csize) }
    }

    /// Allocate `count * size` bytes, zeroed. Null on overflow or failure.
    pub fn zalloc(&mut self, count: usize, size: usize) -> *mut u8 {
        let total = match count.checked_mul(size) {
            Some(t) => t,
            None => return null_mut(),
        };
        let p = self.alloc(total);
        if !p.is_null() {
            unsafe { core::ptr::write_bytes(p, 0, total) };
        }
        p
    }

    /// Resize the allocation at `ptr` to `new_size` bytes, preserving the
    /// overlapping prefix. `ptr` may be null (behaves as `alloc`);
    /// `new_size` may be 0 (behaves as `free`, returns null).
    pub fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(new_size);
        }
        if new_size == 0 {
            self.free(ptr);
            return null_mut();
        }
        let chunk = unsafe { chunk_of(ptr) };
        let word = unsafe { chunk::read_head(chunk) };
        let (old_size, status) = chunk::decode(word);
        if !chunk::is_plausible(word) || !status.occupied || status.fast {
            diagnostics::raise(Fault::InvalidPointer);
        }

        let new_csize = chunk_size_for(new_size);

        if status.mapped {
            return unsafe { self.realloc_mapped(chunk, old_size, new_csize) };
        }
        if new_csize <= old_size {
            // No shrink-release: a smaller request is satisfied from the
            // same chunk unchanged, matching the non-mapped `realloc`
            // contract exactly.
            return unsafe { payload_of(chunk) };
        }
        if let Some(grown) = unsafe { self.try_grow_in_place(chunk, old_size, new_csize) } {
            return grown;
        }
        unsafe { self.realloc_by_copy(ptr, old_size, new_size) }
    }

    /// Release the allocation at `ptr`. Aborts (via the diagnostics hook)
    /// if `ptr` doesn't look like a live allocation from this arena.
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let chunk = unsafe { chunk_of(ptr) };
        let word = unsafe { chunk::read_head(chunk) };
        if !chunk::is_plausible(word) {
            diagnostics::raise(Fault::InvalidPointer);
        }
        let (size, status) = chunk::decode(word);
        if !status.occupied || status.fast {
            diagnostics::raise(Fault::DoubleFree);
        }
        if status.mapped {
            self.page_provider.unmap(chunk, size);
            return;
        }
        if size >= self.config.fast_consolidate {
            self.flush_fast();
        }
        if size <= FAST_MAX {
            unsafe {
                chunk::write_meta(
                    chunk,
                    size,
                    chunk::encode(
                        size,
                        Status {
                            occupied: true,
                            mapped: false,
                            fast: true,
                        },
                    ),
                    true,
                );
                freelist::insert(&mut self.fast, class_for(size).min(FAST_BINS - 1), chunk);
            }
            return;
        }
        unsafe { self.release_free_chunk(chunk, size) };
    }

    // -- internal helpers ---------------------------------------------

    unsafe fn alloc_mapped(&mut self, csize: usize) -> *mut u8 {
        let region = self.page_provider.map_anonymous(csize);
        if region.is_null() {
            return null_mut();
        }
        chunk::write_meta(
            region,
            csize,
            chunk::encode(
                csize,
                Status {
                    occupied: true,
                    mapped: true,
                    fast: false,
                },
            ),
            false,
        );
        payload_of(region)
    }

    unsafe fn realloc_mapped(&mut self, chunk: *mut u8, old_size: usize, new_csize: usize) -> *mut u8 {
        let moved = self.page_provider.remap(chunk, old_size, new_csize);
        if moved.is_null() {
            return null_mut();
        }
        chunk::write_meta(
            moved,
            new_csize,
            chunk::encode(
                new_csize,
                Status {
                    occupied: true,
                    mapped: true,
                    fast: false,
                },
            ),
            false,
        );
        payload_of(moved)
    }

    unsafe fn realloc_by_copy(&mut self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
        let fresh = self.alloc(new_size);
        if fresh.is_null() {
            return null_mut();
        }
        let old_payload_len = old_size - 2 * WORD_SIZE;
        core::ptr::copy_nonoverlapping(ptr, fresh, old_payload_len.min(new_size));
        self.free(ptr);
        fresh
    }

    /// Hand out a chunk whose stored size already equals `csize` exactly
    /// (the fast-array case: no splitting, since fast chunks are never
    /// larger than what they were classed for).
    unsafe fn finish_exact_alloc(&mut self, chunk: *mut u8, csize: usize) -> *mut u8 {
        chunk::write_meta(
            chunk,
            csize,
            chunk::encode(
                csize,
                Status {
                    occupied: true,
                    mapped: false,
                    fast: false,
                },
            ),
            true,
        );
        payload_of(chunk)
    }

    /// Carve `csize` bytes out of a bin chunk just popped by `find_fit`,
    /// splitting the remainder back into `bins` if it's big enough to be
    /// a chunk on its own.
    unsafe fn carve_from_bin_chunk(&mut self, chunk: *mut u8, csize: usize) -> *mut u8 {
        let (actual_size, _) = chunk::decode(chunk::read_head(chunk));
        let remainder = actual_size - csize;
        if remainder >= types::MIN_CHUNK_SIZE {
            chunk::write_meta(
                chunk,
                csize,
                chunk::encode(
                    csize,
                    Status {
                        occupied: true,
                        mapped: false,
                        fast: false,
                    },
                ),
                true,
            );
            let rest = chunk.add(csize);
            chunk::write_meta(
                rest,
                remainder,
                chunk::encode(
                    remainder,
                    Status {
                        occupied: false,
                        mapped: false,
                        fast: false,
                    },
                ),
                true,
            );
            freelist::insert(&mut self.bins, class_for(remainder).min(BINS - 1), rest);
        } else {
            chunk::write_meta(
                chunk,
                actual_size,
                chunk::encode(
                    actual_size,
                    Status {
                        occupied: true,
                        mapped: false,
                        fast: false,
                    },
                ),
                true,
            );
        }
        payload_of(chunk)
    }

    /// Carve `csize` bytes off the front of the wilderness chunk.
    unsafe fn carve_from_top(&mut self, csize: usize) -> *mut u8 {
        let remainder = self.top_size - csize;
        let chunk = self.top;
        if remainder < types::MIN_CHUNK_SIZE {
            // Remainder too small to stand as its own chunk: hand out
            // the whole wilderness instead of splitting it.
            let whole = csize + remainder;
            self.top = null_mut();
            self.top_size = 0;
            chunk::write_meta(
                chunk,
                whole,
                chunk::encode(
                    whole,
                    Status {
                        occupied: true,
                        mapped: false,
                        fast: false,
                    },
                ),
                true,
            );
            return payload_of(chunk);
        }
        self.top = chunk.add(csize);
        self.top_size = remainder;
        chunk::write_meta(
            self.top,
            remainder,
            chunk::encode(
                remainder,
                Status {
                    occupied: false,
                    mapped: false,
                    fast: false,
                },
            ),
            true,
        );
        chunk::write_meta(
            chunk,
            csize,
            chunk::encode(
                csize,
                Status {
                    occupied: true,
                    mapped: false,
                    fast: false,
                },
            ),
            true,
        );
        payload_of(chunk)
    }

    /// Grow the heap so the wilderness chunk holds at least `need` bytes.
    ///
    /// Sized off `need` rather than `need - top_size`: if the provider
    /// happens to hand back a disjoint region (not contiguous with the
    /// current wilderness), the old `top` is released separately and
    /// doesn't contribute to the new one, so the new region has to cover
    /// `need` on its own.
    fn grow_heap(&mut self, need: usize) -> bool {
        let batch = ((need + self.config.heap_batch - 1) / self.config.heap_batch).max(1)
            * self.config.heap_batch;
        let extended = self.page_provider.extend_break(batch);
        if extended.is_null() {
            return false;
        }
        if self.heap_origin.is_null() {
            self.heap_origin = extended;
        }
        let contiguous = !self.top.is_null() && extended == unsafe { self.top.add(self.top_size) };
        if contiguous {
            self.top_size += batch;
        } else {
            if !self.top.is_null() {
                unsafe { self.release_free_chunk(self.top, self.top_size) };
            }
            self.top = extended;
            self.top_size = batch;
        }
        unsafe {
            chunk::write_meta(
                self.top,
                self.top_size,
                chunk::encode(
                    self.top_size,
                    Status {
                        occupied: false,
                        mapped: false,
                        fast: false,
                    },
                ),
                true,
            );
        }
        true
    }

    /// Pop every chunk out of the fast array and hand it to the
    /// coalescing path. Called before a large free and before any
    /// heap-exhaustion growth, so long-lived frees get the chance to
    /// merge with chunks that went through the fast cache.
    fn flush_fast(&mut self) {
        for class in 0..FAST_BINS {
            loop {
                let c = unsafe { freelist::pop(&mut self.fast, class) };
                if c.is_null() {
                    break;
                }
                let (size, _) = chunk::decode(unsafe { chunk::read_head(c) });
                unsafe { self.release_free_chunk(c, size) };
            }
        }
    }

    /// Whether a neighbour carrying `status` should be treated as a free,
    /// mergeable chunk during coalescing. Ordinarily just "not occupied";
    /// with `config.coalesce_fast` opted in, a chunk still parked in the
    /// fast array (`occupied = true, fast = true`) counts too, simulating
    /// the ordering-invariant-dependent design this crate otherwise avoids.
    fn mergeable_as_free(&self, status: Status) -> bool {
        !status.occupied || (self.config.coalesce_fast && status.fast)
    }

    /// Unlink a neighbour accepted by `mergeable_as_free` from whichever
    /// array it's actually filed in: `bins` if free, `fast` if it's a
    /// fast-cached chunk being merged under the `coalesce_fast` opt-in.
    unsafe fn detach_neighbor(&mut self, start: *mut u8, size: usize, status: Status) {
        if status.fast {
            freelist::detach(&mut self.fast, class_for(size).min(FAST_BINS - 1), start);
        } else {
            freelist::detach(&mut self.bins, class_for(size).min(BINS - 1), start);
        }
    }

    /// Merge `chunk` with any free neighbours, then file it into `bins`
    /// (or fold it into the wilderness chunk if it borders `top`).
    ///
    /// Neighbour words are trusted only after `chunk::is_plausible`
    /// accepts them; a previous chunk is read only when `chunk` is past
    /// `heap_origin`, so this never dereferences memory the page
    /// provider hasn't handed out.
    unsafe fn release_free_chunk(&mut self, chunk: *mut u8, size: usize) {
        let mut start = chunk;
        let mut total = size;

        if start != self.heap_origin {
            let prev_foot = *(start.sub(WORD_SIZE) as *const usize);
            if chunk::is_plausible(prev_foot) {
                let (psize, pstatus) = chunk::decode(prev_foot);
                if self.mergeable_as_free(pstatus) {
                    let pstart = start.sub(psize);
                    self.detach_neighbor(pstart, psize, pstatus);
                    start = pstart;
                    total += psize;
                }
            }
        }

        let next = start.add(total);
        if next != self.top {
            let next_head = *(next as *const usize);
            if chunk::is_plausible(next_head) {
                let (nsize, nstatus) = chunk::decode(next_head);
                if self.mergeable_as_free(nstatus) {
                    self.detach_neighbor(next, nsize, nstatus);
                    total += nsize;
                }
            }
        }

        if start.add(total) == self.top {
            self.top = start;
            self.top_size += total;
            chunk::write_meta(
                self.top,
                self.top_size,
                chunk::encode(
                    self.top_size,
                    Status {
                        occupied: false,
                        mapped: false,
                        fast: false,
                    },
                ),
                true,
            );
            return;
        }

        chunk::write_meta(
            start,
            total,
            chunk::encode(
                total,
                Status {
                    occupied: false,
                    mapped: false,
                    fast: false,
                },
            ),
            true,
        );
        freelist::insert(&mut self.bins, class_for(total).min(BINS - 1), start);
    }

    /// Try to satisfy a growing `realloc` without moving the allocation,
    /// by absorbing a free forward neighbour (or the wilderness chunk
    /// itself). Returns `None` if there's no room to grow in place.
    unsafe fn try_grow_in_place(
        &mut self,
        chunk: *mut u8,
        old_size: usize,
        new_csize: usize,
    ) -> Option<*mut u8> {
        let next = chunk.add(old_size);
        let needed = new_csize - old_size;

        if next == self.top && self.top_size >= needed {
            let grown = old_size + self.top_size;
            let remainder = grown - new_csize;
            if remainder >= types::MIN_CHUNK_SIZE {
                self.top = chunk.add(new_csize);
                self.top_size = remainder;
                chunk::write_meta(
                    self.top,
                    remainder,
                    chunk::encode(
                        remainder,
                        Status {
                            occupied: false,
                            mapped: false,
                            fast: false,
                        },
                    ),
                    true,
                );
                chunk::write_meta(
                    chunk,
                    new_csize,
                    chunk::encode(
                        new_csize,
                        Status {
                            occupied: true,
                            mapped: false,
                            fast: false,
                        },
                    ),
                    true,
                );
            } else {
                self.top = null_mut();
                self.top_size = 0;
                chunk::write_meta(
                    chunk,
                    grown,
                    chunk::encode(
                        grown,
                        Status {
                            occupied: true,
                            mapped: false,
                            fast: false,
                        },
                    ),
                    true,
                );
            }
            return Some(payload_of(chunk));
        }

        let next_head = *(next as *const usize);
        if !chunk::is_plausible(next_head) {
            return None;
        }
        let (nsize, nstatus) = chunk::decode(next_head);
        if nstatus.occupied || old_size + nsize < new_csize {
            return None;
        }
        freelist::detach(&mut self.bins, class_for(nsize).min(BINS - 1), next);
        let grown = old_size + nsize;
        let remainder = grown - new_csize;
        if remainder >= types::MIN_CHUNK_SIZE {
            let rest = chunk.add(new_csize);
            chunk::write_meta(
                rest,
                remainder,
                chunk::encode(
                    remainder,
                    Status {
                        occupied: false,
                        mapped: false,
                        fast: false,
                    },
                ),
                true,
            );
            freelist::insert(&mut self.bins, class_for(remainder).min(BINS - 1), rest);
            chunk::write_meta(
                chunk,
                new_csize,
                chunk::encode(
                    new_csize,
                    Status {
                        occupied: true,
                        mapped: false,
                        fast: false,
                    },
                ),
                true,
            );
        } else {
            chunk::write_meta(
                chunk,
                grown,
                chunk::encode(
                    grown,
                    Status {
                        occupied: true,
                        mapped: false,
                        fast: false,
                    },
                ),
                true,
            );
        }
        Some(payload_of(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::FakePageProvider;

    fn arena() -> Arena<FakePageProvider> {
        Arena::new(FakePageProvider::new(4 * 1024 * 1024))
    }

    #[test]
    fn alloc_then_free_then_alloc_reuses_memory() {
        let mut a = arena();
        let p1 = a.alloc(64);
        assert!(!p1.is_null());
        a.free(p1);
        let p2 = a.alloc(64);
        assert!(!p2.is_null());
    }

    #[test]
    fn zalloc_zeroes_reused_memory() {
        let mut a = arena();
        unsafe {
            let p = a.alloc(128);
            core::ptr::write_bytes(p, 0xAB, 128);
            a.free(p);
            let z = a.zalloc(1, 128);
            assert!(!z.is_null());
            for i in 0..128 {
                assert_eq!(*z.add(i), 0);
            }
        }
    }

    #[test]
    fn zalloc_overflow_returns_null() {
        let mut a = arena();
        assert!(a.zalloc(usize::MAX, 2).is_null());
    }

    #[test]
    fn realloc_grows_and_preserves_prefix() {
        let mut a = arena();
        unsafe {
            let p = a.alloc(32);
            core::ptr::write_bytes(p, 0x42, 32);
            let grown = a.realloc(p, 512);
            assert!(!grown.is_null());
            for i in 0..32 {
                assert_eq!(*grown.add(i), 0x42);
            }
        }
    }

    #[test]
    fn realloc_to_zero_frees_and_returns_null() {
        let mut a = arena();
        let p = a.alloc(48);
        assert!(a.realloc(p, 0).is_null());
    }

    #[test]
    fn double_free_raises_double_free_fault() {
        let _guard = diagnostics::TEST_LOCK.lock().unwrap();
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen2 = seen.clone();
        diagnostics::set_hook(move |fault| {
            assert_eq!(fault, Fault::DoubleFree);
            seen2.store(true, std::sync::atomic::Ordering::SeqCst);
            std::panic::panic_any("test-fault-unwind");
        });
        let mut a = arena();
        let p = a.alloc(64);
        a.free(p);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| a.free(p)));
        assert!(result.is_err());
        assert!(seen.load(std::sync::atomic::Ordering::SeqCst));
        diagnostics::reset_hook();
    }

    #[test]
    fn large_alloc_goes_through_mmap_path() {
        let mut a = arena();
        let p = a.alloc(MMAP_THRESHOLD + 16);
        assert!(!p.is_null());
        a.free(p);
    }

    #[test]
    fn fast_sized_free_is_reused_without_coalescing() {
        let mut a = arena();
        let p1 = a.alloc(48);
        a.free(p1);
        let p2 = a.alloc(48);
        assert_eq!(p1, p2);
    }

    #[test]
    fn exact_mmap_threshold_size_stays_on_heap() {
        let mut a = arena();
        unsafe {
            let p = a.alloc(MMAP_THRESHOLD - 2 * WORD_SIZE);
            assert!(!p.is_null());
            let (_, status) = chunk::decode(chunk::read_head(chunk_of(p)));
            assert!(!status.mapped);
            a.free(p);
        }
    }

    #[test]
    fn realloc_shrink_keeps_same_pointer_unchanged() {
        let mut a = arena();
        unsafe {
            let p = a.alloc(512);
            core::ptr::write_bytes(p, 0x9, 64);
            let shrunk = a.realloc(p, 64);
            assert_eq!(shrunk, p);
            for i in 0..64 {
                assert_eq!(*shrunk.add(i), 0x9);
            }
        }
    }

    #[test]
    fn coalesce_fast_opt_in_merges_fast_cached_neighbor() {
        let cfg = Config::default().with_coalesce_fast(true);
        let mut a = Arena::with_config(FakePageProvider::new(4 * 1024 * 1024), cfg);
        let p1 = a.alloc(48);
        let p2 = a.alloc(4096);
        a.free(p1);
        let class = class_for(chunk_size_for(48)).min(FAST_BINS - 1);
        assert!(!a.fast[class].is_null());
        a.free(p2);
        assert!(
            a.fast[class].is_null(),
            "fast-cached neighbor should have been merged by the coalesce_fast opt-in"
        );
    }
}
