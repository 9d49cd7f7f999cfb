//! The page-provider contract: the only way the arena obtains or releases
//! OS virtual memory. `Arena` is generic over `PageProvider` so tests can
//! swap in an in-memory fake instead of touching real `sbrk`/`mmap` state,
//! and so a consumer can pick the Unix or Windows implementation (or
//! supply their own) at the call site.

/// Primitives the arena consumes to grow and shrink its backing memory.
pub trait PageProvider {
    /// Advance the program break by `n` bytes, returning the former break
    /// address (the start of the newly available region), or null on
    /// failure. Called only in `HEAP_BATCH`-sized increments.
    fn extend_break(&mut self, n: usize) -> *mut u8;

    /// Return a fresh, zero-filled, page-aligned region of `n` bytes, or
    /// null on failure. Used only for requests above the mmap threshold.
    fn map_anonymous(&mut self, n: usize) -> *mut u8;

    /// Resize a mapped region in place if possible, otherwise relocate it.
    /// `old_size`/`new_size` are the previous and requested sizes. Returns
    /// the (possibly moved) region, or null on failure (in which case
    /// `ptr` is left valid at its old size).
    fn remap(&mut self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8;

    /// Release a mapped region obtained from `map_anonymous` or `remap`.
    fn unmap(&mut self, ptr: *mut u8, size: usize);
}

#[cfg(unix)]
pub use unix::UnixPageProvider;
#[cfg(windows)]
pub use windows::WindowsPageProvider;

#[cfg(unix)]
mod unix {
    use super::PageProvider;
    use core::ptr::null_mut;
    use libc::{c_void, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
    use log::warn;

    /// Page provider backed by `sbrk`/`mmap`/`munmap` (and `mremap` on
    /// Linux, where it's available as a native resize-in-place syscall).
    #[derive(Default)]
    pub struct UnixPageProvider;

    impl UnixPageProvider {
        pub fn new() -> Self {
            UnixPageProvider
        }
    }

    impl PageProvider for UnixPageProvider {
        fn extend_break(&mut self, n: usize) -> *mut u8 {
            #[allow(deprecated)]
            let prev = unsafe { libc::sbrk(n as libc::intptr_t) };
            if prev as isize == -1 {
                warn!("sbrk({}) failed: errno {}", n, errno::errno());
                return null_mut();
            }
            prev as *mut u8
        }

        fn map_anonymous(&mut self, n: usize) -> *mut u8 {
            let p = unsafe {
                libc::mmap(
                    null_mut(),
                    n,
                    PROT_READ | PROT_WRITE,
                    MAP_PRIVATE | MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if p == MAP_FAILED {
                warn!("mmap({}) failed: errno {}", n, errno::errno());
                return null_mut();
            }
            p as *mut u8
        }

        #[cfg(target_os = "linux")]
        fn remap(&mut self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
            let p = unsafe {
                libc::mremap(ptr as *mut c_void, old_size, new_size, libc::MREMAP_MAYMOVE)
            };
            if p == MAP_FAILED {
                warn!(
                    "mremap(ptr {:p}, {} -> {}) failed: errno {}",
                    ptr,
                    old_size,
                    new_size,
                    errno::errno()
                );
                return null_mut();
            }
            p as *mut u8
        }

        #[cfg(not(target_os = "linux"))]
        fn remap(&mut self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
            // No native remap primitive: allocate fresh, copy the
            // overlapping prefix, release the old mapping.
            let fresh = self.map_anonymous(new_size);
            if fresh.is_null() {
                return null_mut();
            }
            let copy_len = old_size.min(new_size);
            unsafe {
                core::ptr::copy_nonoverlapping(ptr, fresh, copy_len);
            }
            self.unmap(ptr, old_size);
            fresh
        }

        fn unmap(&mut self, ptr: *mut u8, size: usize) {
            let err = unsafe { libc::munmap(ptr as *mut c_void, size) };
            if err != 0 {
                warn!(
                    "munmap(ptr {:p}, {}) failed: errno {}",
                    ptr,
                    size,
                    errno::errno()
                );
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::PageProvider;
    use core::ptr::null_mut;
    use log::warn;
    use winapi::shared::minwindef::LPVOID;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
    use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

    /// Page provider built on `VirtualAlloc`/`VirtualFree`. Windows has no
    /// program-break primitive, so `extend_break` reserves a large address
    /// range once and commits pages into it on demand, mirroring the
    /// teacher crate's `win_virtual_alloc` shape.
    pub struct WindowsPageProvider {
        reserved_base: *mut u8,
        reserved_size: usize,
        committed: usize,
    }

    const RESERVE_SIZE: usize = 1 << 34; // 16 GiB of address space, mostly never committed.

    unsafe impl Send for WindowsPageProvider {}

    impl Default for WindowsPageProvider {
        fn default() -> Self {
            WindowsPageProvider {
                reserved_base: null_mut(),
                reserved_size: 0,
                committed: 0,
            }
        }
    }

    impl WindowsPageProvider {
        pub fn new() -> Self {
            Self::default()
        }

        fn ensure_reserved(&mut self) -> bool {
            if !self.reserved_base.is_null() {
                return true;
            }
            let base = unsafe {
                VirtualAlloc(null_mut(), RESERVE_SIZE, MEM_RESERVE, PAGE_READWRITE)
            };
            if base.is_null() {
                warn!("VirtualAlloc(MEM_RESERVE) failed");
                return false;
            }
            self.reserved_base = base as *mut u8;
            self.reserved_size = RESERVE_SIZE;
            true
        }
    }

    impl PageProvider for WindowsPageProvider {
        fn extend_break(&mut self, n: usize) -> *mut u8 {
            if !self.ensure_reserved() {
                return null_mut();
            }
            if self.committed + n > self.reserved_size {
                warn!("heap reservation of {} bytes exhausted", self.reserved_size);
                return null_mut();
            }
            let at = unsafe { self.reserved_base.add(self.committed) };
            let committed = unsafe {
                VirtualAlloc(at as LPVOID, n, MEM_COMMIT, PAGE_READWRITE)
            };
            if committed.is_null() {
                warn!("VirtualAlloc(MEM_COMMIT, {}) failed", n);
                return null_mut();
            }
            self.committed += n;
            at
        }

        fn map_anonymous(&mut self, n: usize) -> *mut u8 {
            let p = unsafe {
                VirtualAlloc(null_mut(), n, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE)
            };
            if p.is_null() {
                warn!("VirtualAlloc({}) failed", n);
                return null_mut();
            }
            p as *mut u8
        }

        fn remap(&mut self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
            let fresh = self.map_anonymous(new_size);
            if fresh.is_null() {
                return null_mut();
            }
            let copy_len = old_size.min(new_size);
            unsafe {
                core::ptr::copy_nonoverlapping(ptr, fresh, copy_len);
            }
            self.unmap(ptr, old_size);
            fresh
        }

        fn unmap(&mut self, ptr: *mut u8, _size: usize) {
            let ok = unsafe { VirtualFree(ptr as LPVOID, 0, MEM_RELEASE) };
            if ok == 0 {
                warn!("VirtualFree({:p}) failed", ptr);
            }
        }
    }
}

/// An in-memory page provider used by this crate's own test suite (unit
/// tests in `src/`, and the scenario tests under `tests/`), so tests don't
/// depend on real OS memory state and can run concurrently without
/// fighting over the one real process break. Not gated behind `cfg(test)`
/// because the `tests/` integration binaries link the library without
/// that cfg; exported plainly instead, the way a library exposes test
/// fixtures it wants external integration tests to reuse.
pub struct FakePageProvider {
    heap: Box<[u8]>,
    used: usize,
}

impl FakePageProvider {
    pub fn new(capacity: usize) -> Self {
        FakePageProvider {
            heap: vec![0u8; capacity].into_boxed_slice(),
            used: 0,
        }
    }
}

impl PageProvider for FakePageProvider {
    fn extend_break(&mut self, n: usize) -> *mut u8 {
        if self.used + n > self.heap.len() {
            log::warn!("fake heap of {} bytes exhausted", self.heap.len());
            return core::ptr::null_mut();
        }
        let base = unsafe { self.heap.as_mut_ptr().add(self.used) };
        self.used += n;
        base
    }

    fn map_anonymous(&mut self, n: usize) -> *mut u8 {
        let layout = std::alloc::Layout::from_size_align(n, 16).unwrap();
        unsafe { std::alloc::alloc_zeroed(layout) }
    }

    fn remap(&mut self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
        let old_layout = std::alloc::Layout::from_size_align(old_size, 16).unwrap();
        unsafe { std::alloc::realloc(ptr, old_layout, new_size) }
    }

    fn unmap(&mut self, ptr: *mut u8, size: usize) {
        let layout = std::alloc::Layout::from_size_align(size, 16).unwrap();
        unsafe { std::alloc::dealloc(ptr, layout) }
    }
}
