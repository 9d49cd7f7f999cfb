//! A segregated free-list allocator: small and mid-size requests are
//! served from boundary-tag chunks held in size-classed free lists, a
//! non-coalescing fast cache absorbs the churn of short-lived small
//! allocations, and requests above the mmap threshold go straight to
//! anonymous mappings.
//!
//! The allocation policy (`Arena`) is generic over how it obtains memory
//! from the OS (`PageProvider`), so it can be driven by a real `sbrk`/
//! `mmap`-backed provider or by an in-memory fake for testing.

mod arena;
mod chunk;
mod config;
mod diagnostics;
mod freelist;
mod os;
mod types;

pub use arena::Arena;
pub use config::Config;
pub use diagnostics::{reset_hook, set_hook, Fault};
#[cfg(unix)]
pub use os::UnixPageProvider;
#[cfg(windows)]
pub use os::WindowsPageProvider;
pub use os::{FakePageProvider, PageProvider};

use core::alloc::{GlobalAlloc, Layout};
use std::sync::Mutex;

/// `GlobalAlloc` adapter around an `Arena`, serializing access with a
/// `Mutex`. This is the only concurrency this crate adds on top of the
/// single-threaded `Arena` core: the arena itself has no internal
/// locking, so any two threads sharing one must go through something
/// like this.
///
/// ```no_run
/// # #[cfg(unix)] {
/// use segtag::{LockedHeap, UnixPageProvider};
///
/// #[global_allocator]
/// static ALLOC: LockedHeap<UnixPageProvider> =
///     LockedHeap::new_lazy(UnixPageProvider::new);
/// # }
/// ```
pub struct LockedHeap<P: PageProvider> {
    inner: Mutex<Option<Arena<P>>>,
    build: fn() -> P,
}

impl<P: PageProvider> LockedHeap<P> {
    /// Defer building the page provider (and the arena wrapping it)
    /// until the first allocation, so this can be used in a `static`
    /// initializer.
    pub const fn new_lazy(build: fn() -> P) -> Self {
        LockedHeap {
            inner: Mutex::new(None),
            build,
        }
    }

    fn with_arena<R>(&self, f: impl FnOnce(&mut Arena<P>) -> R) -> R {
        let mut guard = self.inner.lock().unwrap();
        let arena = guard.get_or_insert_with(|| Arena::new((self.build)()));
        f(arena)
    }
}

unsafe impl<P: PageProvider> GlobalAlloc for LockedHeap<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with_arena(|a| a.alloc(layout.size()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.with_arena(|a| a.free(ptr))
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        self.with_arena(|a| a.realloc(ptr, new_size))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.with_arena(|a| a.zalloc(1, layout.size()))
    }
}
