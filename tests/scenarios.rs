//! End-to-end scenarios run against `Arena<FakePageProvider>`, exercising
//! the paths a single source file can't: fast-cache reuse, coalescing
//! across several frees, the mmap path, and double-free detection.

use segtag::{set_hook, Arena, Fault, FakePageProvider};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// The misuse hook is process-global (see `segtag::set_hook`'s docs), so
// tests that install one serialize through this lock.
static HOOK_LOCK: Mutex<()> = Mutex::new(());

fn arena() -> Arena<FakePageProvider> {
    Arena::new(FakePageProvider::new(8 * 1024 * 1024))
}

#[test]
fn s1_alloc_write_free_roundtrip() {
    let mut a = arena();
    unsafe {
        let p = a.alloc(256);
        assert!(!p.is_null());
        std::ptr::write_bytes(p, 0x5a, 256);
        for i in 0..256 {
            assert_eq!(*p.add(i), 0x5a);
        }
        a.free(p);
    }
}

#[test]
fn s2_many_small_allocations_reuse_the_fast_cache() {
    let mut a = arena();
    let mut ptrs = Vec::new();
    for _ in 0..64 {
        let p = a.alloc(40);
        assert!(!p.is_null());
        ptrs.push(p);
    }
    for p in &ptrs {
        a.free(*p);
    }
    // Freed into the fast array without coalescing; immediately
    // reusable for a same-sized request.
    let mut reused = 0;
    for _ in 0..64 {
        let p = a.alloc(40);
        assert!(!p.is_null());
        if ptrs.contains(&p) {
            reused += 1;
        }
    }
    assert!(reused > 0, "expected at least one fast-cache hit");
}

#[test]
fn s3_interleaved_alloc_free_coalesces_mid_size_chunks() {
    let mut a = arena();
    let a1 = a.alloc(4096);
    let a2 = a.alloc(4096);
    let a3 = a.alloc(4096);
    a.free(a1);
    a.free(a2);
    a.free(a3);
    // Three adjacent 4 KiB frees should coalesce enough that a request
    // bigger than any one of them alone still succeeds from the bins.
    let big = a.alloc(3 * 4096 - 512);
    assert!(!big.is_null());
}

#[test]
fn s4_large_request_goes_through_the_mmap_path() {
    let mut a = arena();
    let p = a.alloc(1 << 20);
    assert!(!p.is_null());
    unsafe {
        std::ptr::write_bytes(p, 0x11, 1 << 20);
    }
    a.free(p);
}

#[test]
fn s5_realloc_grows_in_place_when_the_wilderness_is_adjacent() {
    let mut a = arena();
    unsafe {
        let p = a.alloc(64);
        std::ptr::write_bytes(p, 7, 64);
        let grown = a.realloc(p, 4096);
        assert!(!grown.is_null());
        for i in 0..64 {
            assert_eq!(*grown.add(i), 7);
        }
    }
}

#[test]
fn s6_freeing_the_same_pointer_twice_aborts_via_the_fault_hook() {
    let _guard = HOOK_LOCK.lock().unwrap();
    let observed = Arc::new(AtomicBool::new(false));
    let observed2 = observed.clone();
    set_hook(move |fault| {
        assert_eq!(fault, Fault::DoubleFree);
        observed2.store(true, Ordering::SeqCst);
        std::panic::panic_any("double free observed in test");
    });

    let mut a = arena();
    let p = a.alloc(96);
    a.free(p);
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| a.free(p)));

    assert!(result.is_err());
    assert!(observed.load(Ordering::SeqCst));
    segtag::reset_hook();
}

#[test]
fn zalloc_returns_zeroed_memory_even_when_reusing_a_freed_chunk() {
    let mut a = arena();
    unsafe {
        let p = a.alloc(200);
        std::ptr::write_bytes(p, 0xff, 200);
        a.free(p);
        let z = a.zalloc(10, 20);
        assert!(!z.is_null());
        for i in 0..200 {
            assert_eq!(*z.add(i), 0);
        }
    }
}
