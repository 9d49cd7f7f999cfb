//! Pluggable response to detected caller misuse: an invalid pointer or a
//! double free. The default hook logs and aborts the process; tests
//! install a hook that panics instead, so the abort paths are assertable
//! with `std::panic::catch_unwind` without killing the test binary.

use std::sync::RwLock;

/// What went wrong. Carried to the hook purely for diagnostics; neither
/// variant is recoverable once raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `validate()` rejected a pointer the caller claimed was live.
    InvalidPointer,
    /// `free()` was called twice on the same payload pointer.
    DoubleFree,
}

impl Fault {
    fn message(self) -> &'static str {
        match self {
            Fault::InvalidPointer => "invalid pointer passed to allocator",
            Fault::DoubleFree => "double free detected",
        }
    }
}

type Hook = dyn Fn(Fault) + Send + Sync + 'static;

fn default_hook(fault: Fault) {
    log::error!("{}", fault.message());
    std::process::abort();
}

struct HookSlot(RwLock<Option<Box<Hook>>>);

static HOOK: HookSlot = HookSlot(RwLock::new(None));

/// Install a custom misuse hook, replacing the default log+abort
/// behaviour. Intended for tests that want to observe a fault without
/// terminating the process; see `tests/scenarios.rs` for the pattern.
pub fn set_hook(hook: impl Fn(Fault) + Send + Sync + 'static) {
    *HOOK.0.write().unwrap() = Some(Box::new(hook));
}

/// Restore the default log+abort hook.
pub fn reset_hook() {
    *HOOK.0.write().unwrap() = None;
}

/// Raise `fault` through the currently installed hook (default: log at
/// error level, then `std::process::abort()`).
pub fn raise(fault: Fault) -> ! {
    let guard = HOOK.0.read().unwrap();
    match guard.as_ref() {
        Some(hook) => {
            hook(fault);
            // A test hook that doesn't itself diverge (e.g. one that only
            // records the fault) still must not return into the caller
            // with corrupted arena state, so fall through to abort.
            std::process::abort();
        }
        None => default_hook(fault),
    }
}

/// Serializes tests that install a custom hook, since the hook is process
/// (not thread) global. Shared with the scenario tests in `arena.rs` and
/// `tests/scenarios.rs`; not gated behind `cfg(test)` because integration
/// tests under `tests/` link the library without that cfg.
pub static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn custom_hook_observes_fault_without_aborting() {
        let _guard = TEST_LOCK.lock().unwrap();
        let seen = std::sync::Arc::new(AtomicBool::new(false));
        let seen2 = seen.clone();
        set_hook(move |fault| {
            assert_eq!(fault, Fault::DoubleFree);
            seen2.store(true, Ordering::SeqCst);
            std::panic::panic_any("test-fault-unwind");
        });
        let result = std::panic::catch_unwind(|| raise(Fault::DoubleFree));
        assert!(result.is_err());
        assert!(seen.load(Ordering::SeqCst));
        reset_hook();
    }
}
