//! Runtime-tunable knobs layered on top of the compile-time constants in
//! `types`. Kept separate so a caller can override batch sizing or the
//! fast-array policy without touching the allocation code itself.

use crate::types::{FAST_CONSOLIDATE, HEAP_BATCH};

/// Tunables an `Arena` is built with. `Default` reproduces the constants
/// in `types.rs`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Bytes requested from the page provider per `extend_break` call.
    pub heap_batch: usize,
    /// Frees at or above this size trigger a fast-array flush before the
    /// freed chunk is coalesced and binned.
    pub fast_consolidate: usize,
    /// Whether the backward/forward coalescing neighbor scan is allowed to
    /// treat a chunk still parked in the fast array as a mergeable free
    /// neighbor. This crate gives fast-cached chunks a distinct `fast`
    /// status bit precisely so the scan never needs to do this, so the
    /// default is `false`; the knob exists for property tests that want
    /// to probe the alternative, ordering-invariant-dependent design.
    pub coalesce_fast: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            heap_batch: HEAP_BATCH,
            fast_consolidate: FAST_CONSOLIDATE,
            coalesce_fast: false,
        }
    }
}

impl Config {
    /// Start from the defaults and override the heap batch size.
    pub fn with_heap_batch(mut self, bytes: usize) -> Self {
        self.heap_batch = bytes;
        self
    }

    /// Start from the defaults and override the fast-consolidate threshold.
    pub fn with_fast_consolidate(mut self, bytes: usize) -> Self {
        self.fast_consolidate = bytes;
        self
    }

    /// Start from the defaults and override whether fast-cached chunks
    /// participate in the coalescing neighbor scan.
    pub fn with_coalesce_fast(mut self, enabled: bool) -> Self {
        self.coalesce_fast = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_types_constants() {
        let c = Config::default();
        assert_eq!(c.heap_batch, HEAP_BATCH);
        assert_eq!(c.fast_consolidate, FAST_CONSOLIDATE);
        assert!(!c.coalesce_fast);
    }

    #[test]
    fn builder_overrides_one_field_at_a_time() {
        let c = Config::default().with_heap_batch(4096);
        assert_eq!(c.heap_batch, 4096);
        assert_eq!(c.fast_consolidate, FAST_CONSOLIDATE);
        assert!(!c.coalesce_fast);
    }

    #[test]
    fn coalesce_fast_opt_in() {
        let c = Config::default().with_coalesce_fast(true);
        assert!(c.coalesce_fast);
    }
}
