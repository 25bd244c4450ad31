//! Tier-up counters and one-shot request flags.
//!
//! Counters are bumped by whichever thread is executing the function and
//! read by the tier-up trigger. Increments are plain load/store pairs:
//! racing threads may lose an increment, which only delays tier-up.
//! [`RequestFlag`] is what makes a compilation get requested once.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use wasm_tiering_common::TierUpThresholds;

/// Call and loop back-edge counter of one callee.
#[derive(Debug)]
pub struct TierUpCounter {
    calls: AtomicU32,
    back_edges: AtomicU32,
    call_threshold: u32,
    back_edge_threshold: u32,
}

impl TierUpCounter {
    /// Create a counter with explicit thresholds.
    pub fn new(call_threshold: u32, back_edge_threshold: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            back_edges: AtomicU32::new(0),
            call_threshold,
            back_edge_threshold,
        }
    }

    /// Counter for an interpreter-tier callee.
    pub fn for_interpreter(thresholds: &TierUpThresholds) -> Self {
        Self::new(
            thresholds.baseline_after_calls,
            thresholds.osr_after_back_edges,
        )
    }

    /// Counter for a baseline-tier callee.
    pub fn for_baseline(thresholds: &TierUpThresholds) -> Self {
        Self::new(
            thresholds.optimizing_after_calls,
            thresholds.osr_after_back_edges,
        )
    }

    /// Count one call. Returns `true` once the call threshold is reached.
    #[inline]
    pub fn record_call(&self) -> bool {
        Self::bump(&self.calls, self.call_threshold)
    }

    /// Count one loop back-edge. Returns `true` once the OSR threshold is
    /// reached.
    #[inline]
    pub fn record_back_edge(&self) -> bool {
        Self::bump(&self.back_edges, self.back_edge_threshold)
    }

    #[inline]
    fn bump(counter: &AtomicU32, threshold: u32) -> bool {
        let count = counter.load(Ordering::Relaxed);
        if count >= threshold {
            return true;
        }
        let count = count + 1;
        counter.store(count, Ordering::Relaxed);
        count >= threshold
    }

    /// Calls counted so far (saturates at the threshold).
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Back-edges counted so far (saturates at the threshold).
    pub fn back_edges(&self) -> u32 {
        self.back_edges.load(Ordering::Relaxed)
    }
}

/// A flag that can be claimed exactly once.
///
/// Guards "compilation already requested" so racing threads that both
/// cross a threshold produce a single compilation request.
#[derive(Debug, Default)]
pub struct RequestFlag(AtomicBool);

impl RequestFlag {
    /// Create an unclaimed flag.
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Claim the flag. Returns `true` only for the first caller.
    pub fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Check whether the flag was claimed.
    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
