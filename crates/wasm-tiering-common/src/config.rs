//! Configuration structures for wasm-tiering.
//!
//! This module defines configuration options for the tiering core:
//! - [`TieringConfig`]: Top-level configuration containing all settings
//! - [`TierUpThresholds`]: Counter thresholds that trigger compilation
//! - [`CompilerConfig`]: Background compiler and executable memory settings

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::TierError;

/// Top-level tiering configuration.
///
/// It can be loaded from files (TOML, JSON) or built in code.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TieringConfig {
    /// Tier-up thresholds.
    #[serde(default)]
    pub thresholds: TierUpThresholds,

    /// Background compiler configuration.
    #[serde(default)]
    pub compiler: CompilerConfig,
}

impl TieringConfig {
    /// Check that every setting is usable.
    ///
    /// # Errors
    ///
    /// Returns `TierError::InvalidConfig` naming the first bad setting.
    pub fn validate(&self) -> Result<(), TierError> {
        let thresholds = &self.thresholds;
        if thresholds.baseline_after_calls == 0 {
            return Err(TierError::invalid_config(
                "thresholds.baseline_after_calls must be greater than zero",
            ));
        }
        if thresholds.optimizing_after_calls == 0 {
            return Err(TierError::invalid_config(
                "thresholds.optimizing_after_calls must be greater than zero",
            ));
        }
        if thresholds.osr_after_back_edges == 0 {
            return Err(TierError::invalid_config(
                "thresholds.osr_after_back_edges must be greater than zero",
            ));
        }
        if self.compiler.worker_threads == 0 {
            return Err(TierError::invalid_config(
                "compiler.worker_threads must be greater than zero",
            ));
        }
        if self.compiler.executable_memory_kb == 0 {
            return Err(TierError::invalid_config(
                "compiler.executable_memory_kb must be greater than zero",
            ));
        }

        debug!(
            baseline_after_calls = thresholds.baseline_after_calls,
            optimizing_after_calls = thresholds.optimizing_after_calls,
            osr_after_back_edges = thresholds.osr_after_back_edges,
            "Tiering configuration validated"
        );
        Ok(())
    }
}

/// Counter thresholds for tier-up decisions.
///
/// Counters are per function. Crossing a threshold only requests a
/// compilation; the executing thread never waits for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TierUpThresholds {
    /// Calls into an interpreter-tier function before baseline compilation
    /// is requested.
    #[serde(default = "defaults::baseline_after_calls")]
    pub baseline_after_calls: u32,

    /// Calls into a baseline-tier function before optimizing compilation
    /// is requested.
    #[serde(default = "defaults::optimizing_after_calls")]
    pub optimizing_after_calls: u32,

    /// Loop back-edges taken before an OSR-entry compilation is requested.
    #[serde(default = "defaults::osr_after_back_edges")]
    pub osr_after_back_edges: u32,
}

impl Default for TierUpThresholds {
    fn default() -> Self {
        Self {
            baseline_after_calls: defaults::baseline_after_calls(),
            optimizing_after_calls: defaults::optimizing_after_calls(),
            osr_after_back_edges: defaults::osr_after_back_edges(),
        }
    }
}

/// Background compiler configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompilerConfig {
    /// Number of worker threads that run compilations.
    #[serde(default = "defaults::worker_threads")]
    pub worker_threads: usize,

    /// Size of the executable memory reservation in kilobytes.
    ///
    /// Every JIT callee and import trampoline is carved out of this
    /// reservation. When it is exhausted, compilations fail and the
    /// function keeps running in its current tier.
    #[serde(default = "defaults::executable_memory_kb")]
    pub executable_memory_kb: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            worker_threads: defaults::worker_threads(),
            executable_memory_kb: defaults::executable_memory_kb(),
        }
    }
}

impl CompilerConfig {
    /// Get the executable memory reservation in bytes.
    pub fn executable_memory_bytes(&self) -> usize {
        self.executable_memory_kb.saturating_mul(1024)
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn baseline_after_calls() -> u32 {
        500
    }

    pub const fn optimizing_after_calls() -> u32 {
        5_000
    }

    pub const fn osr_after_back_edges() -> u32 {
        1_000
    }

    pub const fn worker_threads() -> usize {
        2
    }

    pub const fn executable_memory_kb() -> usize {
        16 * 1024
    }
}
