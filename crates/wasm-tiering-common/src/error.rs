//! Error types for wasm-tiering.
//!
//! This module defines the error hierarchy using `thiserror`:
//! - [`TierError`]: Errors surfaced by tier-up, compilation and publication
//! - [`BindingError`]: Errors from creating import bindings
//!
//! Only resource exhaustion is meant to be handled by callers. Contract
//! violations (mismatched handler tables, out-of-range function indices,
//! uninstrumented call sites) are panics, not error values.

use thiserror::Error;

/// Top-level tiering errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TierError {
    /// The executable memory reservation has no free block large enough.
    #[error("Out of executable memory: requested {requested} bytes, {available} bytes free")]
    OutOfExecutableMemory {
        /// Size of the failed allocation in bytes.
        requested: usize,
        /// Total free bytes left in the reservation (possibly fragmented).
        available: usize,
    },

    /// A backend failed to produce code for a function.
    #[error("Compilation of function {function_index} failed: {reason}")]
    CompilationFailed {
        /// Index of the function being compiled.
        function_index: u32,
        /// Description of the failure.
        reason: String,
    },

    /// Creating an import binding failed.
    #[error("Import binding failed: {0}")]
    Binding(#[from] BindingError),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Errors from creating the trampolines that let WebAssembly call host code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    /// Executable memory ran out while emitting the trampoline.
    #[error("Out of executable memory while binding import {import_index}")]
    OutOfMemory {
        /// Index of the import being bound.
        import_index: u32,
    },
}

impl TierError {
    /// Create a new `OutOfExecutableMemory` error.
    pub fn out_of_executable_memory(requested: usize, available: usize) -> Self {
        Self::OutOfExecutableMemory {
            requested,
            available,
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(function_index: u32, reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            function_index,
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error is an executable-memory exhaustion,
    /// whether hit by a compilation or by an import binding.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::OutOfExecutableMemory { .. } | Self::Binding(BindingError::OutOfMemory { .. })
        )
    }
}
