//! Common types, errors, and configuration for wasm-tiering.
//!
//! This crate provides shared functionality used across the wasm-tiering workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for tier-up thresholds and the compiler pool
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{CompilerConfig, TierUpThresholds, TieringConfig};
pub use config_file::{ConfigFile, ConfigFileError, SimulationConfig};
pub use error::{BindingError, TierError};
