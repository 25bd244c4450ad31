//! Configuration file structures for wasm-tiering.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`SimulationConfig`]: Workload driven by the `wasm-tiering` binary

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::TieringConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [tiering.thresholds]
/// baseline_after_calls = 500
/// optimizing_after_calls = 5_000
/// osr_after_back_edges = 1_000
///
/// [tiering.compiler]
/// worker_threads = 2
/// executable_memory_kb = 16384
///
/// [simulation]
/// functions = 3
/// imports = 1
/// calls = 10_000
/// back_edges_per_call = 4
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Tiering configuration (thresholds + compiler settings).
    #[serde(default)]
    pub tiering: TieringConfig,

    /// Simulated workload.
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Simulated workload settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Number of defined functions in the simulated module.
    #[serde(default = "defaults::functions")]
    pub functions: u32,

    /// Number of imported host functions.
    #[serde(default)]
    pub imports: u32,

    /// Total calls issued, round-robin over the functions.
    #[serde(default = "defaults::calls")]
    pub calls: u64,

    /// Loop back-edges taken by function 0 on every call.
    #[serde(default)]
    pub back_edges_per_call: u32,

    /// Bytecode length of each simulated function.
    #[serde(default = "defaults::bytecode_len")]
    pub bytecode_len: usize,

    /// Run under signaling (trap-based) memory instead of bounds checks.
    #[serde(default)]
    pub signaling_memory: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            functions: defaults::functions(),
            imports: 0,
            calls: defaults::calls(),
            back_edges_per_call: 0,
            bytecode_len: defaults::bytecode_len(),
            signaling_memory: false,
        }
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub const fn functions() -> u32 {
        3
    }

    pub const fn calls() -> u64 {
        10_000
    }

    pub const fn bytecode_len() -> usize {
        64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.simulation.functions, 3);
        assert_eq!(config.simulation.imports, 0);
        assert_eq!(config.simulation.calls, 10_000);
        assert_eq!(config.simulation.back_edges_per_call, 0);
        assert!(!config.simulation.signaling_memory);
        assert_eq!(config.tiering.thresholds.baseline_after_calls, 500);
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r"
            [simulation]
            functions = 8
        ";

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.simulation.functions, 8);
        // Defaults applied
        assert_eq!(config.simulation.calls, 10_000);
        assert_eq!(config.tiering.compiler.worker_threads, 2);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r"
            [tiering.thresholds]
            baseline_after_calls = 10
            optimizing_after_calls = 100
            osr_after_back_edges = 50

            [tiering.compiler]
            worker_threads = 4
            executable_memory_kb = 256

            [simulation]
            functions = 5
            imports = 2
            calls = 1_000
            back_edges_per_call = 8
            bytecode_len = 128
            signaling_memory = true
        ";

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.tiering.thresholds.baseline_after_calls, 10);
        assert_eq!(config.tiering.thresholds.optimizing_after_calls, 100);
        assert_eq!(config.tiering.thresholds.osr_after_back_edges, 50);
        assert_eq!(config.tiering.compiler.worker_threads, 4);
        assert_eq!(config.tiering.compiler.executable_memory_kb, 256);
        assert_eq!(config.simulation.functions, 5);
        assert_eq!(config.simulation.imports, 2);
        assert_eq!(config.simulation.calls, 1_000);
        assert_eq!(config.simulation.back_edges_per_call, 8);
        assert_eq!(config.simulation.bytecode_len, 128);
        assert!(config.simulation.signaling_memory);
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(matches!(result, Err(ConfigFileError::Parse { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigFile::from_file("/nonexistent/wasm-tiering.toml");
        assert!(matches!(result, Err(ConfigFileError::Io { .. })));
    }
}
