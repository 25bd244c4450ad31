//! Tiering engine configuration and creation.
//!
//! The [`TieringEngine`] is the foundation of the tiering core. It is:
//! - Thread-safe and shared by every module instance
//! - Owner of the executable memory reservation all tiers allocate from
//! - Owner of the interpreter dispatch code every interpreter callee enters
//! - The place callee groups and their coordinators are created

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;

use wasm_tiering_common::{TierError, TieringConfig};

use crate::backend::{SyntheticBackend, TierCompiler};
use crate::callee::InterpreterDispatch;
use crate::coordinator::TierUpCoordinator;
use crate::executable::{ExecutableAllocator, ExecutableMemory};
use crate::group::{CalleeGroup, FunctionDefinition};

/// Bytes reserved for the interpreter dispatch loop.
pub const INTERPRETER_DISPATCH_SIZE: usize = 4096;

/// Offset of the function entry thunk within the dispatch code.
const INTERPRETER_FUNCTION_ENTRY: usize = 0x40;

/// Thread-safe tiering engine.
///
/// Holds no per-module state; callee groups and coordinators are created
/// per module instance.
///
/// # Example
///
/// ```ignore
/// use wasm_tiering_common::TieringConfig;
/// use wasm_tiering_core::TieringEngine;
///
/// let engine = TieringEngine::new(&TieringConfig::default())?;
/// ```
#[derive(Clone)]
pub struct TieringEngine {
    allocator: ExecutableAllocator,
    backend: Arc<dyn TierCompiler>,
    dispatch: InterpreterDispatch,
    _dispatch_code: Arc<ExecutableMemory>,
    config: TieringConfig,
}

impl TieringEngine {
    /// Create an engine using the synthetic backend.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - The reservation cannot hold the interpreter dispatch code
    pub fn new(config: &TieringConfig) -> Result<Self, TierError> {
        Self::with_backend(config, Arc::new(SyntheticBackend::new()))
    }

    /// Create an engine compiling with `backend`.
    ///
    /// # Errors
    ///
    /// Same as [`TieringEngine::new`].
    pub fn with_backend(
        config: &TieringConfig,
        backend: Arc<dyn TierCompiler>,
    ) -> Result<Self, TierError> {
        config.validate()?;

        let allocator = ExecutableAllocator::new(config.compiler.executable_memory_bytes());
        let dispatch_code = allocator.allocate(INTERPRETER_DISPATCH_SIZE)?;
        let range = dispatch_code.range();
        let dispatch =
            InterpreterDispatch::new(range, range.start().offset(INTERPRETER_FUNCTION_ENTRY));

        info!(
            backend = backend.name(),
            executable_memory_kb = config.compiler.executable_memory_kb,
            dispatch = ?range,
            "Tiering engine initialized"
        );

        Ok(Self {
            allocator,
            backend,
            dispatch,
            _dispatch_code: Arc::new(dispatch_code),
            config: config.clone(),
        })
    }

    /// Build the callee group for one module instance.
    pub fn create_group(
        &self,
        function_import_count: u32,
        functions: Vec<FunctionDefinition>,
    ) -> Arc<CalleeGroup> {
        Arc::new(CalleeGroup::new(
            function_import_count,
            functions,
            self.dispatch,
            &self.config.thresholds,
        ))
    }

    /// Create a coordinator tiering up `group` on `runtime`.
    pub fn coordinator(&self, group: Arc<CalleeGroup>, runtime: Handle) -> TierUpCoordinator {
        TierUpCoordinator::new(
            group,
            Arc::clone(&self.backend),
            self.allocator.clone(),
            self.config.thresholds,
            runtime,
        )
    }

    /// The executable memory reservation.
    pub fn allocator(&self) -> &ExecutableAllocator {
        &self.allocator
    }

    /// The interpreter dispatch code.
    pub fn dispatch(&self) -> InterpreterDispatch {
        self.dispatch
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &TieringConfig {
        &self.config
    }
}

impl std::fmt::Debug for TieringEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieringEngine")
            .field("backend", &self.backend.name())
            .field("allocator", &self.allocator)
            .field("thresholds", &self.config.thresholds)
            .finish_non_exhaustive()
    }
}
