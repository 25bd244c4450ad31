//! Tiered execution-callee management for wasm-tiering.
//!
//! This crate represents, links and hands off the code of every
//! WebAssembly function across execution tiers:
//! - [`Callee`]: Code for one function in one tier, shared through `Arc`
//! - [`CalleeSlot`]: Publish-once replacement and OSR-entry slots
//! - [`CalleeGroup`]: Fixed table of interpreter callees for one module
//! - [`TierUpCoordinator`]: Counters, background compilation and publication
//! - [`TieringEngine`]: Executable memory, backend and group creation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    TieringEngine                        │
//! │  (Shared across all module instances, thread-safe)      │
//! │  - Executable memory reservation                        │
//! │  - Interpreter dispatch code                            │
//! │  - Compiler backend                                     │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    CalleeGroup                          │
//! │  (One per module instance, fixed length)                │
//! │  - Interpreter callee per function                      │
//! │  - Per memory mode replacement / OSR-entry slots        │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                 TierUpCoordinator                       │
//! │  (Called at function entry and loop back-edges)         │
//! │  - Tier-up counters and request flags                   │
//! │  - Compilation on the blocking pool                     │
//! │  - Linking, then publication                            │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod callee;
pub mod code_block;
pub mod coordinator;
pub mod engine;
pub mod entrypoint;
pub mod executable;
pub mod group;
pub mod handler;
pub mod memory_mode;
pub mod slot;
pub mod stackmap;
pub mod tier_up;

pub use backend::{BackendOutput, CompileRequest, CompileTier, SyntheticBackend, TierCompiler};
pub use callee::{
    Callee, CalleeKind, CompilationMode, CompiledCode, FunctionIdentity, FunctionIndex,
    InterpreterDispatch, UnlinkedCall,
};
pub use code_block::FunctionCodeBlock;
pub use coordinator::{PlanKey, PlanStatus, TierUpCoordinator};
pub use engine::TieringEngine;
pub use entrypoint::{CodePtr, CodeRange, Entrypoint, Reg, RegisterAtOffset};
pub use executable::{ExecutableAllocator, ExecutableMemory};
pub use group::{CalleeGroup, FunctionDefinition};
pub use handler::{HandlerInfo, HandlerTable, TagFilter, TagIndex, UnlinkedHandlerInfo};
pub use memory_mode::{MemoryMode, PerMemoryMode};
pub use slot::{CalleeSlot, SlotKind};
pub use stackmap::{CallSiteIndex, StackMap, StackMaps, ValueLocation};
pub use tier_up::{RequestFlag, TierUpCounter};
