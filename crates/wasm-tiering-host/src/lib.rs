//! Host-side boundary of wasm-tiering.
//!
//! This crate connects the tiering core to module instantiation. It binds
//! imported functions to exit trampolines and owns the callee group of
//! each module instance.
//!
//! # Modules
//!
//! - [`binding`]: Import binding trait and the trampoline binder
//! - [`owner`]: The per-instance callee-group owner
//!
//! # Failure Model
//!
//! Executable memory can run out while trampolines are emitted. The owner
//! then reports `TierError::Binding` and produces no callee group, so the
//! module never starts running with unbound imports.

pub mod binding;
pub mod owner;

pub use binding::{ImportBinder, ImportBinding, SignatureIndex, TrampolineBinder};
pub use owner::{CallTarget, ModuleCalleeGroup, ModuleInfo};
