//! Callee-group ownership for one module instance.
//!
//! [`ModuleCalleeGroup`] is what module instantiation creates: the
//! [`CalleeGroup`] of the module's defined functions plus an exit stub for
//! every imported function. If any stub cannot be bound the whole thing
//! fails and the module must not run.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use wasm_tiering_common::TierError;
use wasm_tiering_core::{
    Callee, CalleeGroup, CodePtr, FunctionDefinition, MemoryMode, TieringEngine,
};

use crate::binding::{ImportBinder, ImportBinding, SignatureIndex};

/// What instantiation needs to know about a module.
#[derive(Debug, Clone, Default)]
pub struct ModuleInfo {
    /// Signature of each imported function, in import order.
    pub import_signatures: Vec<SignatureIndex>,
    /// Defined functions, in index order.
    pub functions: Vec<FunctionDefinition>,
}

/// Where a call in the module's function index space goes.
#[derive(Debug, Clone)]
pub enum CallTarget {
    /// An imported function, reached through its exit stub.
    Import(CodePtr),
    /// A defined function, in whatever tier is installed.
    Wasm(Arc<Callee>),
}

impl CallTarget {
    /// Address the call jumps to.
    pub fn entry(&self) -> CodePtr {
        match self {
            CallTarget::Import(entry) => *entry,
            CallTarget::Wasm(callee) => callee.entrypoint(),
        }
    }
}

/// A callee group plus the import bindings of its module.
pub struct ModuleCalleeGroup {
    group: Arc<CalleeGroup>,
    exit_stubs: Box<[ImportBinding]>,
}

impl ModuleCalleeGroup {
    /// Create the callee group for `module` and bind every import.
    ///
    /// # Errors
    ///
    /// Returns `TierError::Binding` if executable memory runs out while
    /// emitting a trampoline, or `TierError::InvalidConfig` if the module's
    /// function index space does not fit in `u32`. No group is produced in
    /// either case.
    #[instrument(skip_all, fields(imports = module.import_signatures.len(), functions = module.functions.len()))]
    pub fn create(
        engine: &TieringEngine,
        module: ModuleInfo,
        binder: &dyn ImportBinder,
    ) -> Result<Self, TierError> {
        let import_count = u32::try_from(module.import_signatures.len())
            .map_err(|_| TierError::invalid_config("too many function imports"))?;
        if !CalleeGroup::fits_index_space(import_count, module.functions.len()) {
            return Err(TierError::invalid_config(format!(
                "{} imports and {} functions overflow the function index space",
                import_count,
                module.functions.len()
            )));
        }

        let exit_stubs = module
            .import_signatures
            .iter()
            .zip(0..)
            .map(|(&signature, import_index)| binder.bind(import_index, signature))
            .collect::<Result<Box<[_]>, _>>()
            .map_err(|err| {
                warn!(error = %err, "Import binding failed, module cannot run");
                TierError::from(err)
            })?;

        let group = engine.create_group(import_count, module.functions);

        info!(
            imports = exit_stubs.len(),
            functions = group.len(),
            "Module callee group ready"
        );

        Ok(Self { group, exit_stubs })
    }

    /// The callee group of the defined functions.
    pub fn group(&self) -> &Arc<CalleeGroup> {
        &self.group
    }

    /// Exit stub of import `import_index`.
    pub fn exit_stub(&self, import_index: u32) -> Option<&ImportBinding> {
        self.exit_stubs.get(import_index as usize)
    }

    /// Number of imported functions.
    pub fn function_import_count(&self) -> u32 {
        self.group.function_import_count()
    }

    /// Resolve a call to `space_index` in the module's function index space
    /// under `mode`. `None` if the index is out of range.
    pub fn resolve_call(&self, space_index: u32, mode: MemoryMode) -> Option<CallTarget> {
        if let Some(stub) = self.exit_stub(space_index) {
            return Some(CallTarget::Import(stub.entry()));
        }
        let callee = self.group.from_function_index_space(space_index)?;
        Some(CallTarget::Wasm(self.group.call_target(callee.index(), mode)))
    }
}

impl std::fmt::Debug for ModuleCalleeGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCalleeGroup")
            .field("group", &self.group)
            .field("exit_stubs", &self.exit_stubs.len())
            .finish()
    }
}
