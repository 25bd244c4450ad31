//! The per-module callee group.
//!
//! A [`CalleeGroup`] is the stable table of interpreter-tier callees, one
//! per defined function, created once when a module is instantiated. Its
//! length never changes; what changes is the replacement and OSR-entry
//! slots hanging off each interpreter callee. The group itself never
//! compiles anything.

use std::sync::Arc;

use tracing::debug;

use wasm_tiering_common::TierUpThresholds;

use crate::callee::{Callee, CalleeKind, FunctionIdentity, FunctionIndex, InterpreterDispatch};
use crate::code_block::FunctionCodeBlock;
use crate::entrypoint::CodePtr;
use crate::memory_mode::MemoryMode;
use crate::tier_up::TierUpCounter;

/// One defined function handed to [`CalleeGroup::new`].
#[derive(Debug, Clone)]
pub struct FunctionDefinition {
    /// Name from the module's name section, if any.
    pub name: Option<String>,
    /// Interpreter code block.
    pub code_block: FunctionCodeBlock,
}

impl FunctionDefinition {
    /// An unnamed function.
    pub fn new(code_block: FunctionCodeBlock) -> Self {
        Self {
            name: None,
            code_block,
        }
    }

    /// A named function.
    pub fn named(name: impl Into<String>, code_block: FunctionCodeBlock) -> Self {
        Self {
            name: Some(name.into()),
            code_block,
        }
    }
}

/// Fixed-size table of interpreter callees for one module instance.
pub struct CalleeGroup {
    function_import_count: u32,
    callees: Box<[Arc<Callee>]>,
}

impl CalleeGroup {
    /// Build the group, linking every interpreter callee's entrypoint to the
    /// dispatch's function entry before any of them becomes reachable.
    ///
    /// # Panics
    ///
    /// Panics if the imports and `functions` together do not fit in a
    /// `u32` function index space.
    pub fn new(
        function_import_count: u32,
        functions: Vec<FunctionDefinition>,
        dispatch: InterpreterDispatch,
        thresholds: &TierUpThresholds,
    ) -> Self {
        assert!(
            Self::fits_index_space(function_import_count, functions.len()),
            "{} imports and {} functions overflow the function index space",
            function_import_count,
            functions.len()
        );

        let callees: Box<[Arc<Callee>]> = functions
            .into_iter()
            .zip(0u32..)
            .map(|(def, i)| {
                let index = FunctionIndex(i);
                let identity = match def.name {
                    Some(name) => FunctionIdentity::named(index, name),
                    None => FunctionIdentity::new(index),
                };
                let callee = Callee::interpreter(
                    identity,
                    def.code_block,
                    dispatch,
                    TierUpCounter::for_interpreter(thresholds),
                );
                if let CalleeKind::Interpreter(interpreter) = callee.kind() {
                    interpreter.set_entrypoint(dispatch.function_entry);
                }
                callee
            })
            .collect();

        debug!(
            functions = callees.len(),
            imports = function_import_count,
            "Callee group created"
        );

        Self {
            function_import_count,
            callees,
        }
    }

    /// Check whether `function_import_count` imports followed by
    /// `function_count` defined functions are addressable with `u32` indices.
    pub fn fits_index_space(function_import_count: u32, function_count: usize) -> bool {
        u32::try_from(function_count)
            .ok()
            .and_then(|count| count.checked_add(function_import_count))
            .is_some()
    }

    /// Interpreter callee of `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn get(&self, index: FunctionIndex) -> &Arc<Callee> {
        match self.callees.get(index.as_usize()) {
            Some(callee) => callee,
            None => panic!(
                "function index {} out of range for callee group of {}",
                index.0,
                self.callees.len()
            ),
        }
    }

    /// Interpreter callee of `index`, if in range.
    pub fn try_get(&self, index: FunctionIndex) -> Option<&Arc<Callee>> {
        self.callees.get(index.as_usize())
    }

    /// Interpreter callee addressed in the module's function index space,
    /// where imports come first. `None` for imports and out-of-range indices.
    pub fn from_function_index_space(&self, space_index: u32) -> Option<&Arc<Callee>> {
        let defined = space_index.checked_sub(self.function_import_count)?;
        self.try_get(FunctionIndex(defined))
    }

    /// Callee a call to `index` should enter under `mode`: the installed
    /// replacement if any, else the interpreter callee.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn call_target(&self, index: FunctionIndex, mode: MemoryMode) -> Arc<Callee> {
        let callee = self.get(index);
        callee
            .as_interpreter()
            .and_then(|interpreter| interpreter.replacement(mode).load())
            .unwrap_or_else(|| Arc::clone(callee))
    }

    /// Installed OSR-entry callee of `index` under `mode`.
    ///
    /// Looks at the interpreter's slot first, then at the slot of an
    /// installed baseline replacement.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn osr_entry(&self, index: FunctionIndex, mode: MemoryMode) -> Option<Arc<Callee>> {
        let interpreter = self.get(index).as_interpreter()?;
        interpreter.osr_entry(mode).load().or_else(|| {
            interpreter
                .replacement(mode)
                .history()
                .iter()
                .find_map(|c| c.as_baseline().and_then(|b| b.osr_entry().load()))
        })
    }

    /// Compiled callee whose code contains `pc`, for unwinding attribution.
    ///
    /// Searches every callee ever published for every function, including
    /// superseded ones that may still have frames on some stack. Interpreter
    /// frames are attributed by the interpreter, not by address.
    pub fn callee_for_pc(&self, pc: CodePtr) -> Option<Arc<Callee>> {
        self.callees.iter().find_map(|callee| {
            let interpreter = callee.as_interpreter()?;
            MemoryMode::ALL.into_iter().find_map(|mode| {
                let mut compiled = interpreter.replacement(mode).history();
                compiled.extend(interpreter.osr_entry(mode).history());
                let nested: Vec<_> = compiled
                    .iter()
                    .filter_map(|c| c.as_baseline())
                    .flat_map(|b| {
                        let mut more = b.osr_entry().history();
                        more.extend(b.replacement().history());
                        more
                    })
                    .collect();
                compiled.extend(nested);
                compiled.into_iter().find(|c| c.code_range().contains(pc))
            })
        })
    }

    /// Number of defined functions.
    pub fn len(&self) -> usize {
        self.callees.len()
    }

    /// Returns `true` if the module defines no functions.
    pub fn is_empty(&self) -> bool {
        self.callees.is_empty()
    }

    /// Number of imported functions preceding the defined ones.
    pub fn function_import_count(&self) -> u32 {
        self.function_import_count
    }

    /// Iterate over interpreter callees in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Callee>> {
        self.callees.iter()
    }
}

impl std::fmt::Debug for CalleeGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalleeGroup")
            .field("function_import_count", &self.function_import_count)
            .field("functions", &self.callees.len())
            .finish_non_exhaustive()
    }
}
