//! The callee hierarchy.
//!
//! A [`Callee`] is the code for one function in one tier. The tier set is
//! closed, so the per-tier payload is the [`CalleeKind`] enum and every
//! query dispatches with an exhaustive `match`.
//!
//! ```text
//! Interpreter ──(calls)──▶ Baseline ──(calls)──▶ Optimizing
//!      │                      │
//!      └──(back-edges)──▶ OSR entry ◀──(back-edges)──┘
//! ```
//!
//! Callees are shared through `Arc`: the callee group, replacement slots,
//! call targets handed to executing threads and in-flight compilations all
//! hold references. A callee is fully linked when its constructor returns,
//! so anything reachable through an `Arc<Callee>` may be published.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::code_block::FunctionCodeBlock;
use crate::entrypoint::{CodePtr, CodeRange, Entrypoint, Reg, RegisterAtOffset};
use crate::handler::{HandlerInfo, HandlerTable, TagIndex, UnlinkedHandlerInfo};
use crate::memory_mode::{MemoryMode, PerMemoryMode};
use crate::slot::{CalleeSlot, SlotKind};
use crate::stackmap::{CallSiteIndex, StackMap, StackMaps};
use crate::tier_up::{RequestFlag, TierUpCounter};

/// Registers the interpreter's prologue saves, shared by every
/// interpreter-tier callee.
pub const INTERPRETER_CALLEE_SAVES: &[RegisterAtOffset] = &[
    RegisterAtOffset::new(Reg(12), -8),
    RegisterAtOffset::new(Reg(13), -16),
    RegisterAtOffset::new(Reg(14), -24),
];

/// Execution tier of a callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompilationMode {
    /// Interpreted bytecode.
    Interpreter,
    /// Fast single-pass JIT.
    Baseline,
    /// Optimizing JIT.
    Optimizing,
    /// Optimizing JIT code entered mid-function at a loop header.
    OptimizingOsrEntry,
    /// Stub the embedder calls to enter WebAssembly.
    EmbedderEntry,
}

impl fmt::Display for CompilationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompilationMode::Interpreter => "Interpreter",
            CompilationMode::Baseline => "Baseline",
            CompilationMode::Optimizing => "Optimizing",
            CompilationMode::OptimizingOsrEntry => "OptimizingOSREntry",
            CompilationMode::EmbedderEntry => "EmbedderEntry",
        };
        f.write_str(name)
    }
}

/// Index of a function within the module's defined functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionIndex(pub u32);

impl FunctionIndex {
    /// The index as a `usize`, for table access.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Index plus optional name, fixed for the callee's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionIdentity {
    index: FunctionIndex,
    name: Option<Arc<str>>,
}

impl FunctionIdentity {
    /// Identity without a name.
    pub fn new(index: FunctionIndex) -> Self {
        Self { index, name: None }
    }

    /// Identity with a name from the name section.
    pub fn named(index: FunctionIndex, name: impl Into<Arc<str>>) -> Self {
        Self {
            index,
            name: Some(name.into()),
        }
    }

    /// Function index.
    pub fn index(&self) -> FunctionIndex {
        self.index
    }

    /// Function name, if the module provided one.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Display for FunctionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => f.write_str(name),
            None => write!(f, "wasm-function[{}]", self.index.0),
        }
    }
}

/// A direct call whose target address is filled in by a later link pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkedCall {
    /// Offset of the call instruction within the callee's code.
    pub call_offset: u32,
    /// Function being called.
    pub target: FunctionIndex,
}

/// Everything a JIT backend hands over for one function.
#[derive(Debug)]
pub struct CompiledCode {
    /// Entry descriptor, owning the code block.
    pub entrypoint: Entrypoint,
    /// Call sites to resolve once callee addresses are known.
    pub call_sites: Vec<UnlinkedCall>,
    /// Live-value maps per instrumented call site.
    pub stackmaps: StackMaps,
    /// Protected regions, in the backend's order.
    pub unlinked_handlers: Vec<UnlinkedHandlerInfo>,
    /// Landing pad of each protected region, same order and length.
    pub handler_locations: Vec<CodePtr>,
}

/// Where the interpreter's dispatch code lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterDispatch {
    /// Code range of the interpreter loop, shared by all interpreter callees.
    pub range: CodeRange,
    /// Entry thunk that starts interpreting a function.
    pub function_entry: CodePtr,
}

impl InterpreterDispatch {
    /// Create a dispatch descriptor.
    ///
    /// # Panics
    ///
    /// Panics if `function_entry` is outside `range`.
    pub fn new(range: CodeRange, function_entry: CodePtr) -> Self {
        assert!(
            range.contains(function_entry),
            "interpreter entry {function_entry} outside dispatch range {range:?}"
        );
        Self {
            range,
            function_entry,
        }
    }
}

/// Code for one function in one tier.
pub struct Callee {
    mode: CompilationMode,
    identity: FunctionIdentity,
    exception_handlers: HandlerTable,
    kind: CalleeKind,
}

/// Per-tier payload.
#[derive(Debug)]
pub enum CalleeKind {
    /// See [`InterpreterCallee`].
    Interpreter(InterpreterCallee),
    /// See [`BaselineCallee`].
    Baseline(BaselineCallee),
    /// See [`OptimizingCallee`].
    Optimizing(OptimizingCallee),
    /// See [`OsrEntryCallee`].
    OsrEntry(OsrEntryCallee),
    /// See [`EmbedderEntryCallee`].
    EmbedderEntry(EmbedderEntryCallee),
}

/// Tier-up requests already made for one memory mode.
#[derive(Debug, Default)]
pub struct TierUpRequests {
    /// A baseline (or optimizing) replacement was requested.
    pub replacement: RequestFlag,
    /// An OSR-entry callee was requested.
    pub osr_entry: RequestFlag,
}

/// Interpreter-tier payload.
#[derive(Debug)]
pub struct InterpreterCallee {
    code_block: FunctionCodeBlock,
    dispatch: InterpreterDispatch,
    entrypoint: OnceLock<CodePtr>,
    tier_up: TierUpCounter,
    replacements: PerMemoryMode<CalleeSlot>,
    osr_entries: PerMemoryMode<CalleeSlot>,
    requests: PerMemoryMode<TierUpRequests>,
}

impl InterpreterCallee {
    /// The function's bytecode and side tables.
    pub fn code_block(&self) -> &FunctionCodeBlock {
        &self.code_block
    }

    /// Call / back-edge counter.
    pub fn tier_up(&self) -> &TierUpCounter {
        &self.tier_up
    }

    /// Compiled replacement for `mode`.
    pub fn replacement(&self, mode: MemoryMode) -> &CalleeSlot {
        self.replacements.get(mode)
    }

    /// OSR-entry callee for `mode`.
    pub fn osr_entry(&self, mode: MemoryMode) -> &CalleeSlot {
        self.osr_entries.get(mode)
    }

    /// Requests already made for `mode`.
    pub fn requests(&self, mode: MemoryMode) -> &TierUpRequests {
        self.requests.get(mode)
    }

    /// Install the entrypoint once the interpreter dispatch is linked.
    ///
    /// Installing the same address again is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `entry` is outside the dispatch range or a different
    /// entrypoint was already installed.
    pub fn set_entrypoint(&self, entry: CodePtr) {
        assert!(
            self.dispatch.range.contains(entry),
            "interpreter entrypoint {entry} outside dispatch range {:?}",
            self.dispatch.range
        );
        let installed = *self.entrypoint.get_or_init(|| entry);
        assert_eq!(
            installed, entry,
            "interpreter entrypoint already installed at {installed}"
        );
    }

    /// Installed entrypoint, if any.
    pub fn installed_entrypoint(&self) -> Option<CodePtr> {
        self.entrypoint.get().copied()
    }
}

/// JIT code shared by every compiled tier.
#[derive(Debug)]
struct JitCode {
    entrypoint: Entrypoint,
    call_sites: Box<[UnlinkedCall]>,
}

/// Baseline-tier payload.
#[derive(Debug)]
pub struct BaselineCallee {
    jit: JitCode,
    memory_mode: MemoryMode,
    stackmaps: StackMaps,
    tier_up: TierUpCounter,
    osr_entry: CalleeSlot,
    replacement: CalleeSlot,
    did_start_compiling_osr_entry: RequestFlag,
    did_start_compiling_replacement: RequestFlag,
}

impl BaselineCallee {
    /// Memory mode the code was compiled for.
    pub fn memory_mode(&self) -> MemoryMode {
        self.memory_mode
    }

    /// Call / back-edge counter.
    pub fn tier_up(&self) -> &TierUpCounter {
        &self.tier_up
    }

    /// This callee's OSR-entry callee.
    pub fn osr_entry(&self) -> &CalleeSlot {
        &self.osr_entry
    }

    /// Optimized replacement.
    pub fn replacement(&self) -> &CalleeSlot {
        &self.replacement
    }

    /// Flag guarding the OSR-entry compilation request.
    pub fn did_start_compiling_osr_entry(&self) -> &RequestFlag {
        &self.did_start_compiling_osr_entry
    }

    /// Flag guarding the optimizing compilation request.
    pub fn did_start_compiling_replacement(&self) -> &RequestFlag {
        &self.did_start_compiling_replacement
    }
}

/// Optimizing-tier payload.
#[derive(Debug)]
pub struct OptimizingCallee {
    jit: JitCode,
    memory_mode: MemoryMode,
    stackmaps: StackMaps,
}

impl OptimizingCallee {
    /// Memory mode the code was compiled for.
    pub fn memory_mode(&self) -> MemoryMode {
        self.memory_mode
    }
}

/// OSR-entry payload: optimizing code entered at one loop header.
#[derive(Debug)]
pub struct OsrEntryCallee {
    optimized: OptimizingCallee,
    loop_index: u32,
    scratch_buffer_size: usize,
}

impl OsrEntryCallee {
    /// Loop whose header this code is entered at.
    pub fn loop_index(&self) -> u32 {
        self.loop_index
    }

    /// Bytes the executing thread must allocate to transfer live state.
    pub fn scratch_buffer_size(&self) -> usize {
        self.scratch_buffer_size
    }

    /// Memory mode the code was compiled for.
    pub fn memory_mode(&self) -> MemoryMode {
        self.optimized.memory_mode
    }
}

/// Embedder entry stub payload.
#[derive(Debug)]
pub struct EmbedderEntryCallee {
    jit: JitCode,
}

impl Callee {
    /// Create an interpreter-tier callee.
    ///
    /// Its entrypoint is installed later with
    /// [`InterpreterCallee::set_entrypoint`]; until then it reports the
    /// dispatch's generic function entry.
    pub fn interpreter(
        identity: FunctionIdentity,
        code_block: FunctionCodeBlock,
        dispatch: InterpreterDispatch,
        tier_up: TierUpCounter,
    ) -> Arc<Self> {
        Arc::new(Self {
            mode: CompilationMode::Interpreter,
            identity,
            exception_handlers: HandlerTable::empty(),
            kind: CalleeKind::Interpreter(InterpreterCallee {
                code_block,
                dispatch,
                entrypoint: OnceLock::new(),
                tier_up,
                replacements: PerMemoryMode::from_fn(|_| CalleeSlot::new(SlotKind::Replacement)),
                osr_entries: PerMemoryMode::from_fn(|_| CalleeSlot::new(SlotKind::OsrEntry)),
                requests: PerMemoryMode::default(),
            }),
        })
    }

    /// Create a baseline-tier callee, linking its exception handlers.
    ///
    /// # Panics
    ///
    /// Panics if handler and landing-pad counts differ.
    pub fn baseline(
        identity: FunctionIdentity,
        code: CompiledCode,
        memory_mode: MemoryMode,
        tier_up: TierUpCounter,
    ) -> Arc<Self> {
        let (jit, stackmaps, handlers) = Self::link(code);
        Arc::new(Self {
            mode: CompilationMode::Baseline,
            identity,
            exception_handlers: handlers,
            kind: CalleeKind::Baseline(BaselineCallee {
                jit,
                memory_mode,
                stackmaps,
                tier_up,
                osr_entry: CalleeSlot::new(SlotKind::OsrEntry),
                replacement: CalleeSlot::new(SlotKind::Replacement),
                did_start_compiling_osr_entry: RequestFlag::new(),
                did_start_compiling_replacement: RequestFlag::new(),
            }),
        })
    }

    /// Create an optimizing-tier callee, linking its exception handlers.
    ///
    /// # Panics
    ///
    /// Panics if handler and landing-pad counts differ.
    pub fn optimizing(
        identity: FunctionIdentity,
        code: CompiledCode,
        memory_mode: MemoryMode,
    ) -> Arc<Self> {
        let (jit, stackmaps, handlers) = Self::link(code);
        Arc::new(Self {
            mode: CompilationMode::Optimizing,
            identity,
            exception_handlers: handlers,
            kind: CalleeKind::Optimizing(OptimizingCallee {
                jit,
                memory_mode,
                stackmaps,
            }),
        })
    }

    /// Create an OSR-entry callee for `loop_index`, linking its handlers.
    ///
    /// # Panics
    ///
    /// Panics if handler and landing-pad counts differ.
    pub fn osr_entry(
        identity: FunctionIdentity,
        code: CompiledCode,
        memory_mode: MemoryMode,
        loop_index: u32,
        scratch_buffer_size: usize,
    ) -> Arc<Self> {
        let (jit, stackmaps, handlers) = Self::link(code);
        Arc::new(Self {
            mode: CompilationMode::OptimizingOsrEntry,
            identity,
            exception_handlers: handlers,
            kind: CalleeKind::OsrEntry(OsrEntryCallee {
                optimized: OptimizingCallee {
                    jit,
                    memory_mode,
                    stackmaps,
                },
                loop_index,
                scratch_buffer_size,
            }),
        })
    }

    /// Create an embedder entry stub.
    pub fn embedder_entry(identity: FunctionIdentity, entrypoint: Entrypoint) -> Arc<Self> {
        Arc::new(Self {
            mode: CompilationMode::EmbedderEntry,
            identity,
            exception_handlers: HandlerTable::empty(),
            kind: CalleeKind::EmbedderEntry(EmbedderEntryCallee {
                jit: JitCode {
                    entrypoint,
                    call_sites: Box::new([]),
                },
            }),
        })
    }

    fn link(code: CompiledCode) -> (JitCode, StackMaps, HandlerTable) {
        let handlers = HandlerTable::link(code.unlinked_handlers, code.handler_locations);
        let jit = JitCode {
            entrypoint: code.entrypoint,
            call_sites: code.call_sites.into_boxed_slice(),
        };
        (jit, code.stackmaps, handlers)
    }

    /// Tier of this callee.
    pub fn mode(&self) -> CompilationMode {
        self.mode
    }

    /// Function identity.
    pub fn identity(&self) -> &FunctionIdentity {
        &self.identity
    }

    /// Function index.
    pub fn index(&self) -> FunctionIndex {
        self.identity.index()
    }

    /// Tier-specific payload.
    pub fn kind(&self) -> &CalleeKind {
        &self.kind
    }

    fn jit(&self) -> Option<&JitCode> {
        match &self.kind {
            CalleeKind::Interpreter(_) => None,
            CalleeKind::Baseline(b) => Some(&b.jit),
            CalleeKind::Optimizing(o) => Some(&o.jit),
            CalleeKind::OsrEntry(e) => Some(&e.optimized.jit),
            CalleeKind::EmbedderEntry(e) => Some(&e.jit),
        }
    }

    /// Address execution of this callee starts at.
    pub fn entrypoint(&self) -> CodePtr {
        match (&self.kind, self.jit()) {
            (CalleeKind::Interpreter(i), _) => i
                .installed_entrypoint()
                .unwrap_or(i.dispatch.function_entry),
            (_, Some(jit)) => jit.entrypoint.entry(),
            (_, None) => unreachable!("every non-interpreter callee carries JIT code"),
        }
    }

    /// Callee-saved registers spilled by this callee's prologue.
    pub fn callee_saved_registers(&self) -> &[RegisterAtOffset] {
        match (&self.kind, self.jit()) {
            (CalleeKind::Interpreter(_), _) => INTERPRETER_CALLEE_SAVES,
            (_, Some(jit)) => jit.entrypoint.callee_saves(),
            (_, None) => unreachable!("every non-interpreter callee carries JIT code"),
        }
    }

    /// Code range used to attribute a program counter to this callee.
    ///
    /// For interpreter callees this is the shared interpreter dispatch range.
    pub fn code_range(&self) -> CodeRange {
        match (&self.kind, self.jit()) {
            (CalleeKind::Interpreter(i), _) => i.dispatch.range,
            (_, Some(jit)) => jit.entrypoint.range(),
            (_, None) => unreachable!("every non-interpreter callee carries JIT code"),
        }
    }

    /// Call sites awaiting the external link pass. Empty for the interpreter.
    pub fn unlinked_calls(&self) -> &[UnlinkedCall] {
        match self.jit() {
            Some(jit) => &jit.call_sites,
            None => &[],
        }
    }

    /// Linked exception handlers.
    pub fn exception_handlers(&self) -> &HandlerTable {
        &self.exception_handlers
    }

    /// Returns `true` if the callee has protected regions.
    pub fn has_exception_handlers(&self) -> bool {
        !self.exception_handlers.is_empty()
    }

    /// Innermost handler catching `thrown` at code offset `offset`.
    ///
    /// `None` means the exception propagates to the caller's frame.
    pub fn handler_for(&self, offset: u32, thrown: Option<TagIndex>) -> Option<&HandlerInfo> {
        self.exception_handlers.lookup(offset, thrown)
    }

    /// Innermost handler catching `thrown` at absolute address `pc`.
    pub fn handler_for_pc(&self, pc: CodePtr, thrown: Option<TagIndex>) -> Option<&HandlerInfo> {
        let offset = self.code_range().offset_of(pc)?;
        self.handler_for(u32::try_from(offset).ok()?, thrown)
    }

    fn stackmaps(&self) -> Option<&StackMaps> {
        match &self.kind {
            CalleeKind::Baseline(b) => Some(&b.stackmaps),
            CalleeKind::Optimizing(o) => Some(&o.stackmaps),
            CalleeKind::OsrEntry(e) => Some(&e.optimized.stackmaps),
            CalleeKind::Interpreter(_) | CalleeKind::EmbedderEntry(_) => None,
        }
    }

    /// Stack map recorded at `index`.
    ///
    /// # Panics
    ///
    /// Panics if this tier records no stack maps or `index` was not
    /// instrumented.
    pub fn stackmap(&self, index: CallSiteIndex) -> &StackMap {
        match self.stackmaps() {
            Some(maps) => maps.get(index),
            None => panic!("{} callee records no stack maps", self.mode),
        }
    }

    /// Stack map recorded at `index`, if any.
    pub fn try_stackmap(&self, index: CallSiteIndex) -> Option<&StackMap> {
        self.stackmaps()?.try_get(index)
    }

    /// Memory mode compiled code was specialized for. `None` for the
    /// interpreter (which serves every mode) and the embedder entry.
    pub fn memory_mode(&self) -> Option<MemoryMode> {
        match &self.kind {
            CalleeKind::Baseline(b) => Some(b.memory_mode),
            CalleeKind::Optimizing(o) => Some(o.memory_mode),
            CalleeKind::OsrEntry(e) => Some(e.memory_mode()),
            CalleeKind::Interpreter(_) | CalleeKind::EmbedderEntry(_) => None,
        }
    }

    /// Slot an OSR-entry callee for `mode` is published into.
    ///
    /// # Panics
    ///
    /// Panics for tiers that do not tier up through OSR.
    pub fn osr_entry_slot(&self, mode: MemoryMode) -> &CalleeSlot {
        match &self.kind {
            CalleeKind::Interpreter(i) => i.osr_entry(mode),
            CalleeKind::Baseline(b) => b.osr_entry(),
            _ => panic!("{} callee has no OSR-entry slot", self.mode),
        }
    }

    /// Interpreter payload, if this is an interpreter callee.
    pub fn as_interpreter(&self) -> Option<&InterpreterCallee> {
        match &self.kind {
            CalleeKind::Interpreter(i) => Some(i),
            _ => None,
        }
    }

    /// Baseline payload, if this is a baseline callee.
    pub fn as_baseline(&self) -> Option<&BaselineCallee> {
        match &self.kind {
            CalleeKind::Baseline(b) => Some(b),
            _ => None,
        }
    }

    /// Optimizing payload, if this is an optimizing callee.
    pub fn as_optimizing(&self) -> Option<&OptimizingCallee> {
        match &self.kind {
            CalleeKind::Optimizing(o) => Some(o),
            _ => None,
        }
    }

    /// OSR-entry payload, if this is an OSR-entry callee.
    pub fn as_osr_entry(&self) -> Option<&OsrEntryCallee> {
        match &self.kind {
            CalleeKind::OsrEntry(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Debug for Callee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callee")
            .field("mode", &self.mode)
            .field("identity", &self.identity.to_string())
            .field("code_range", &self.code_range())
            .field("exception_handlers", &self.exception_handlers.len())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Callee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.identity, self.mode)
    }
}
