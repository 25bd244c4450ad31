//! Compiler backend boundary.
//!
//! The tiering core does not generate machine code. A [`TierCompiler`]
//! takes a [`CompileRequest`], allocates executable memory and returns the
//! pieces a callee is built from. Everything it returns is unlinked: the
//! coordinator pairs handlers with landing pads when it constructs the
//! callee, and call sites are resolved by a later link pass.
//!
//! [`SyntheticBackend`] lays out code deterministically from the bytecode
//! so the tiering contract can be driven end to end without a real JIT.

use std::fmt;
use std::sync::Arc;

use wasm_tiering_common::TierError;

use crate::callee::{Callee, CompiledCode, FunctionIdentity, UnlinkedCall};
use crate::code_block::FunctionCodeBlock;
use crate::entrypoint::{Entrypoint, Reg, RegisterAtOffset};
use crate::executable::ExecutableAllocator;
use crate::handler::UnlinkedHandlerInfo;
use crate::memory_mode::MemoryMode;
use crate::stackmap::{CallSiteIndex, StackMap, StackMaps, ValueLocation};

/// Tier a compilation produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompileTier {
    /// Baseline JIT code.
    Baseline,
    /// Optimizing JIT code.
    Optimizing,
    /// Optimizing code entered at the header of `loop_index`.
    OsrEntry {
        /// Loop the code is entered at.
        loop_index: u32,
    },
}

impl fmt::Display for CompileTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileTier::Baseline => write!(f, "baseline"),
            CompileTier::Optimizing => write!(f, "optimizing"),
            CompileTier::OsrEntry { loop_index } => write!(f, "osr-entry[loop {loop_index}]"),
        }
    }
}

/// One compilation job.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// Interpreter callee of the function; source of bytecode and identity.
    pub function: Arc<Callee>,
    /// Tier to produce.
    pub tier: CompileTier,
    /// Memory mode to specialize for.
    pub memory_mode: MemoryMode,
}

impl CompileRequest {
    /// Identity of the function being compiled.
    pub fn identity(&self) -> &FunctionIdentity {
        self.function.identity()
    }

    /// Bytecode and side tables to compile.
    ///
    /// # Panics
    ///
    /// Panics if the request was not built from an interpreter callee.
    pub fn code_block(&self) -> &FunctionCodeBlock {
        match self.function.as_interpreter() {
            Some(interpreter) => interpreter.code_block(),
            None => panic!("compile request for {} must name an interpreter callee", self.function),
        }
    }
}

/// What a backend hands back.
#[derive(Debug)]
pub struct BackendOutput {
    /// Code, call sites, stack maps and unlinked handlers.
    pub code: CompiledCode,
    /// Scratch bytes an OSR entry needs for transferred state; zero otherwise.
    pub scratch_buffer_size: usize,
}

/// A code generator for one or more tiers.
pub trait TierCompiler: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    /// Compile `request`, allocating code from `allocator`.
    ///
    /// # Errors
    ///
    /// Returns `TierError::OutOfExecutableMemory` if the code does not fit,
    /// or `TierError::CompilationFailed` if the request cannot be compiled.
    fn compile(
        &self,
        request: &CompileRequest,
        allocator: &ExecutableAllocator,
    ) -> Result<BackendOutput, TierError>;
}

/// Prologue bytes before the first instruction of the body.
const PROLOGUE_SIZE: usize = 32;

/// Bytes per landing pad stub.
const LANDING_PAD_SIZE: usize = 16;

/// Bytes per live value in an OSR scratch buffer.
const SCRATCH_SLOT_SIZE: usize = 8;

/// Deterministic stand-in for a JIT.
///
/// Each bytecode byte becomes a fixed number of machine-code bytes per
/// tier. Try regions, call sites and loop headers are mapped through the
/// same scaling, and landing pads follow the body.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntheticBackend;

impl SyntheticBackend {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }

    fn expansion(tier: CompileTier) -> usize {
        match tier {
            CompileTier::Baseline => 4,
            CompileTier::Optimizing | CompileTier::OsrEntry { .. } => 2,
        }
    }

    fn callee_saves(tier: CompileTier) -> Vec<RegisterAtOffset> {
        match tier {
            CompileTier::Baseline => vec![RegisterAtOffset::new(Reg(3), -8)],
            CompileTier::Optimizing | CompileTier::OsrEntry { .. } => vec![
                RegisterAtOffset::new(Reg(3), -8),
                RegisterAtOffset::new(Reg(12), -16),
                RegisterAtOffset::new(Reg(13), -24),
            ],
        }
    }

    /// Body size and total code size, or `None` if they do not fit in the
    /// address space.
    fn layout(bytecode_len: usize, handlers: usize, factor: usize) -> Option<(usize, usize)> {
        let body = bytecode_len.max(1).checked_mul(factor)?;
        let size = handlers
            .checked_mul(LANDING_PAD_SIZE)?
            .checked_add(body)?
            .checked_add(PROLOGUE_SIZE)?;
        Some((body, size))
    }

    fn live_values(count: u32) -> StackMap {
        let values = (0..count)
            .map(|slot| match u8::try_from(slot) {
                Ok(reg) if reg < 4 => ValueLocation::Register(Reg(reg)),
                _ => ValueLocation::Stack(
                    i32::try_from(slot + 1).map_or(i32::MIN, |s| s.saturating_mul(-8)),
                ),
            })
            .collect();
        StackMap::new(values)
    }
}

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

impl TierCompiler for SyntheticBackend {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn compile(
        &self,
        request: &CompileRequest,
        allocator: &ExecutableAllocator,
    ) -> Result<BackendOutput, TierError> {
        let block = request.code_block();
        let index = request.identity().index();
        let factor = Self::expansion(request.tier);
        let handlers = block.try_regions().len();
        let Some((body, size)) = Self::layout(block.bytecode().len(), handlers, factor) else {
            return Err(TierError::out_of_executable_memory(
                usize::MAX,
                allocator.bytes_free(),
            ));
        };

        let (entry_offset, scratch_buffer_size) = match request.tier {
            CompileTier::OsrEntry { loop_index } => {
                let Some(header) = block.loop_header(loop_index) else {
                    return Err(TierError::compilation_failed(
                        index.0,
                        format!("no loop header {loop_index}"),
                    ));
                };
                let offset = PROLOGUE_SIZE + header.bytecode_offset as usize * factor;
                let live = header.live_values as usize + block.num_locals() as usize;
                (offset.min(size - 1), live * SCRATCH_SLOT_SIZE)
            }
            CompileTier::Baseline | CompileTier::Optimizing => (0, 0),
        };

        let memory = allocator.allocate(size)?;
        let start = memory.range().start();
        let body_offset = |bytecode: u32| to_u32(PROLOGUE_SIZE + bytecode as usize * factor);

        let unlinked_handlers = block
            .try_regions()
            .iter()
            .map(|region| {
                UnlinkedHandlerInfo::new(
                    body_offset(region.range.start)..body_offset(region.range.end),
                    region.filter,
                )
            })
            .collect();
        let handler_locations = (0..handlers)
            .map(|i| start.offset(PROLOGUE_SIZE + body + i * LANDING_PAD_SIZE))
            .collect();

        let calls = block.call_targets();
        let stride = body / (calls.len() + 1);
        let call_sites = calls
            .iter()
            .enumerate()
            .map(|(i, &target)| UnlinkedCall {
                call_offset: to_u32(PROLOGUE_SIZE + (i + 1) * stride),
                target,
            })
            .collect();

        let locals = block.num_locals();
        let mut stackmaps: StackMaps = (0..calls.len())
            .map(|i| (CallSiteIndex(to_u32(i)), Self::live_values(locals)))
            .collect();
        for header in block.loops() {
            stackmaps.insert(
                CallSiteIndex(to_u32(calls.len()) + header.loop_index),
                Self::live_values(locals + header.live_values),
            );
        }

        Ok(BackendOutput {
            code: CompiledCode {
                entrypoint: Entrypoint::new(memory, entry_offset, Self::callee_saves(request.tier)),
                call_sites,
                stackmaps,
                unlinked_handlers,
                handler_locations,
            },
            scratch_buffer_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callee::{FunctionIndex, InterpreterDispatch};
    use crate::entrypoint::{CodePtr, CodeRange};
    use crate::handler::{TagFilter, TagIndex};
    use crate::tier_up::TierUpCounter;

    fn function(block: FunctionCodeBlock) -> Arc<Callee> {
        Callee::interpreter(
            FunctionIdentity::new(FunctionIndex(3)),
            block,
            InterpreterDispatch::new(
                CodeRange::from_len(CodePtr::new(0x1000), 0x100),
                CodePtr::new(0x1000),
            ),
            TierUpCounter::new(1, 1),
        )
    }

    fn request(block: FunctionCodeBlock, tier: CompileTier) -> CompileRequest {
        CompileRequest {
            function: function(block),
            tier,
            memory_mode: MemoryMode::BoundsChecking,
        }
    }

    #[test]
    fn test_layout_scales_with_tier() {
        let allocator = ExecutableAllocator::new(64 * 1024);
        let block = FunctionCodeBlock::new(vec![0u8; 16]);

        let baseline = SyntheticBackend
            .compile(&request(block.clone(), CompileTier::Baseline), &allocator)
            .unwrap();
        let optimizing = SyntheticBackend
            .compile(&request(block, CompileTier::Optimizing), &allocator)
            .unwrap();

        assert_eq!(baseline.code.entrypoint.range().len(), PROLOGUE_SIZE + 64);
        assert_eq!(optimizing.code.entrypoint.range().len(), PROLOGUE_SIZE + 32);
        assert!(!baseline.code.entrypoint.range().overlaps(&optimizing.code.entrypoint.range()));
        assert_eq!(baseline.scratch_buffer_size, 0);
    }

    #[test]
    fn test_handlers_and_landing_pads() {
        let allocator = ExecutableAllocator::new(64 * 1024);
        let block = FunctionCodeBlock::new(vec![0u8; 32])
            .with_try(8..16, TagFilter::Tag(TagIndex(0)))
            .with_try(9..12, TagFilter::CatchAll);

        let output = SyntheticBackend
            .compile(&request(block, CompileTier::Optimizing), &allocator)
            .unwrap();
        let code = &output.code;
        let range = code.entrypoint.range();

        assert_eq!(code.unlinked_handlers.len(), code.handler_locations.len());
        assert_eq!(code.unlinked_handlers[0].range, 48..64);
        assert_eq!(code.unlinked_handlers[1].range, 50..56);
        for pad in &code.handler_locations {
            assert!(range.contains(*pad));
        }
    }

    #[test]
    fn test_call_sites_and_stackmaps() {
        let allocator = ExecutableAllocator::new(64 * 1024);
        let block = FunctionCodeBlock::new(vec![0u8; 24])
            .with_locals(2)
            .with_loop(4, 1)
            .with_call(FunctionIndex(0))
            .with_call(FunctionIndex(1));

        let output = SyntheticBackend
            .compile(&request(block, CompileTier::Baseline), &allocator)
            .unwrap();
        let code = &output.code;
        let len = code.entrypoint.range().len();

        assert_eq!(code.call_sites.len(), 2);
        assert_eq!(code.call_sites[1].target, FunctionIndex(1));
        assert!(code.call_sites.iter().all(|c| (c.call_offset as usize) < len));
        assert_eq!(code.stackmaps.len(), 3);
        assert_eq!(code.stackmaps.get(CallSiteIndex(0)).len(), 2);
        assert_eq!(code.stackmaps.get(CallSiteIndex(2)).len(), 3);
    }

    #[test]
    fn test_osr_entry_enters_at_loop_header() {
        let allocator = ExecutableAllocator::new(64 * 1024);
        let block = FunctionCodeBlock::new(vec![0u8; 32])
            .with_locals(1)
            .with_loop(10, 2);

        let output = SyntheticBackend
            .compile(&request(block, CompileTier::OsrEntry { loop_index: 0 }), &allocator)
            .unwrap();
        let entrypoint = &output.code.entrypoint;

        assert_eq!(
            entrypoint.entry(),
            entrypoint.range().start().offset(PROLOGUE_SIZE + 20)
        );
        assert_eq!(output.scratch_buffer_size, 3 * SCRATCH_SLOT_SIZE);
    }

    #[test]
    fn test_osr_entry_unknown_loop_fails() {
        let allocator = ExecutableAllocator::new(64 * 1024);
        let err = SyntheticBackend
            .compile(
                &request(FunctionCodeBlock::new(vec![0u8; 8]), CompileTier::OsrEntry { loop_index: 5 }),
                &allocator,
            )
            .unwrap_err();

        assert_eq!(err, TierError::compilation_failed(3, "no loop header 5"));
        assert_eq!(allocator.bytes_in_use(), 0);
    }

    #[test]
    fn test_layout_overflow_is_reported() {
        assert_eq!(SyntheticBackend::layout(16, 1, 2), Some((32, PROLOGUE_SIZE + 32 + LANDING_PAD_SIZE)));
        assert_eq!(SyntheticBackend::layout(usize::MAX / 2, 0, 4), None);
        assert_eq!(SyntheticBackend::layout(1, usize::MAX, 2), None);
    }

    #[test]
    fn test_out_of_executable_memory() {
        let allocator = ExecutableAllocator::new(64);
        let err = SyntheticBackend
            .compile(
                &request(FunctionCodeBlock::new(vec![0u8; 64]), CompileTier::Baseline),
                &allocator,
            )
            .unwrap_err();

        assert!(err.is_resource_exhaustion());
    }
}
