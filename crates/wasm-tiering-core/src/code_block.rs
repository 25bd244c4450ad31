//! Interpreter-tier function bodies.
//!
//! A [`FunctionCodeBlock`] is the interpreter's view of one function: its
//! bytecode plus the side tables tier-up needs (loop headers for OSR, try
//! regions for exception handlers, direct call targets for linking). The
//! bytecode encoding itself belongs to the interpreter and is opaque here.

use std::ops::Range;

use crate::callee::FunctionIndex;
use crate::handler::TagFilter;

/// A loop header that can serve as an OSR entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopHeader {
    /// Index of the loop within the function, in header order.
    pub loop_index: u32,
    /// Bytecode offset of the loop header.
    pub bytecode_offset: u32,
    /// Number of values live at the header (locals + operand stack).
    pub live_values: u32,
}

/// A `try` region and the filter of its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryRegion {
    /// Bytecode offsets covered by the region.
    pub range: Range<u32>,
    /// Which exceptions the handler catches.
    pub filter: TagFilter,
}

/// Bytecode and side tables of one interpreter-tier function.
#[derive(Debug, Clone, Default)]
pub struct FunctionCodeBlock {
    bytecode: Box<[u8]>,
    num_locals: u32,
    loops: Vec<LoopHeader>,
    try_regions: Vec<TryRegion>,
    call_targets: Vec<FunctionIndex>,
}

impl FunctionCodeBlock {
    /// Create a code block from bytecode.
    pub fn new(bytecode: impl Into<Box<[u8]>>) -> Self {
        Self {
            bytecode: bytecode.into(),
            ..Default::default()
        }
    }

    /// Set the number of locals.
    #[must_use]
    pub fn with_locals(mut self, num_locals: u32) -> Self {
        self.num_locals = num_locals;
        self
    }

    /// Add a loop header at `bytecode_offset`; its index is assigned in order.
    #[must_use]
    pub fn with_loop(mut self, bytecode_offset: u32, live_values: u32) -> Self {
        let loop_index = u32::try_from(self.loops.len()).unwrap_or(u32::MAX);
        self.loops.push(LoopHeader {
            loop_index,
            bytecode_offset,
            live_values,
        });
        self
    }

    /// Add a try region.
    ///
    /// # Panics
    ///
    /// Panics if the range is empty.
    #[must_use]
    pub fn with_try(mut self, range: Range<u32>, filter: TagFilter) -> Self {
        assert!(range.start < range.end, "try region must be non-empty");
        self.try_regions.push(TryRegion { range, filter });
        self
    }

    /// Add a direct call to `target`.
    #[must_use]
    pub fn with_call(mut self, target: FunctionIndex) -> Self {
        self.call_targets.push(target);
        self
    }

    /// Raw bytecode.
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    /// Number of locals.
    pub fn num_locals(&self) -> u32 {
        self.num_locals
    }

    /// Loop headers in index order.
    pub fn loops(&self) -> &[LoopHeader] {
        &self.loops
    }

    /// Find a loop header by index.
    pub fn loop_header(&self, loop_index: u32) -> Option<&LoopHeader> {
        self.loops.iter().find(|l| l.loop_index == loop_index)
    }

    /// Try regions in declaration order (outer before inner).
    pub fn try_regions(&self) -> &[TryRegion] {
        &self.try_regions
    }

    /// Direct call targets in call-site order.
    pub fn call_targets(&self) -> &[FunctionIndex] {
        &self.call_targets
    }
}
