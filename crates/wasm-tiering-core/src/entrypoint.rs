//! Code addresses, code ranges and entrypoint descriptors.
//!
//! - [`CodePtr`]: an executable address
//! - [`CodeRange`]: a non-empty `[start, end)` span used to attribute a
//!   program counter to the callee that owns it
//! - [`RegisterAtOffset`]: a callee-saved register and its save slot
//! - [`Entrypoint`]: the descriptor a backend hands over for one function

use std::fmt;

use crate::executable::ExecutableMemory;

/// An executable code address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodePtr(usize);

impl CodePtr {
    /// Wrap a raw address.
    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    /// Get the raw address.
    pub const fn address(self) -> usize {
        self.0
    }

    /// Offset this address by `bytes`.
    ///
    /// # Panics
    ///
    /// Panics on address overflow.
    #[must_use]
    pub fn offset(self, bytes: usize) -> Self {
        Self(
            self.0
                .checked_add(bytes)
                .expect("code address overflow"),
        )
    }
}

impl fmt::Debug for CodePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodePtr({:#x})", self.0)
    }
}

impl fmt::Display for CodePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A non-empty `[start, end)` range of code addresses.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeRange {
    start: CodePtr,
    end: CodePtr,
}

// Ranges are non-empty by construction.
#[allow(clippy::len_without_is_empty)]
impl CodeRange {
    /// Create a range.
    ///
    /// # Panics
    ///
    /// Panics if `start >= end`. An empty code range cannot own any
    /// program counter, so constructing one is a caller bug.
    pub fn new(start: CodePtr, end: CodePtr) -> Self {
        assert!(
            start < end,
            "code range must be non-empty: [{start}, {end})"
        );
        Self { start, end }
    }

    /// Create a range from a start address and a length in bytes.
    pub fn from_len(start: CodePtr, len: usize) -> Self {
        Self::new(start, start.offset(len))
    }

    /// First address in the range.
    pub const fn start(&self) -> CodePtr {
        self.start
    }

    /// One past the last address in the range.
    pub const fn end(&self) -> CodePtr {
        self.end
    }

    /// Length in bytes. Never zero.
    pub const fn len(&self) -> usize {
        self.end.0 - self.start.0
    }

    /// Check whether `pc` lies inside the range.
    pub fn contains(&self, pc: CodePtr) -> bool {
        self.start <= pc && pc < self.end
    }

    /// Check whether two ranges share at least one address.
    pub fn overlaps(&self, other: &CodeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Offset of `pc` from the start of the range, if it is inside.
    pub fn offset_of(&self, pc: CodePtr) -> Option<usize> {
        self.contains(pc).then(|| pc.0 - self.start.0)
    }
}

impl fmt::Debug for CodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A machine register id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u8);

/// A callee-saved register and the frame offset of its save slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterAtOffset {
    /// The saved register.
    pub reg: Reg,
    /// Offset of the save slot from the frame pointer.
    pub offset: i32,
}

impl RegisterAtOffset {
    /// Create a new save-slot record.
    pub const fn new(reg: Reg, offset: i32) -> Self {
        Self { reg, offset }
    }
}

/// Entry descriptor produced by a backend for one compiled function.
///
/// Owns the executable memory holding the code, so the code lives exactly
/// as long as the callee built from this descriptor.
#[derive(Debug)]
pub struct Entrypoint {
    memory: ExecutableMemory,
    entry_offset: usize,
    callee_saves: Box<[RegisterAtOffset]>,
}

impl Entrypoint {
    /// Create a descriptor.
    ///
    /// # Panics
    ///
    /// Panics if `entry_offset` is outside the code block.
    pub fn new(
        memory: ExecutableMemory,
        entry_offset: usize,
        callee_saves: Vec<RegisterAtOffset>,
    ) -> Self {
        assert!(
            entry_offset < memory.len(),
            "entry offset {entry_offset:#x} outside code block of {} bytes",
            memory.len()
        );
        Self {
            memory,
            entry_offset,
            callee_saves: callee_saves.into_boxed_slice(),
        }
    }

    /// Address execution starts at.
    pub fn entry(&self) -> CodePtr {
        self.memory.range().start().offset(self.entry_offset)
    }

    /// Range of the owned code block.
    pub fn range(&self) -> CodeRange {
        self.memory.range()
    }

    /// Callee-saved registers spilled by the prologue.
    pub fn callee_saves(&self) -> &[RegisterAtOffset] {
        &self.callee_saves
    }
}
