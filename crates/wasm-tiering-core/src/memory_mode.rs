//! Memory modes and per-mode storage.
//!
//! The same function may run under more than one linear-memory discipline
//! at once (module instances sharing code but differing in heap setup).
//! Each mode needs its own compiled code and tiers up on its own, so tiering
//! state is kept in a [`PerMemoryMode`] array indexed by [`MemoryMode`].

use std::fmt;

/// Number of memory modes.
pub const NUMBER_OF_MEMORY_MODES: usize = 2;

/// Addressing / bounds-checking discipline of a linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryMode {
    /// Explicit bounds checks before each memory access.
    BoundsChecking,
    /// Guard pages; out-of-bounds accesses trap through a signal handler.
    Signaling,
}

impl MemoryMode {
    /// Every mode, in index order.
    pub const ALL: [MemoryMode; NUMBER_OF_MEMORY_MODES] =
        [MemoryMode::BoundsChecking, MemoryMode::Signaling];

    /// Array index of this mode.
    pub const fn index(self) -> usize {
        match self {
            MemoryMode::BoundsChecking => 0,
            MemoryMode::Signaling => 1,
        }
    }
}

impl fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryMode::BoundsChecking => write!(f, "bounds-checking"),
            MemoryMode::Signaling => write!(f, "signaling"),
        }
    }
}

/// Fixed-size storage with one `T` per memory mode.
#[derive(Debug, Default)]
pub struct PerMemoryMode<T> {
    slots: [T; NUMBER_OF_MEMORY_MODES],
}

impl<T> PerMemoryMode<T> {
    /// Build storage by calling `f` once per mode.
    pub fn from_fn(mut f: impl FnMut(MemoryMode) -> T) -> Self {
        Self {
            slots: MemoryMode::ALL.map(&mut f),
        }
    }

    /// Get the value for `mode`.
    pub fn get(&self, mode: MemoryMode) -> &T {
        &self.slots[mode.index()]
    }
}

impl<T> std::ops::Index<MemoryMode> for PerMemoryMode<T> {
    type Output = T;

    fn index(&self, mode: MemoryMode) -> &T {
        self.get(mode)
    }
}
