//! Publish-once callee slots.
//!
//! A [`CalleeSlot`] is where a finished compilation becomes visible to
//! executing threads. Readers do a single acquire load and never block.
//! Publishers serialize on a mutex and publish with a release store, so a
//! reader sees either the previous callee or a fully linked new one.
//!
//! Slots are never cleared. A replacement slot may move up a tier
//! (baseline, then optimizing) but never down; every callee ever
//! published stays owned by the slot so a pointer a reader loaded is never
//! freed underneath it.

use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::Mutex;

use crate::callee::{Callee, CompilationMode};

/// What a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// A compiled replacement for normal calls (baseline or optimizing).
    Replacement,
    /// An OSR-entry callee for loop re-entry.
    OsrEntry,
}

impl SlotKind {
    /// Precedence of `mode` in this slot; higher wins. Panics for modes
    /// the slot cannot hold.
    fn rank(self, mode: CompilationMode) -> u8 {
        match (self, mode) {
            (SlotKind::Replacement, CompilationMode::Baseline) => 1,
            (SlotKind::Replacement, CompilationMode::Optimizing) => 2,
            (SlotKind::OsrEntry, CompilationMode::OptimizingOsrEntry) => 1,
            _ => panic!("{mode} callee cannot be published into a {self:?} slot"),
        }
    }
}

/// Atomically published, never-cleared reference to a callee.
pub struct CalleeSlot {
    kind: SlotKind,
    current: AtomicPtr<Callee>,
    /// Strong references to every callee ever published here.
    published: Mutex<Vec<Arc<Callee>>>,
}

impl CalleeSlot {
    /// Create an empty slot.
    pub fn new(kind: SlotKind) -> Self {
        Self {
            kind,
            current: AtomicPtr::new(std::ptr::null_mut()),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Kind of callee this slot holds.
    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    /// Publish `callee` if it outranks the current occupant.
    ///
    /// Replacement slots accept a callee when empty or when the current
    /// callee is a strictly lower tier. OSR-entry slots accept only the
    /// first callee. A rejected callee is handed back so the caller can
    /// drop it; nothing published ever refers to it.
    ///
    /// # Panics
    ///
    /// Panics if `callee` is of a tier this slot cannot hold.
    pub fn publish(&self, callee: Arc<Callee>) -> Result<(), Arc<Callee>> {
        let rank = self.kind.rank(callee.mode());
        let mut published = self.published.lock();

        if let Some(current) = published.last() {
            if self.kind.rank(current.mode()) >= rank {
                return Err(callee);
            }
        }

        let ptr = Arc::as_ptr(&callee).cast_mut();
        published.push(callee);
        self.current.store(ptr, Ordering::Release);
        Ok(())
    }

    /// Load the current callee.
    #[allow(unsafe_code)]
    pub fn load(&self) -> Option<Arc<Callee>> {
        let ptr = self.current.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: `ptr` came from `Arc::as_ptr` on an Arc that `published`
        // holds until this slot is dropped, and `&self` keeps the slot alive
        // for the duration of this call.
        unsafe {
            Arc::increment_strong_count(ptr);
            Some(Arc::from_raw(ptr))
        }
    }

    /// Compilation mode of the current callee, without taking a reference.
    pub fn current_mode(&self) -> Option<CompilationMode> {
        self.load().map(|callee| callee.mode())
    }

    /// Every callee ever published here, oldest first.
    ///
    /// Superseded callees may still be executing on some thread, so
    /// unwinding attribution has to see them too.
    pub fn history(&self) -> Vec<Arc<Callee>> {
        self.published.lock().clone()
    }

    /// Check whether anything was ever published.
    pub fn is_set(&self) -> bool {
        !self.current.load(Ordering::Acquire).is_null()
    }
}

impl std::fmt::Debug for CalleeSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalleeSlot")
            .field("kind", &self.kind)
            .field("current", &self.current_mode())
            .finish()
    }
}
