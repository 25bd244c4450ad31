//! Executable memory reservation.
//!
//! [`ExecutableAllocator`] hands out non-overlapping blocks of a fixed
//! reservation of executable address space. Every JIT callee and import
//! trampoline owns one [`ExecutableMemory`] block; dropping the block
//! returns it to the reservation. When no free block is large enough the
//! allocation fails with [`TierError::OutOfExecutableMemory`], which is the
//! one error the tiering core expects callers to handle.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use wasm_tiering_common::TierError;

use crate::entrypoint::{CodePtr, CodeRange};

/// Base address of reservations created with [`ExecutableAllocator::new`].
pub const DEFAULT_RESERVATION_BASE: usize = 0x7f00_0000_0000;

/// Allocation granularity in bytes.
pub const CODE_ALIGNMENT: usize = 16;

/// Thread-safe allocator over a fixed executable reservation.
///
/// Cloning is cheap and every clone shares the same reservation.
#[derive(Clone)]
pub struct ExecutableAllocator {
    inner: Arc<Reservation>,
}

struct Reservation {
    base: usize,
    capacity: usize,
    /// Free blocks as `(start, len)`, sorted by start and coalesced.
    free: Mutex<Vec<(usize, usize)>>,
}

impl ExecutableAllocator {
    /// Create a reservation of `capacity` bytes at the default base.
    pub fn new(capacity: usize) -> Self {
        Self::with_base(DEFAULT_RESERVATION_BASE, capacity)
    }

    /// Create a reservation of `capacity` bytes starting at `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not aligned to [`CODE_ALIGNMENT`].
    pub fn with_base(base: usize, capacity: usize) -> Self {
        assert_eq!(base % CODE_ALIGNMENT, 0, "reservation base must be aligned");
        let capacity = capacity - capacity % CODE_ALIGNMENT;
        let free = if capacity == 0 {
            Vec::new()
        } else {
            vec![(base, capacity)]
        };

        debug!(base = %CodePtr::new(base), capacity, "Executable reservation created");

        Self {
            inner: Arc::new(Reservation {
                base,
                capacity,
                free: Mutex::new(free),
            }),
        }
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `TierError::OutOfExecutableMemory` if no free block fits.
    pub fn allocate(&self, size: usize) -> Result<ExecutableMemory, TierError> {
        let Some(size) = size.max(1).checked_next_multiple_of(CODE_ALIGNMENT) else {
            let available = self.bytes_free();
            warn!(requested = size, available, "Executable memory request too large");
            return Err(TierError::out_of_executable_memory(size, available));
        };
        let mut free = self.inner.free.lock();

        let Some(slot) = free.iter().position(|&(_, len)| len >= size) else {
            let available = free.iter().map(|&(_, len)| len).sum();
            drop(free);
            warn!(requested = size, available, "Executable memory exhausted");
            return Err(TierError::out_of_executable_memory(size, available));
        };

        let (start, len) = free[slot];
        if len == size {
            free.remove(slot);
        } else {
            free[slot] = (start + size, len - size);
        }

        Ok(ExecutableMemory {
            range: CodeRange::from_len(CodePtr::new(start), size),
            reservation: Arc::clone(&self.inner),
        })
    }

    /// Total size of the reservation in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Bytes currently handed out.
    pub fn bytes_in_use(&self) -> usize {
        self.inner.capacity - self.bytes_free()
    }

    /// Bytes currently free (possibly fragmented).
    pub fn bytes_free(&self) -> usize {
        self.inner.free.lock().iter().map(|&(_, len)| len).sum()
    }

    /// Whole reservation as a range, or `None` if it is empty.
    pub fn reservation_range(&self) -> Option<CodeRange> {
        (self.inner.capacity > 0)
            .then(|| CodeRange::from_len(CodePtr::new(self.inner.base), self.inner.capacity))
    }
}

impl std::fmt::Debug for ExecutableAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableAllocator")
            .field("base", &CodePtr::new(self.inner.base))
            .field("capacity", &self.inner.capacity)
            .field("bytes_free", &self.bytes_free())
            .finish()
    }
}

impl Reservation {
    fn release(&self, start: usize, len: usize) {
        let mut free = self.free.lock();
        let at = free.partition_point(|&(s, _)| s < start);
        free.insert(at, (start, len));

        // Merge with the following block, then with the preceding one.
        if at + 1 < free.len() && free[at].0 + free[at].1 == free[at + 1].0 {
            free[at].1 += free[at + 1].1;
            free.remove(at + 1);
        }
        if at > 0 && free[at - 1].0 + free[at - 1].1 == free[at].0 {
            free[at - 1].1 += free[at].1;
            free.remove(at);
        }
    }
}

/// A block of executable memory owned by one callee or trampoline.
pub struct ExecutableMemory {
    range: CodeRange,
    reservation: Arc<Reservation>,
}

#[allow(clippy::len_without_is_empty)]
impl ExecutableMemory {
    /// Address range of the block.
    pub fn range(&self) -> CodeRange {
        self.range
    }

    /// Size of the block in bytes.
    pub fn len(&self) -> usize {
        self.range.len()
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        self.reservation
            .release(self.range.start().address(), self.range.len());
    }
}

impl std::fmt::Debug for ExecutableMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableMemory")
            .field("range", &self.range)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocations_do_not_overlap() {
        let allocator = ExecutableAllocator::new(1024);
        let a = allocator.allocate(100).unwrap();
        let b = allocator.allocate(100).unwrap();

        assert!(!a.range().overlaps(&b.range()));
        assert_eq!(a.len(), 112); // rounded to CODE_ALIGNMENT
        assert_eq!(allocator.bytes_in_use(), 224);
    }

    #[test]
    fn test_exhaustion_reports_error() {
        let allocator = ExecutableAllocator::new(64);
        let _held = allocator.allocate(48).unwrap();

        let err = allocator.allocate(32).unwrap_err();
        assert!(err.is_resource_exhaustion());
        assert_eq!(
            err,
            TierError::OutOfExecutableMemory {
                requested: 32,
                available: 16,
            }
        );
    }

    #[test]
    fn test_drop_returns_memory() {
        let allocator = ExecutableAllocator::new(256);
        let a = allocator.allocate(64).unwrap();
        let b = allocator.allocate(64).unwrap();
        let c = allocator.allocate(64).unwrap();
        assert_eq!(allocator.bytes_free(), 64);

        drop(b);
        drop(a);
        drop(c);

        assert_eq!(allocator.bytes_free(), 256);
        // Coalesced back into one block, so a full-size allocation fits.
        assert!(allocator.allocate(256).is_ok());
    }

    #[test]
    fn test_reuse_after_free() {
        let allocator = ExecutableAllocator::new(128);
        let a = allocator.allocate(128).unwrap();
        let start = a.range().start();
        drop(a);

        let b = allocator.allocate(32).unwrap();
        assert_eq!(b.range().start(), start);
    }

    #[test]
    fn test_oversized_request_is_exhaustion() {
        let allocator = ExecutableAllocator::new(1024);

        let err = allocator.allocate(usize::MAX).unwrap_err();

        assert!(err.is_resource_exhaustion());
        assert_eq!(
            err,
            TierError::OutOfExecutableMemory {
                requested: usize::MAX,
                available: 1024,
            }
        );
        assert_eq!(allocator.bytes_in_use(), 0);
    }

    #[test]
    fn test_empty_reservation() {
        let allocator = ExecutableAllocator::new(0);
        assert!(allocator.reservation_range().is_none());
        assert!(allocator.allocate(1).is_err());
    }
}
