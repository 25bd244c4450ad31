//! Import bindings.
//!
//! Every imported function needs an exit stub: a trampoline WebAssembly code
//! calls to leave for the host. This module provides the
//! [`ImportBinder`] trait that produces them and [`TrampolineBinder`],
//! which carves fixed-size stubs out of the engine's executable memory.
//!
//! The tiering core never interprets a trampoline; it only keeps the
//! binding alive and hands out its entry address when a call is linked.

use tracing::{debug, warn};

use wasm_tiering_common::BindingError;
use wasm_tiering_core::{CodePtr, CodeRange, ExecutableAllocator, ExecutableMemory};

/// Index into the module's type section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignatureIndex(pub u32);

/// Exit stub for one imported function.
#[derive(Debug)]
pub struct ImportBinding {
    import_index: u32,
    signature: SignatureIndex,
    trampoline: ExecutableMemory,
}

impl ImportBinding {
    /// Create a binding owning `trampoline`.
    pub fn new(import_index: u32, signature: SignatureIndex, trampoline: ExecutableMemory) -> Self {
        Self {
            import_index,
            signature,
            trampoline,
        }
    }

    /// Index of the import in the module's function index space.
    pub fn import_index(&self) -> u32 {
        self.import_index
    }

    /// Signature the trampoline was generated for.
    pub fn signature(&self) -> SignatureIndex {
        self.signature
    }

    /// Address WebAssembly calls to reach the host function.
    pub fn entry(&self) -> CodePtr {
        self.trampoline.range().start()
    }

    /// Code range of the trampoline.
    pub fn code_range(&self) -> CodeRange {
        self.trampoline.range()
    }
}

/// Produces exit stubs for imported functions.
pub trait ImportBinder: Send + Sync {
    /// Generate the exit stub for import `import_index`.
    ///
    /// # Errors
    ///
    /// Returns `BindingError::OutOfMemory` if there is no executable memory
    /// left for the trampoline.
    fn bind(
        &self,
        import_index: u32,
        signature: SignatureIndex,
    ) -> Result<ImportBinding, BindingError>;
}

/// Default trampoline size in bytes.
pub const DEFAULT_TRAMPOLINE_SIZE: usize = 128;

/// Binder that allocates fixed-size trampolines.
#[derive(Debug, Clone)]
pub struct TrampolineBinder {
    allocator: ExecutableAllocator,
    trampoline_size: usize,
}

impl TrampolineBinder {
    /// Create a binder allocating from `allocator`.
    pub fn new(allocator: ExecutableAllocator) -> Self {
        Self::with_trampoline_size(allocator, DEFAULT_TRAMPOLINE_SIZE)
    }

    /// Create a binder emitting `trampoline_size`-byte stubs.
    pub fn with_trampoline_size(allocator: ExecutableAllocator, trampoline_size: usize) -> Self {
        Self {
            allocator,
            trampoline_size,
        }
    }
}

impl ImportBinder for TrampolineBinder {
    fn bind(
        &self,
        import_index: u32,
        signature: SignatureIndex,
    ) -> Result<ImportBinding, BindingError> {
        let trampoline = self.allocator.allocate(self.trampoline_size).map_err(|err| {
            warn!(import_index, error = %err, "No executable memory for import trampoline");
            BindingError::OutOfMemory { import_index }
        })?;

        debug!(
            import_index,
            signature = signature.0,
            entry = %trampoline.range().start(),
            "Import trampoline emitted"
        );
        Ok(ImportBinding::new(import_index, signature, trampoline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_allocates_trampoline() {
        let allocator = ExecutableAllocator::new(4096);
        let binder = TrampolineBinder::new(allocator.clone());

        let binding = binder.bind(3, SignatureIndex(1)).unwrap();

        assert_eq!(binding.import_index(), 3);
        assert_eq!(binding.signature(), SignatureIndex(1));
        assert!(binding.code_range().contains(binding.entry()));
        assert_eq!(allocator.bytes_in_use(), DEFAULT_TRAMPOLINE_SIZE);

        drop(binding);
        assert_eq!(allocator.bytes_in_use(), 0);
    }

    #[test]
    fn test_bind_out_of_memory() {
        let allocator = ExecutableAllocator::new(256);
        let binder = TrampolineBinder::new(allocator);

        let _first = binder.bind(0, SignatureIndex(0)).unwrap();
        let _second = binder.bind(1, SignatureIndex(0)).unwrap();
        let err = binder.bind(2, SignatureIndex(0)).unwrap_err();

        assert_eq!(err, BindingError::OutOfMemory { import_index: 2 });
    }

    #[test]
    fn test_trampolines_do_not_overlap() {
        let binder = TrampolineBinder::with_trampoline_size(ExecutableAllocator::new(4096), 48);

        let a = binder.bind(0, SignatureIndex(0)).unwrap();
        let b = binder.bind(1, SignatureIndex(0)).unwrap();

        assert!(!a.code_range().overlaps(&b.code_range()));
        assert_eq!(a.code_range().len(), 48);
    }
}
