//! Exception handler tables.
//!
//! A backend reports each protected region as an [`UnlinkedHandlerInfo`]
//! (code-offset range + tag filter) and, separately, the landing-pad
//! address it ended up emitting for it. [`HandlerTable::link`] pairs the
//! two into the final table. Lookups pick the innermost matching handler.

use std::ops::Range;

use crate::entrypoint::CodePtr;

/// Index of an exception tag in the module's tag space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagIndex(pub u32);

/// Which thrown exceptions a handler catches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagFilter {
    /// `catch $tag`: only WebAssembly exceptions carrying this tag.
    Tag(TagIndex),
    /// `catch_all`: every exception, including ones thrown by the host.
    CatchAll,
}

impl TagFilter {
    /// Check whether this filter accepts `thrown`.
    ///
    /// `thrown` is `None` for exceptions that did not originate from a
    /// WebAssembly `throw` (host exceptions); only `CatchAll` accepts those.
    pub fn matches(self, thrown: Option<TagIndex>) -> bool {
        match self {
            TagFilter::CatchAll => true,
            TagFilter::Tag(tag) => thrown == Some(tag),
        }
    }
}

/// A protected region as reported by a backend, before code is finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlinkedHandlerInfo {
    /// Protected code offsets within the function, `[start, end)`.
    pub range: Range<u32>,
    /// Tag filter of the handler.
    pub filter: TagFilter,
}

impl UnlinkedHandlerInfo {
    /// Create a new unlinked handler.
    ///
    /// # Panics
    ///
    /// Panics if the range is empty.
    pub fn new(range: Range<u32>, filter: TagFilter) -> Self {
        assert!(
            range.start < range.end,
            "handler range must be non-empty: {range:?}"
        );
        Self { range, filter }
    }
}

/// A linked exception handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerInfo {
    /// Protected code offsets within the function, `[start, end)`.
    pub range: Range<u32>,
    /// Absolute address to resume at when the handler catches.
    pub landing_pad: CodePtr,
    /// Tag filter of the handler.
    pub filter: TagFilter,
}

impl HandlerInfo {
    fn width(&self) -> u32 {
        self.range.end - self.range.start
    }
}

/// Immutable, ordered table of linked exception handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerTable {
    handlers: Box<[HandlerInfo]>,
}

impl HandlerTable {
    /// An empty table, for tiers without protected regions.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Link unlinked handlers against their resolved landing pads.
    ///
    /// The i-th handler gets the i-th location; order is preserved.
    ///
    /// # Panics
    ///
    /// Panics if the two lists differ in length. Backends always emit one
    /// location per handler, so a mismatch is a backend bug.
    pub fn link(unlinked: Vec<UnlinkedHandlerInfo>, locations: Vec<CodePtr>) -> Self {
        assert_eq!(
            unlinked.len(),
            locations.len(),
            "every unlinked exception handler needs exactly one landing pad"
        );

        let handlers = unlinked
            .into_iter()
            .zip(locations)
            .map(|(info, landing_pad)| HandlerInfo {
                range: info.range,
                landing_pad,
                filter: info.filter,
            })
            .collect();

        Self { handlers }
    }

    /// Find the handler for an exception thrown at `offset`.
    ///
    /// Among handlers whose range contains `offset` and whose filter
    /// accepts `thrown`, the one with the narrowest range wins; equally
    /// wide ranges resolve to the earlier table entry. `None` means the
    /// exception propagates to the caller's frame.
    pub fn lookup(&self, offset: u32, thrown: Option<TagIndex>) -> Option<&HandlerInfo> {
        self.handlers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.range.contains(&offset) && h.filter.matches(thrown))
            .min_by_key(|(i, h)| (h.width(), *i))
            .map(|(_, h)| h)
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if there are no handlers.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Iterate over handlers in table order.
    pub fn iter(&self) -> std::slice::Iter<'_, HandlerInfo> {
        self.handlers.iter()
    }
}
