//! Stack maps for call sites and OSR points.
//!
//! An optimizing backend records, for every call site and loop header it
//! instruments, where each live WebAssembly value sits. The tier-up path
//! uses these to rebuild interpreter state or to fill the OSR scratch
//! buffer.

use std::collections::HashMap;

use crate::entrypoint::Reg;

/// Index of an instrumented call site or OSR point within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSiteIndex(pub u32);

/// Where a live value resides at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLocation {
    /// In a machine register.
    Register(Reg),
    /// In a stack slot at this offset from the frame pointer.
    Stack(i32),
}

/// Live-value locations at one call site, in WebAssembly local/stack order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackMap {
    values: Box<[ValueLocation]>,
}

impl StackMap {
    /// Create a stack map from value locations.
    pub fn new(values: Vec<ValueLocation>) -> Self {
        Self {
            values: values.into_boxed_slice(),
        }
    }

    /// Value locations in order.
    pub fn values(&self) -> &[ValueLocation] {
        &self.values
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if nothing is live.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Stack maps of one callee, keyed by call-site index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackMaps {
    maps: HashMap<CallSiteIndex, StackMap>,
}

impl StackMaps {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the map for `index`, replacing any earlier one.
    pub fn insert(&mut self, index: CallSiteIndex, map: StackMap) {
        self.maps.insert(index, map);
    }

    /// Get the map recorded for `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` was never instrumented.
    pub fn get(&self, index: CallSiteIndex) -> &StackMap {
        match self.maps.get(&index) {
            Some(map) => map,
            None => panic!("no stack map recorded for call site {}", index.0),
        }
    }

    /// Get the map recorded for `index`, if any.
    pub fn try_get(&self, index: CallSiteIndex) -> Option<&StackMap> {
        self.maps.get(&index)
    }

    /// Number of instrumented call sites.
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// Returns `true` if no call site was instrumented.
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

impl FromIterator<(CallSiteIndex, StackMap)> for StackMaps {
    fn from_iter<I: IntoIterator<Item = (CallSiteIndex, StackMap)>>(iter: I) -> Self {
        Self {
            maps: iter.into_iter().collect(),
        }
    }
}
