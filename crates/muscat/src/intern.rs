//! Interning tables for strings, symbols, and keywords.
//!
//! Interning makes structural equality a `HeapId` comparison within one VM
//! instance. The tables hold their entries weakly with respect to the
//! collector: before every sweep the VM calls [`Interner::scrub_unmarked`]
//! so a table entry alone never keeps its object alive.
//!
//! Allocation of the interned objects themselves happens through the VM
//! (so a collection can trigger with the roots consistent); the interner
//! only owns the lookup maps.

use ahash::AHashMap;

use crate::heap::{Heap, HeapId};

#[derive(Default)]
pub struct Interner {
    strings: AHashMap<Box<str>, HeapId>,
    symbols: AHashMap<Box<str>, HeapId>,
    keywords: AHashMap<Box<str>, HeapId>,
}

impl Interner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn lookup_string(&self, text: &str) -> Option<HeapId> {
        self.strings.get(text).copied()
    }

    pub fn insert_string(&mut self, text: &str, id: HeapId) {
        self.strings.insert(text.into(), id);
    }

    #[must_use]
    pub fn lookup_symbol(&self, name: &str) -> Option<HeapId> {
        self.symbols.get(name).copied()
    }

    pub fn insert_symbol(&mut self, name: &str, id: HeapId) {
        self.symbols.insert(name.into(), id);
    }

    #[must_use]
    pub fn lookup_keyword(&self, name: &str) -> Option<HeapId> {
        self.keywords.get(name).copied()
    }

    pub fn insert_keyword(&mut self, name: &str, id: HeapId) {
        self.keywords.insert(name.into(), id);
    }

    /// Drops every entry whose object did not survive the mark phase.
    /// Must run after tracing and before the sweep frees the slots.
    pub fn scrub_unmarked(&mut self, heap: &Heap) {
        self.strings.retain(|_, id| heap.is_marked(*id));
        self.symbols.retain(|_, id| heap.is_marked(*id));
        self.keywords.retain(|_, id| heap.is_marked(*id));
    }
}
