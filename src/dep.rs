//! Generator read/write footprints.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// The four-set footprint of a generator: what it reads and what it
/// writes, at table and column granularity.
///
/// Invariant: table names never contain a dot; column names always do
/// (`entity.attr`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dep {
    pub tables_needed: BTreeSet<String>,
    pub columns_needed: BTreeSet<String>,
    pub tables_yielded: BTreeSet<String>,
    pub columns_yielded: BTreeSet<String>,
}

impl Dep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn need_table(&mut self, table: &str) {
        debug_assert!(!table.contains('.'));
        self.tables_needed.insert(table.into());
    }

    pub fn need_column(&mut self, entity: &str, column: &str) {
        self.columns_needed.insert(format!("{}.{}", entity, column));
    }

    pub fn yield_table(&mut self, table: &str) {
        debug_assert!(!table.contains('.'));
        self.tables_yielded.insert(table.into());
    }

    pub fn yield_column(&mut self, entity: &str, column: &str) {
        self.columns_yielded.insert(format!("{}.{}", entity, column));
    }

    /// True iff this footprint's needs intersect the other's yields.
    ///
    /// Defines a directed scheduling edge `other -> self`: the other
    /// generator must run first. Not symmetric.
    pub fn test(&self, other: &Dep) -> bool {
        !self.tables_needed.is_disjoint(&other.tables_yielded)
            || !self.columns_needed.is_disjoint(&other.columns_yielded)
    }

    /// Union a list of footprints.
    pub fn merge<'a>(deps: impl IntoIterator<Item = &'a Dep>) -> Dep {
        let mut out = Dep::new();
        for dep in deps {
            out.tables_needed.extend(dep.tables_needed.iter().cloned());
            out.columns_needed
                .extend(dep.columns_needed.iter().cloned());
            out.tables_yielded
                .extend(dep.tables_yielded.iter().cloned());
            out.columns_yielded
                .extend(dep.columns_yielded.iter().cloned());
        }
        out
    }
}
