//! Name lookup seam between the tree and whatever search index backs it.
//!
//! The tree only needs three capabilities from a search backend: insert a
//! key mapped to a token index, remove one mapping, and query by exact or
//! prefix match. [`MemoryNameIndex`] is the in-process default; a heavier
//! engine can be swapped in behind the same trait.

use crate::types::{TokenIdx, TokenIdxSet};
use std::collections::BTreeMap;

/// Exact lookup ("go to definition") vs prefix lookup (incremental
/// code-completion typing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Exact,
    Prefix,
}

/// The search capability consumed by the tree.
pub trait NameIndex {
    fn insert(&mut self, key: &str, idx: TokenIdx);

    /// Remove one `key -> idx` mapping. Unknown keys are a no-op.
    fn remove(&mut self, key: &str, idx: TokenIdx);

    fn find(&self, key: &str, mode: MatchMode, case_sensitive: bool) -> TokenIdxSet;

    fn clear(&mut self);
}

/// Ordered-map name index.
///
/// Prefix queries are range scans over the ordered keys; case-insensitive
/// queries go through a second map keyed by the lowercased name, kept in
/// lockstep with the primary.
#[derive(Debug, Default)]
pub struct MemoryNameIndex {
    exact: BTreeMap<String, TokenIdxSet>,
    folded: BTreeMap<String, TokenIdxSet>,
}

impl MemoryNameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    fn scan_prefix(map: &BTreeMap<String, TokenIdxSet>, prefix: &str) -> TokenIdxSet {
        let mut result = TokenIdxSet::new();
        for (_, posting) in map
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
        {
            result.extend(posting);
        }
        result
    }
}

impl NameIndex for MemoryNameIndex {
    fn insert(&mut self, key: &str, idx: TokenIdx) {
        self.exact.entry(key.to_string()).or_default().insert(idx);
        self.folded
            .entry(key.to_lowercase())
            .or_default()
            .insert(idx);
    }

    fn remove(&mut self, key: &str, idx: TokenIdx) {
        if let Some(posting) = self.exact.get_mut(key) {
            posting.remove(&idx);
            if posting.is_empty() {
                self.exact.remove(key);
            }
        }
        let folded_key = key.to_lowercase();
        if let Some(posting) = self.folded.get_mut(&folded_key) {
            posting.remove(&idx);
            if posting.is_empty() {
                self.folded.remove(&folded_key);
            }
        }
    }

    fn find(&self, key: &str, mode: MatchMode, case_sensitive: bool) -> TokenIdxSet {
        match (mode, case_sensitive) {
            (MatchMode::Exact, true) => self.exact.get(key).cloned().unwrap_or_default(),
            (MatchMode::Exact, false) => self
                .folded
                .get(&key.to_lowercase())
                .cloned()
                .unwrap_or_default(),
            (MatchMode::Prefix, true) => Self::scan_prefix(&self.exact, key),
            (MatchMode::Prefix, false) => Self::scan_prefix(&self.folded, &key.to_lowercase()),
        }
    }

    fn clear(&mut self) {
        self.exact.clear();
        self.folded.clear();
    }
}
