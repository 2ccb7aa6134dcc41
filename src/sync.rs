//! Advisory locking for the shared tree.
//!
//! The tree is a single shared mutable structure with no internal
//! synchronization; every compound operation (reserve a file, then insert
//! its tokens) must happen under one continuously-held guard so that no
//! reader observes a half-updated tree. This wrapper is that process-wide
//! lock. Reads go through the same lock; there is no snapshot isolation.

use crate::tree::TokenTree;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Shared handle to a [`TokenTree`] guarded by a process-wide mutex.
///
/// Cloning is cheap and every clone refers to the same tree.
///
/// ```
/// use tokendex::{SharedTokenTree, Token, TokenKind};
///
/// let shared = SharedTokenTree::default();
/// {
///     // One guard across the whole compound operation.
///     let mut tree = shared.lock();
///     let file = tree.reserve_file_for_parsing("a.h", false).unwrap();
///     let mut token = Token::new("Foo", file, 1);
///     token.kind = TokenKind::CLASS;
///     tree.insert(token);
///     tree.flag_file_as_parsed("a.h");
/// }
/// assert!(shared.lock().is_file_parsed("a.h"));
/// ```
#[derive(Clone, Default)]
pub struct SharedTokenTree {
    inner: Arc<Mutex<TokenTree>>,
}

impl SharedTokenTree {
    pub fn new(tree: TokenTree) -> Self {
        Self {
            inner: Arc::new(Mutex::new(tree)),
        }
    }

    /// Acquire the tree, blocking until it is free. Hold the guard for the
    /// full duration of a multi-step mutation.
    pub fn lock(&self) -> MutexGuard<'_, TokenTree> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Token;
    use crate::types::TokenKind;

    #[test]
    fn test_clones_share_one_tree() {
        let shared = SharedTokenTree::default();
        let other = shared.clone();

        {
            let mut tree = shared.lock();
            let file = tree.file_index("a.h");
            let mut token = Token::new("Foo", file, 1);
            token.kind = TokenKind::CLASS;
            tree.insert(token);
        }
        assert_eq!(other.lock().real_size(), 1);
    }

    #[test]
    fn test_concurrent_inserts_never_share_a_slot() {
        let shared = SharedTokenTree::default();
        let mut handles = Vec::new();
        for worker in 0..4 {
            let shared = shared.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let mut tree = shared.lock();
                    let file = tree.file_index(&format!("w{worker}.h"));
                    let mut token = Token::new(format!("sym_{worker}_{i}"), file, i);
                    token.kind = TokenKind::VARIABLE;
                    tree.insert(token);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let tree = shared.lock();
        assert_eq!(tree.real_size(), 200);
        // Tickets are unique across the whole run.
        let mut tickets: Vec<u64> = (0..tree.size() as u32)
            .filter_map(|idx| tree.get(idx).map(|t| t.ticket()))
            .collect();
        tickets.sort_unstable();
        tickets.dedup();
        assert_eq!(tickets.len(), 200);
    }
}
