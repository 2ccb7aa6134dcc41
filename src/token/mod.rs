//! The token entity: one declared or referenced symbol.
//!
//! A token is a plain relational record. All relationships are held as
//! arena indices rather than references, because tokens can be erased and
//! their slots recycled without invalidating the rest of the tree; the
//! ticket distinguishes a recycled slot from the token that used to live
//! in it.

pub mod serialize;

use crate::tree::TokenTree;
use crate::types::{FileIdx, FileIdxSet, TokenIdx, TokenIdxSet, TokenKind, TokenScope};
use std::collections::BTreeMap;

/// One parsed declaration or definition record.
///
/// Created by a parser with a name, origin file and line, then handed to
/// [`TokenTree::insert`], which assigns the arena slot and the ticket and
/// maintains every secondary index.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub name: String,
    /// Declared type as written, e.g. `const String&`.
    pub full_type: String,
    /// Resolved type, e.g. `String`.
    pub base_type: String,
    pub args: String,
    /// `args` with default-value clauses removed; used for signature
    /// matching where defaults must not affect identity.
    pub base_args: String,
    /// Comma-joined base names for display; resolved into
    /// `direct_ancestors` by [`TokenTree::recalc_data`].
    pub ancestors_string: String,

    pub template_argument: String,
    pub template_type: Vec<String>,
    pub template_map: BTreeMap<String, String>,
    /// Alias for templates, e.g. `template T1 T2;`.
    pub template_alias: String,
    /// Namespace aliases pointing at this token.
    pub aliases: Vec<String>,

    pub file_idx: FileIdx,
    pub line: u32,
    pub impl_file_idx: FileIdx,
    pub impl_line: u32,
    /// Opening brace line of the implementation body, when known.
    pub impl_line_start: u32,
    /// Closing brace line of the implementation body, when known.
    pub impl_line_end: u32,

    pub kind: TokenKind,
    pub scope: TokenScope,
    pub is_operator: bool,
    /// Declared in a file belonging to the working set.
    pub is_local: bool,
    /// Local (temporary) variable.
    pub is_temp: bool,
    /// Const member method.
    pub is_const: bool,

    pub parent_idx: Option<TokenIdx>,
    /// Direct members. Kept bidirectionally consistent with `parent_idx`
    /// by the tree, not by the token (see [`Token::add_child`]).
    pub children: TokenIdxSet,
    /// Explicit base list, one level.
    pub direct_ancestors: TokenIdxSet,
    /// Transitive closure of `direct_ancestors`; derived cache, only
    /// rewritten by the tree's recompute operations.
    pub ancestors: TokenIdxSet,
    /// Inverse transitive closure; derived cache like `ancestors`.
    pub descendants: TokenIdxSet,

    /// Opaque caller-owned handle; never interpreted by the store.
    pub user_data: u64,

    pub(crate) self_idx: Option<TokenIdx>,
    pub(crate) ticket: u64,
}

impl Token {
    pub fn new(name: impl Into<String>, file_idx: FileIdx, line: u32) -> Self {
        Self {
            name: name.into(),
            full_type: String::new(),
            base_type: String::new(),
            args: String::new(),
            base_args: String::new(),
            ancestors_string: String::new(),
            template_argument: String::new(),
            template_type: Vec::new(),
            template_map: BTreeMap::new(),
            template_alias: String::new(),
            aliases: Vec::new(),
            file_idx,
            line,
            impl_file_idx: 0,
            impl_line: 0,
            impl_line_start: 0,
            impl_line_end: 0,
            kind: TokenKind::UNDEFINED,
            scope: TokenScope::Undefined,
            is_operator: false,
            is_local: false,
            is_temp: false,
            is_const: false,
            parent_idx: None,
            children: TokenIdxSet::new(),
            direct_ancestors: TokenIdxSet::new(),
            ancestors: TokenIdxSet::new(),
            descendants: TokenIdxSet::new(),
            user_data: 0,
            self_idx: None,
            ticket: 0,
        }
    }

    /// Arena index, once the tree has placed this token.
    pub fn self_idx(&self) -> Option<TokenIdx> {
        self.self_idx
    }

    /// Monotonic version stamp assigned at insertion. Never reused, even
    /// when the arena slot is recycled, so a cached `(idx, ticket)` pair
    /// detects whether the slot still holds the same logical token.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Add a direct member.
    ///
    /// Returns false when `child_idx` is this token's own index or is
    /// already present. Deliberately does NOT touch the child's
    /// `parent_idx`: the tree sets both sides of the relation together,
    /// and keeping the token one-sided avoids cyclic update ordering.
    pub fn add_child(&mut self, child_idx: TokenIdx) -> bool {
        if self.self_idx == Some(child_idx) {
            return false;
        }
        self.children.insert(child_idx)
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Membership test against the cached ancestor closure. A set lookup,
    /// not a graph walk; stale until the tree recomputes the chain.
    pub fn inherits_from(&self, idx: TokenIdx) -> bool {
        self.ancestors.contains(&idx)
    }

    /// Reconstruct the scoped path of the enclosing containers, e.g.
    /// `Outer::Inner::` for a member of `Inner`. Empty for roots.
    pub fn namespace(&self, tree: &TokenTree) -> String {
        let mut path = String::new();
        let mut seen = TokenIdxSet::new();
        let mut current = self.parent_idx;
        while let Some(idx) = current {
            if !seen.insert(idx) {
                break; // corrupt parent chain, stop walking
            }
            match tree.get(idx) {
                Some(parent) => {
                    path = format!("{}::{path}", parent.name);
                    current = parent.parent_idx;
                }
                None => break,
            }
        }
        path
    }

    /// Name of the direct parent container, or empty for roots.
    pub fn parent_name(&self, tree: &TokenTree) -> String {
        self.parent_idx
            .and_then(|idx| tree.get(idx))
            .map(|parent| parent.name.clone())
            .unwrap_or_default()
    }

    /// Human-readable one-line rendering of the declaration.
    pub fn display_name(&self, tree: &TokenTree) -> String {
        if self.kind.contains(TokenKind::UNDEFINED) {
            return self.name.clone();
        }
        if self.kind.intersects(TokenKind::CLASS | TokenKind::NAMESPACE | TokenKind::ENUM) {
            return format!("{} {} {{...}}", self.kind.as_str(), self.name);
        }
        if self.kind.contains(TokenKind::TYPEDEF) {
            return format!("typedef {} {}", self.full_type, self.name).trim().to_string();
        }
        if self.kind.intersects(TokenKind::PREPROCESSOR | TokenKind::MACRO) {
            return format!("#define {}{}", self.name, self.formatted_args());
        }
        let mut out = String::new();
        if !self.full_type.is_empty() {
            out.push_str(&self.full_type);
            out.push(' ');
        }
        out.push_str(&self.namespace(tree));
        out.push_str(&self.name);
        out.push_str(&self.formatted_args());
        out
    }

    pub fn kind_str(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn scope_str(&self) -> &'static str {
        self.scope.as_str()
    }

    /// Declaring filename, or empty when the token has no origin file.
    pub fn filename(&self, tree: &TokenTree) -> String {
        tree.filename(self.file_idx).unwrap_or_default()
    }

    /// Implementation filename, or empty when declaration-only.
    pub fn impl_filename(&self, tree: &TokenTree) -> String {
        if self.impl_file_idx == 0 {
            return String::new();
        }
        tree.filename(self.impl_file_idx).unwrap_or_default()
    }

    /// Argument list with embedded newlines removed.
    pub fn formatted_args(&self) -> String {
        self.args.replace('\n', "")
    }

    /// Argument list with default-value clauses removed, recomputing from
    /// `args` when the cached `base_args` is empty.
    pub fn stripped_args(&self) -> String {
        if !self.base_args.is_empty() {
            return self.base_args.clone();
        }
        Self::strip_default_args(&self.args)
    }

    /// Drop ` = value` clauses from an argument list, so that overload
    /// signatures compare equal regardless of defaults.
    pub fn strip_default_args(args: &str) -> String {
        let mut out = String::with_capacity(args.len());
        let mut skipping = false;
        for ch in args.chars() {
            match ch {
                '=' if !skipping => {
                    skipping = true;
                    while out.ends_with(' ') {
                        out.pop();
                    }
                }
                ',' | ')' if skipping => {
                    skipping = false;
                    out.push(ch);
                }
                _ if skipping => {}
                '\n' => {}
                _ => out.push(ch),
            }
        }
        out
    }

    /// True iff the declaration file or the implementation file is in the
    /// given working set.
    pub fn matches_files(&self, files: &FileIdxSet) -> bool {
        files.contains(&self.file_idx)
            || (self.impl_file_idx != 0 && files.contains(&self.impl_file_idx))
    }

    /// Whether a declared base name can possibly resolve to a token.
    /// Builtin value types never name an ancestor.
    pub fn is_valid_ancestor(name: &str) -> bool {
        !matches!(
            name,
            "" | "bool"
                | "char"
                | "char16_t"
                | "char32_t"
                | "double"
                | "float"
                | "int"
                | "long"
                | "short"
                | "signed"
                | "size_t"
                | "unsigned"
                | "void"
                | "wchar_t"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_child_rejects_self_and_duplicates() {
        let mut token = Token::new("Widget", 1, 10);
        token.self_idx = Some(3);

        assert!(!token.add_child(3), "own index must be rejected");
        assert!(token.add_child(5));
        assert!(!token.add_child(5), "duplicate must be rejected");
        assert!(token.has_children());
    }

    #[test]
    fn test_add_child_does_not_set_parent() {
        // The child's parent pointer is the tree's job; the token only
        // records the forward edge.
        let mut parent = Token::new("Outer", 1, 1);
        parent.self_idx = Some(0);
        assert!(parent.add_child(1));
        assert_eq!(parent.parent_idx, None);
    }

    #[test]
    fn test_strip_default_args() {
        assert_eq!(
            Token::strip_default_args("(int a = 5, bool verbose = true)"),
            "(int a, bool verbose)"
        );
        assert_eq!(Token::strip_default_args("(int a, int b)"), "(int a, int b)");
        assert_eq!(Token::strip_default_args("()"), "()");
        assert_eq!(Token::strip_default_args("(int x = 7)"), "(int x)");
    }

    #[test]
    fn test_formatted_args_strips_newlines() {
        let mut token = Token::new("run", 1, 1);
        token.args = "(int a,\n int b)".to_string();
        assert_eq!(token.formatted_args(), "(int a, int b)");
    }

    #[test]
    fn test_matches_files() {
        let mut token = Token::new("run", 2, 1);
        token.impl_file_idx = 7;

        let mut set = FileIdxSet::new();
        set.insert(2);
        assert!(token.matches_files(&set));

        let mut impl_set = FileIdxSet::new();
        impl_set.insert(7);
        assert!(token.matches_files(&impl_set));

        let mut other = FileIdxSet::new();
        other.insert(9);
        assert!(!token.matches_files(&other));
    }

    #[test]
    fn test_is_valid_ancestor() {
        assert!(Token::is_valid_ancestor("Widget"));
        assert!(!Token::is_valid_ancestor(""));
        assert!(!Token::is_valid_ancestor("int"));
        assert!(!Token::is_valid_ancestor("unsigned"));
    }

    #[test]
    fn test_inherits_from_uses_cached_closure() {
        let mut token = Token::new("Derived", 1, 1);
        token.ancestors.insert(4);
        assert!(token.inherits_from(4));
        assert!(!token.inherits_from(5));
    }
}
