//! The token tree: aggregate root owning the token arena and every
//! secondary index.
//!
//! Tokens live in an index-addressed arena with tombstone slots recycled
//! through a free list, so erasing a token never invalidates the indices
//! other tokens hold. The tree keeps the name index, the file table and
//! the parent/child and inheritance relations consistent on every
//! mutation; the ancestor/descendant closures are derived caches rewritten
//! only by the explicit recompute operations.

pub mod files;

use crate::search::{MatchMode, MemoryNameIndex, NameIndex};
use crate::storage::{StorageError, StorageResult};
use crate::token::Token;
use crate::token::serialize::{read_i32_le, read_str, write_i32_le, write_str};
use crate::types::{FileIdx, FileParseStatus, TokenIdx, TokenIdxSet, TokenKind};
use files::FileTable;
use std::collections::VecDeque;
use std::io::{Read, Seek, Write};
use tracing::{debug, trace, warn};

/// Magic bytes opening a serialized tree image.
const TREE_MAGIC: [u8; 4] = *b"TKDX";
/// Current image format version. Older or newer images are rejected;
/// cross-version persistence is out of scope.
const TREE_FORMAT_VERSION: i32 = 1;

/// The in-memory symbol database.
///
/// One tree is created per indexed project and cleared on project close or
/// full rebuild. The tree itself is synchronous and single-writer; see
/// [`crate::SharedTokenTree`] for the advisory locking wrapper.
#[derive(Debug, Default)]
pub struct TokenTree {
    /// Slot-addressed token storage; erased slots become tombstones.
    tokens: Vec<Option<Token>>,
    /// Recyclable tombstone slots, handed out front-first.
    free: VecDeque<TokenIdx>,
    name_index: MemoryNameIndex,
    files: FileTable,
    /// Top-level namespaces (parentless namespace tokens).
    top_namespaces: TokenIdxSet,
    /// All parentless tokens, i.e. members of the implicit global scope.
    global_namespace: TokenIdxSet,
    ticket_counter: u64,
    unnamed_struct_count: u32,
    unnamed_enum_count: u32,
    modified: bool,
}

impl TokenTree {
    pub fn new() -> Self {
        Self {
            files: FileTable::new(),
            ..Self::default()
        }
    }

    /// Drop every token, file and index, keeping the tree usable.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    // ---- arena surface ----------------------------------------------------

    /// Slot count, tombstones included.
    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    /// Live token count.
    pub fn real_size(&self) -> usize {
        self.tokens.len().saturating_sub(self.free.len())
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, idx: TokenIdx) -> Option<&Token> {
        self.tokens.get(idx as usize).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, idx: TokenIdx) -> Option<&mut Token> {
        self.tokens
            .get_mut(idx as usize)
            .and_then(|slot| slot.as_mut())
    }

    /// Place a token into a recycled slot, or grow the arena. Returns the
    /// assigned index; the token receives a fresh ticket either way.
    pub fn insert(&mut self, token: Token) -> TokenIdx {
        let slot = match self.free.pop_front() {
            Some(idx) => idx,
            None => {
                self.tokens.push(None);
                (self.tokens.len() - 1) as TokenIdx
            }
        };
        self.place(slot, token)
    }

    /// Place a token into a specific slot, growing the arena with
    /// tombstones as needed. Refuses (returns None) when the slot is
    /// occupied. Growth does not maintain the free list; bulk loaders call
    /// [`TokenTree::recalc_free_list`] when done.
    pub fn insert_at(&mut self, idx: TokenIdx, token: Token) -> Option<TokenIdx> {
        while self.tokens.len() <= idx as usize {
            self.tokens.push(None);
        }
        if self.tokens[idx as usize].is_some() {
            return None;
        }
        self.free.retain(|&free_idx| free_idx != idx);
        Some(self.place(idx, token))
    }

    /// Shared tail of the insert paths: ticket assignment and secondary
    /// index maintenance.
    fn place(&mut self, idx: TokenIdx, mut token: Token) -> TokenIdx {
        if token.name.is_empty() {
            token.name = self.synthesize_unnamed(token.kind);
        }
        if token.base_args.is_empty() && !token.args.is_empty() {
            token.base_args = Token::strip_default_args(&token.args);
        }

        token.self_idx = Some(idx);
        self.ticket_counter += 1;
        token.ticket = self.ticket_counter;

        self.name_index.insert(&token.name, idx);
        for alias in &token.aliases {
            self.name_index.insert(alias, idx);
        }

        self.files.add_member(token.file_idx, idx);
        if token.impl_file_idx != 0 {
            self.files.add_member(token.impl_file_idx, idx);
        }

        // The tree sets both sides of the parent relation together; a
        // dangling parent reference is dropped rather than stored.
        if let Some(parent_idx) = token.parent_idx {
            match self.get_mut(parent_idx) {
                Some(parent) => {
                    parent.add_child(idx);
                }
                None => {
                    warn!(token = %token.name, parent_idx, "dropping dangling parent reference");
                    token.parent_idx = None;
                }
            }
        }
        if token.parent_idx.is_none() {
            self.global_namespace.insert(idx);
            if token.kind.contains(TokenKind::NAMESPACE) && !token.kind.contains(TokenKind::UNDEFINED)
            {
                self.top_namespaces.insert(idx);
            }
        }

        trace!(idx, ticket = token.ticket, name = %token.name, "token placed");
        self.tokens[idx as usize] = Some(token);
        self.modified = true;
        idx
    }

    /// Unlink a token from every index and recycle its slot.
    ///
    /// Children are NOT erased: they are detached to the root instead.
    /// Container removal goes through [`TokenTree::erase_children`] first,
    /// as the file removal path does.
    pub fn erase(&mut self, idx: TokenIdx) -> bool {
        let Some(slot) = self.tokens.get_mut(idx as usize) else {
            return false;
        };
        let Some(token) = slot.take() else {
            return false;
        };

        // Parent side of the containment relation.
        if let Some(parent_idx) = token.parent_idx {
            match self.get_mut(parent_idx) {
                Some(parent) => {
                    parent.children.remove(&idx);
                }
                None => warn!(idx, parent_idx, "erase: parent slot already gone"),
            }
        }

        // Children are orphaned, not destroyed.
        for &child_idx in &token.children {
            if let Some(child) = self.get_mut(child_idx) {
                if child.parent_idx == Some(idx) {
                    child.parent_idx = None;
                    self.global_namespace.insert(child_idx);
                }
            }
        }
        // Re-run root bookkeeping for orphans that are namespaces.
        for &child_idx in &token.children {
            if let Some(child) = self.get(child_idx) {
                if child.parent_idx.is_none()
                    && child.kind.contains(TokenKind::NAMESPACE)
                    && !child.kind.contains(TokenKind::UNDEFINED)
                {
                    self.top_namespaces.insert(child_idx);
                }
            }
        }

        // Inheritance bookkeeping: this index disappears from both closure
        // directions.
        for &anc_idx in token.ancestors.union(&token.direct_ancestors) {
            if let Some(ancestor) = self.get_mut(anc_idx) {
                ancestor.descendants.remove(&idx);
            }
        }
        for &desc_idx in &token.descendants {
            if let Some(descendant) = self.get_mut(desc_idx) {
                descendant.ancestors.remove(&idx);
                descendant.direct_ancestors.remove(&idx);
            }
        }

        self.name_index.remove(&token.name, idx);
        for alias in &token.aliases {
            self.name_index.remove(alias, idx);
        }

        self.files.remove_member(token.file_idx, idx);
        if token.impl_file_idx != 0 {
            self.files.remove_member(token.impl_file_idx, idx);
        }

        self.global_namespace.remove(&idx);
        self.top_namespaces.remove(&idx);

        self.free.push_back(idx);
        self.modified = true;
        debug!(idx, name = %token.name, "token erased");
        true
    }

    /// Erase every child of a container, depth first. Used when a
    /// namespace or class is removed wholesale.
    pub fn erase_children(&mut self, idx: TokenIdx) -> bool {
        let Some(children) = self.get(idx).map(|token| token.children.clone()) else {
            return false;
        };
        for child_idx in children {
            self.erase_children(child_idx);
            self.erase(child_idx);
        }
        true
    }

    /// Rebuild the free list by scanning for tombstones. Needed after bulk
    /// loads that used [`TokenTree::insert_at`]. Trailing tombstones are
    /// trimmed off the arena entirely, so a fully-emptied tree reports
    /// `size() == 0` again.
    pub fn recalc_free_list(&mut self) {
        while matches!(self.tokens.last(), Some(None)) {
            self.tokens.pop();
        }
        self.free.clear();
        for idx in (0..self.tokens.len()).rev() {
            if self.tokens[idx].is_none() {
                self.free.push_back(idx as TokenIdx);
            }
        }
    }

    // ---- lookup & matching ------------------------------------------------

    /// Exact-name lookup scoped to a parent (None = root), filtered by
    /// kind mask. First match in index order, or None.
    pub fn token_exists(
        &self,
        name: &str,
        parent: Option<TokenIdx>,
        kind_mask: TokenKind,
    ) -> Option<TokenIdx> {
        self.name_index
            .find(name, MatchMode::Exact, true)
            .into_iter()
            .find(|&idx| {
                self.get(idx)
                    .is_some_and(|token| token.parent_idx == parent && token.kind.intersects(kind_mask))
            })
    }

    /// Overload-aware lookup: name, parent and kind as in
    /// [`TokenTree::token_exists`], disambiguated by the stripped argument
    /// signature so default values do not affect identity.
    pub fn token_exists_with_args(
        &self,
        name: &str,
        base_args: &str,
        parent: Option<TokenIdx>,
        kind: TokenKind,
    ) -> Option<TokenIdx> {
        self.name_index
            .find(name, MatchMode::Exact, true)
            .into_iter()
            .find(|&idx| {
                self.get(idx).is_some_and(|token| {
                    token.parent_idx == parent
                        && token.kind.intersects(kind)
                        && token.base_args == base_args
                })
            })
    }

    /// Name query through the search seam, filtered by kind mask. Exact
    /// mode serves "go to definition"; prefix mode serves completion.
    pub fn find_matches(
        &self,
        query: &str,
        case_sensitive: bool,
        is_prefix: bool,
        kind_mask: TokenKind,
    ) -> TokenIdxSet {
        let mode = if is_prefix {
            MatchMode::Prefix
        } else {
            MatchMode::Exact
        };
        self.name_index
            .find(query, mode, case_sensitive)
            .into_iter()
            .filter(|&idx| {
                self.get(idx)
                    .is_some_and(|token| token.kind.intersects(kind_mask))
            })
            .collect()
    }

    /// All tokens declared or implemented in a file, filtered by kind.
    pub fn find_tokens_in_file(&self, filename: &str, kind_mask: TokenKind) -> TokenIdxSet {
        let Some(file_idx) = self.files.get(filename) else {
            return TokenIdxSet::new();
        };
        let Some(members) = self.files.members(file_idx) else {
            return TokenIdxSet::new();
        };
        members
            .iter()
            .copied()
            .filter(|&idx| {
                self.get(idx)
                    .is_some_and(|token| token.kind.intersects(kind_mask))
            })
            .collect()
    }

    // ---- inheritance ------------------------------------------------------

    /// Rebuild every derived structure: ancestor/descendant closures for
    /// all tokens and the root namespace sets. The expensive
    /// full-consistency pass, run after a reload or bulk reparse.
    pub fn recalc_data(&mut self) {
        self.resolve_declared_ancestors();

        // Closures: reset, then memoized depth-first computation.
        for slot in self.tokens.iter_mut().flatten() {
            slot.ancestors.clear();
            slot.descendants.clear();
        }
        let len = self.tokens.len();
        let mut state = vec![ClosureState::Untouched; len];
        for idx in 0..len {
            if self.tokens[idx].is_some() {
                self.closure_of(idx as TokenIdx, &mut state);
            }
        }
        for idx in 0..len {
            let Some(ancestors) = self.tokens[idx].as_ref().map(|t| t.ancestors.clone()) else {
                continue;
            };
            for anc_idx in ancestors {
                if let Some(ancestor) = self.get_mut(anc_idx) {
                    ancestor.descendants.insert(idx as TokenIdx);
                }
            }
        }

        // Root sets.
        self.top_namespaces.clear();
        self.global_namespace.clear();
        for idx in 0..len {
            let Some(token) = self.tokens[idx].as_ref() else {
                continue;
            };
            if token.parent_idx.is_none() {
                self.global_namespace.insert(idx as TokenIdx);
                if token.kind.contains(TokenKind::NAMESPACE)
                    && !token.kind.contains(TokenKind::UNDEFINED)
                {
                    self.top_namespaces.insert(idx as TokenIdx);
                }
            }
        }
        debug!(tokens = self.real_size(), "derived data recalculated");
    }

    /// Resolve `ancestors_string` names into direct ancestor links for
    /// classes and typedefs. Existing live links are kept; the declared
    /// names add to them.
    fn resolve_declared_ancestors(&mut self) {
        let len = self.tokens.len();
        for idx in 0..len {
            let Some((kind, declared)) = self.tokens[idx]
                .as_ref()
                .map(|t| (t.kind, t.ancestors_string.clone()))
            else {
                continue;
            };
            if !kind.intersects(TokenKind::CLASS | TokenKind::TYPEDEF)
                || kind.contains(TokenKind::UNDEFINED)
                || declared.is_empty()
            {
                continue;
            }
            let mut resolved = TokenIdxSet::new();
            for name in declared.split(',') {
                let name = name.trim();
                if !Token::is_valid_ancestor(name) {
                    continue;
                }
                for candidate in self.name_index.find(name, MatchMode::Exact, true) {
                    if candidate == idx as TokenIdx {
                        continue;
                    }
                    let is_type = self.get(candidate).is_some_and(|anc| {
                        !anc.kind.contains(TokenKind::UNDEFINED)
                            && anc.kind.intersects(TokenKind::ANY_CONTAINER | TokenKind::ENUM)
                    });
                    if is_type {
                        resolved.insert(candidate);
                    }
                }
            }
            if let Some(token) = self.tokens[idx].as_mut() {
                token.direct_ancestors.retain(|&a| a != idx as TokenIdx);
                token.direct_ancestors.extend(resolved);
            }
        }
    }

    fn closure_of(&mut self, idx: TokenIdx, state: &mut [ClosureState]) -> TokenIdxSet {
        match state[idx as usize] {
            ClosureState::Done => {
                return self
                    .get(idx)
                    .map(|t| t.ancestors.clone())
                    .unwrap_or_default();
            }
            // Inheritance cycle: cut it here instead of recursing forever.
            ClosureState::InProgress => return TokenIdxSet::new(),
            ClosureState::Untouched => {}
        }
        state[idx as usize] = ClosureState::InProgress;

        let direct = self
            .get(idx)
            .map(|t| t.direct_ancestors.clone())
            .unwrap_or_default();
        let mut result = TokenIdxSet::new();
        for anc_idx in direct {
            if self.get(anc_idx).is_none() {
                continue;
            }
            result.insert(anc_idx);
            result.extend(self.closure_of(anc_idx, state));
        }
        result.remove(&idx);

        if let Some(token) = self.get_mut(idx) {
            token.ancestors = result.clone();
        }
        state[idx as usize] = ClosureState::Done;
        result
    }

    /// Recompute one token's ancestor closure from its direct ancestors,
    /// reusing the ancestors' cached closures instead of re-walking the
    /// whole graph, and propagate the result both ways. The incremental
    /// alternative to [`TokenTree::recalc_data`] while a file is being
    /// parsed.
    pub fn recalc_inheritance_chain(&mut self, idx: TokenIdx) {
        if self.get(idx).is_none() {
            return;
        }
        let mut result = TokenIdxSet::new();
        let mut visited = TokenIdxSet::new();
        visited.insert(idx);
        self.collect_ancestors(idx, &mut result, &mut visited);
        result.remove(&idx);

        let descendants = match self.get_mut(idx) {
            Some(token) => {
                token.ancestors = result.clone();
                token.descendants.clone()
            }
            None => return,
        };

        // Both closure directions stay in lockstep: every ancestor sees
        // this token and its subtree, every descendant sees the new
        // ancestors.
        for &anc_idx in &result {
            if let Some(ancestor) = self.get_mut(anc_idx) {
                ancestor.descendants.insert(idx);
                ancestor.descendants.extend(descendants.iter().copied());
                ancestor.descendants.remove(&anc_idx);
            }
        }
        for &desc_idx in &descendants {
            if let Some(descendant) = self.get_mut(desc_idx) {
                descendant.ancestors.extend(result.iter().copied());
                descendant.ancestors.remove(&desc_idx);
            }
        }
        self.modified = true;
    }

    fn collect_ancestors(&self, idx: TokenIdx, result: &mut TokenIdxSet, visited: &mut TokenIdxSet) {
        let Some(token) = self.get(idx) else {
            return;
        };
        for &anc_idx in &token.direct_ancestors {
            if !visited.insert(anc_idx) {
                continue;
            }
            let Some(ancestor) = self.get(anc_idx) else {
                continue;
            };
            result.insert(anc_idx);
            if ancestor.ancestors.is_empty() {
                self.collect_ancestors(anc_idx, result, visited);
            } else {
                // Memoized sub-result: the ancestor's own cached closure.
                result.extend(ancestor.ancestors.iter().copied());
            }
        }
    }

    // ---- files & parse status ---------------------------------------------

    /// Find or create the id for a filename.
    pub fn file_index(&mut self, filename: &str) -> FileIdx {
        self.files.intern(filename)
    }

    pub fn filename(&self, idx: FileIdx) -> Option<String> {
        self.files.name(idx).map(str::to_string)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Claim a file for a parser worker so no two workers parse it
    /// concurrently.
    ///
    /// A `preliminary` caller only wants a placeholder reservation: the
    /// file is marked `Assigned` and the call refuses if any reservation
    /// already exists. A full reservation moves the file to `BeingParsed`
    /// and refuses once parsing has started or finished. A file flagged
    /// for reparse whose previous parse completed is torn down first.
    pub fn reserve_file_for_parsing(
        &mut self,
        filename: &str,
        preliminary: bool,
    ) -> Option<FileIdx> {
        let mut idx = self.files.intern(filename);
        if self.files.needs_reparse(idx) && self.files.status(idx) == FileParseStatus::Done {
            self.remove_file_idx(idx);
            idx = self.files.intern(filename);
        }
        let status = self.files.status(idx);
        if preliminary {
            if status >= FileParseStatus::Assigned {
                return None;
            }
        } else if status > FileParseStatus::Assigned {
            return None;
        }
        self.files.clear_reparse(idx);
        self.files.set_status(
            idx,
            if preliminary {
                FileParseStatus::Assigned
            } else {
                FileParseStatus::BeingParsed
            },
        );
        debug!(file = filename, idx, preliminary, "file reserved for parsing");
        Some(idx)
    }

    /// Flag a file dirty without discarding its tokens yet; stale tokens
    /// go away when the reparse tears the file down.
    pub fn flag_file_for_reparsing(&mut self, filename: &str) {
        if let Some(idx) = self.files.get(filename) {
            self.files.flag_reparse(idx);
            self.modified = true;
        }
    }

    pub fn flag_file_as_parsed(&mut self, filename: &str) {
        let idx = self.files.intern(filename);
        self.files.set_status(idx, FileParseStatus::Done);
        self.files.clear_reparse(idx);
        self.modified = true;
    }

    pub fn is_file_parsed(&self, filename: &str) -> bool {
        self.files
            .get(filename)
            .is_some_and(|idx| self.files.is_parsed(idx))
    }

    pub fn file_needs_reparse(&self, filename: &str) -> bool {
        self.files
            .get(filename)
            .is_some_and(|idx| self.files.needs_reparse(idx))
    }

    /// Erase every token owned by a file and drop the file from all
    /// tables. Unknown files are a no-op.
    pub fn remove_file(&mut self, filename: &str) {
        if let Some(idx) = self.files.get(filename) {
            self.remove_file_idx(idx);
        }
    }

    /// See [`TokenTree::remove_file`]. Tokens shared with another file
    /// (declaration here, implementation elsewhere or vice versa) survive
    /// with this file's references cleared.
    pub fn remove_file_idx(&mut self, file: FileIdx) {
        if file == 0 {
            return;
        }
        let members = self.files.take_members(file);
        for idx in members {
            let Some(token) = self.get(idx) else {
                continue;
            };
            let decl_owned = token.file_idx == 0 || token.file_idx == file;
            let impl_owned = token.impl_file_idx == 0 || token.impl_file_idx == file;
            if decl_owned && impl_owned && self.check_child_remove(idx, file) {
                self.erase_children(idx);
                self.erase(idx);
            } else if let Some(token) = self.get_mut(idx) {
                if token.file_idx == file {
                    token.file_idx = 0;
                    token.line = 0;
                }
                if token.impl_file_idx == file {
                    token.impl_file_idx = 0;
                    token.impl_line = 0;
                    token.impl_line_start = 0;
                    token.impl_line_end = 0;
                }
            }
        }
        self.files.release(file);
        self.modified = true;
        debug!(file, "file removed from tree");
    }

    /// A container may only be torn down with its file when every child
    /// (transitively) belongs to that file too. Tolerates missing children
    /// instead of crashing on an inconsistent relation.
    fn check_child_remove(&self, idx: TokenIdx, file: FileIdx) -> bool {
        let Some(token) = self.get(idx) else {
            return true;
        };
        for &child_idx in &token.children {
            let Some(child) = self.get(child_idx) else {
                warn!(idx, child_idx, "missing child while checking removal");
                continue;
            };
            if (child.file_idx != 0 && child.file_idx != file)
                || (child.impl_file_idx != 0 && child.impl_file_idx != file)
            {
                return false;
            }
            if !self.check_child_remove(child_idx, file) {
                return false;
            }
        }
        true
    }

    /// Bulk-flag every token of a file as local/non-local and stamp the
    /// caller's opaque handle. Used when a file changes project membership
    /// without a reparse.
    pub fn mark_file_tokens_as_local(&mut self, filename: &str, local: bool, user_data: u64) {
        if let Some(idx) = self.files.get(filename) {
            self.mark_file_tokens_as_local_idx(idx, local, user_data);
        }
    }

    pub fn mark_file_tokens_as_local_idx(&mut self, file: FileIdx, local: bool, user_data: u64) {
        let Some(members) = self.files.members(file).cloned() else {
            return;
        };
        for idx in members {
            if let Some(token) = self.get_mut(idx) {
                token.is_local = local;
                token.user_data = user_data;
            }
        }
        self.modified = true;
    }

    // ---- misc accessors ---------------------------------------------------

    pub fn top_namespaces(&self) -> &TokenIdxSet {
        &self.top_namespaces
    }

    pub fn global_namespace(&self) -> &TokenIdxSet {
        &self.global_namespace
    }

    /// Whether the tree changed since the last save (or `set_modified`).
    pub fn modified(&self) -> bool {
        self.modified
    }

    pub fn set_modified(&mut self, modified: bool) {
        self.modified = modified;
    }

    fn synthesize_unnamed(&mut self, kind: TokenKind) -> String {
        if kind.contains(TokenKind::ENUM) && !kind.contains(TokenKind::UNDEFINED) {
            self.unnamed_enum_count += 1;
            format!("UnnamedEnum{}", self.unnamed_enum_count)
        } else {
            self.unnamed_struct_count += 1;
            format!("UnnamedStruct{}", self.unnamed_struct_count)
        }
    }

    // ---- serialization ----------------------------------------------------

    /// Write the whole tree image: arena (tombstones as markers), file
    /// table, statuses, reparse set and counters.
    pub fn serialize_out<W: Write>(&self, w: &mut W) -> StorageResult<()> {
        w.write_all(&TREE_MAGIC)?;
        write_i32_le(w, TREE_FORMAT_VERSION)?;

        write_i32_le(w, self.tokens.len() as i32)?;
        for slot in &self.tokens {
            match slot {
                Some(token) => {
                    write_i32_le(w, 1)?;
                    token.serialize_out(w)?;
                }
                None => write_i32_le(w, 0)?,
            }
        }

        write_i32_le(w, self.files.len() as i32)?;
        for (idx, name) in self.files.iter_live() {
            write_i32_le(w, idx as i32)?;
            write_str(w, name)?;
            write_i32_le(w, self.files.status(idx) as i32)?;
        }

        let reparse = self.files.reparse_set();
        write_i32_le(w, reparse.len() as i32)?;
        for idx in reparse {
            write_i32_le(w, *idx as i32)?;
        }

        write_i32_le(w, (self.ticket_counter & 0xFFFF_FFFF) as i32)?;
        write_i32_le(w, (self.ticket_counter >> 32) as i32)?;
        write_i32_le(w, self.unnamed_struct_count as i32)?;
        write_i32_le(w, self.unnamed_enum_count as i32)?;
        Ok(())
    }

    /// Read a tree image written by [`TokenTree::serialize_out`]. Any
    /// short read fails the whole load; the caller should discard the
    /// partial tree and fall back to a full reparse.
    pub fn serialize_in<R: Read + Seek>(r: &mut R) -> StorageResult<TokenTree> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                StorageError::UnexpectedEof
            } else {
                StorageError::Io(e)
            }
        })?;
        if magic != TREE_MAGIC {
            return Err(StorageError::BadMagic {
                expected: TREE_MAGIC,
                found: magic,
            });
        }
        let version = read_i32_le(r)?;
        if version != TREE_FORMAT_VERSION {
            return Err(StorageError::UnsupportedVersion(version));
        }

        let mut tree = TokenTree::new();
        let slot_count = read_i32_le(r)?;
        if slot_count < 0 {
            return Err(StorageError::corrupt(
                "tree image",
                format!("negative slot count {slot_count}"),
            ));
        }
        for idx in 0..slot_count {
            let marker = read_i32_le(r)?;
            if marker == 0 {
                tree.tokens.push(None);
                continue;
            }
            let mut token = Token::serialize_in(r)?;
            token.self_idx = Some(idx as TokenIdx);
            tree.ticket_counter += 1;
            token.ticket = tree.ticket_counter;
            tree.tokens.push(Some(token));
        }

        let file_count = read_i32_le(r)?;
        if file_count < 0 {
            return Err(StorageError::corrupt(
                "tree image",
                format!("negative file count {file_count}"),
            ));
        }
        for _ in 0..file_count {
            let idx = read_i32_le(r)?;
            let name = read_str(r)?;
            let status = FileParseStatus::from_wire(read_i32_le(r)?);
            if idx <= 0 || name.is_empty() {
                warn!(idx, "skipping unusable file table entry");
                continue;
            }
            tree.files.restore_slot(idx as FileIdx, &name, status);
        }
        tree.files.recalc_free();

        let reparse_count = read_i32_le(r)?;
        for _ in 0..reparse_count.max(0) {
            let idx = read_i32_le(r)?;
            if idx > 0 {
                tree.files.flag_reparse(idx as FileIdx);
            }
        }

        let ticket_lo = read_i32_le(r)? as u32 as u64;
        let ticket_hi = read_i32_le(r)? as u32 as u64;
        tree.ticket_counter = tree.ticket_counter.max((ticket_hi << 32) | ticket_lo);
        tree.unnamed_struct_count = read_i32_le(r)?.max(0) as u32;
        tree.unnamed_enum_count = read_i32_le(r)?.max(0) as u32;

        tree.rebuild_after_load();
        tree.modified = false;
        Ok(tree)
    }

    /// Post-load pass: drop references to dead slots, rebuild the name
    /// index, file memberships, free lists and derived data.
    fn rebuild_after_load(&mut self) {
        let len = self.tokens.len();
        let live: Vec<bool> = self.tokens.iter().map(|slot| slot.is_some()).collect();
        let alive = |idx: TokenIdx| (idx as usize) < len && live[idx as usize];

        for idx in 0..len {
            let Some(token) = self.tokens[idx].as_mut() else {
                continue;
            };
            if let Some(parent_idx) = token.parent_idx {
                if !alive(parent_idx) {
                    warn!(idx, parent_idx, "dropping dead parent reference on load");
                    token.parent_idx = None;
                }
            }
            token.children.retain(|&c| alive(c) && c as usize != idx);
            token.direct_ancestors.retain(|&a| alive(a) && a as usize != idx);

            let token_idx = idx as TokenIdx;
            self.name_index.insert(&token.name, token_idx);
            for alias in &token.aliases {
                self.name_index.insert(alias, token_idx);
            }
        }

        // Parent/child links must agree both ways after a load.
        for idx in 0..len {
            let Some(parent_idx) = self.tokens[idx].as_ref().and_then(|t| t.parent_idx) else {
                continue;
            };
            let child_idx = idx as TokenIdx;
            if let Some(parent) = self.get_mut(parent_idx) {
                parent.children.insert(child_idx);
            }
        }

        for idx in 0..len {
            let Some((file_idx, impl_file_idx)) = self.tokens[idx]
                .as_ref()
                .map(|t| (t.file_idx, t.impl_file_idx))
            else {
                continue;
            };
            self.files.add_member(file_idx, idx as TokenIdx);
            if impl_file_idx != 0 {
                self.files.add_member(impl_file_idx, idx as TokenIdx);
            }
        }

        self.recalc_free_list();
        self.recalc_data();
    }
}

#[derive(Clone, Copy, PartialEq)]
enum ClosureState {
    Untouched,
    InProgress,
    Done,
}
