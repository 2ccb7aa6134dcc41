//! Tests for the file lifecycle: reserve, parse, reparse, remove.

use tokendex::{Token, TokenKind, TokenTree};

fn populate(tree: &mut TokenTree, filename: &str) -> (u32, u32) {
    let file = tree.reserve_file_for_parsing(filename, false).unwrap();

    let mut class = Token::new("Foo", file, 1);
    class.kind = TokenKind::CLASS;
    let class_idx = tree.insert(class);

    let mut method = Token::new("bar", file, 2);
    method.kind = TokenKind::FUNCTION;
    method.parent_idx = Some(class_idx);
    let method_idx = tree.insert(method);

    tree.flag_file_as_parsed(filename);
    (class_idx, method_idx)
}

#[test]
fn test_parse_then_query_then_remove() {
    let mut tree = TokenTree::new();
    let (class_idx, method_idx) = populate(&mut tree, "a.h");

    let found = tree.find_tokens_in_file("a.h", TokenKind::UNDEFINED);
    assert_eq!(
        found.into_iter().collect::<Vec<_>>(),
        vec![class_idx, method_idx]
    );

    tree.remove_file("a.h");
    tree.recalc_free_list();
    assert_eq!(tree.size(), 0);
    assert_eq!(tree.real_size(), 0);
    assert!(!tree.is_file_parsed("a.h"));
    assert!(tree.find_tokens_in_file("a.h", TokenKind::UNDEFINED).is_empty());

    // Both slots are free again; the next inserts reuse them.
    let file = tree.file_index("b.h");
    let mut token = Token::new("Reused", file, 1);
    token.kind = TokenKind::CLASS;
    let idx = tree.insert(token);
    assert!(idx < 2);
}

#[test]
fn test_search_consistency_for_inserted_tokens() {
    let mut tree = TokenTree::new();
    let (class_idx, method_idx) = populate(&mut tree, "a.h");

    // Exact search with a superset kind mask must find the token.
    let exact = tree.find_matches("Foo", true, false, TokenKind::ANY_CONTAINER);
    assert!(exact.contains(&class_idx));

    // Prefix search must find it too.
    let prefix = tree.find_matches("ba", true, true, TokenKind::UNDEFINED);
    assert!(prefix.contains(&method_idx));

    // Case-insensitive exact search.
    let folded = tree.find_matches("foo", false, false, TokenKind::UNDEFINED);
    assert!(folded.contains(&class_idx));

    // After erase, the name index must forget the token.
    tree.erase(method_idx);
    assert!(tree.find_matches("bar", true, false, TokenKind::UNDEFINED).is_empty());
}

#[test]
fn test_update_in_place_instead_of_duplicating() {
    let mut tree = TokenTree::new();
    populate(&mut tree, "a.h");

    // A reparse sees the same declaration again: the lookup that decides
    // "update existing" vs "insert new" must find it.
    let existing = tree.token_exists("Foo", None, TokenKind::ANY_CONTAINER);
    assert!(existing.is_some());
    let idx = existing.unwrap();
    let ticket_before = tree.get(idx).unwrap().ticket();

    // Update in place: the slot and ticket are unchanged.
    tree.get_mut(idx).unwrap().line = 99;
    assert_eq!(tree.get(idx).unwrap().ticket(), ticket_before);
    assert_eq!(tree.real_size(), 2);
}

#[test]
fn test_reparse_cycle_preserves_content_equivalence() {
    let mut tree = TokenTree::new();
    populate(&mut tree, "a.h");

    let snapshot = |tree: &TokenTree| {
        let mut entries: Vec<(String, &'static str)> = tree
            .find_tokens_in_file("a.h", TokenKind::UNDEFINED)
            .into_iter()
            .map(|idx| {
                let token = tree.get(idx).unwrap();
                (token.name.clone(), token.kind.as_str())
            })
            .collect();
        entries.sort();
        entries
    };
    let before = snapshot(&tree);

    // Flag dirty, reclaim (which tears the stale tokens down), re-insert.
    tree.flag_file_for_reparsing("a.h");
    populate(&mut tree, "a.h");

    assert_eq!(snapshot(&tree), before);
    assert!(tree.is_file_parsed("a.h"));
    assert_eq!(tree.real_size(), 2);
}

#[test]
fn test_worker_reservation_is_exclusive() {
    let mut tree = TokenTree::new();

    assert!(tree.reserve_file_for_parsing("a.h", false).is_some());
    // A second worker must not get the same file.
    assert!(tree.reserve_file_for_parsing("a.h", false).is_none());

    tree.flag_file_as_parsed("a.h");
    // Parsed and clean: nothing to do.
    assert!(tree.reserve_file_for_parsing("a.h", false).is_none());

    // Dirty files can be claimed again.
    tree.flag_file_for_reparsing("a.h");
    assert!(tree.reserve_file_for_parsing("a.h", false).is_some());
}

#[test]
fn test_project_membership_change_stamps_tokens() {
    let mut tree = TokenTree::new();
    let (class_idx, method_idx) = populate(&mut tree, "a.h");
    populate(&mut tree, "other.h");

    tree.mark_file_tokens_as_local("a.h", true, 7);

    for idx in [class_idx, method_idx] {
        let token = tree.get(idx).unwrap();
        assert!(token.is_local);
        assert_eq!(token.user_data, 7);
    }
    // The other file keeps its defaults.
    for idx in tree.find_tokens_in_file("other.h", TokenKind::UNDEFINED) {
        let token = tree.get(idx).unwrap();
        assert!(!token.is_local);
        assert_eq!(token.user_data, 0);
    }
}
