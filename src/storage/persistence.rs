//! On-disk persistence for the token tree.
//!
//! The tree image is the compact binary form produced by
//! [`TokenTree::serialize_out`]; a JSON metadata sidecar describes it
//! without requiring a full load. A failed load leaves the caller free to
//! fall back to a full reparse.

use crate::storage::{StorageResult, TreeMetadata};
use crate::tree::TokenTree;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use tracing::info;

const TREE_IMAGE_FILE: &str = "tree.bin";

/// Manages one persisted tree under a base directory.
#[derive(Debug)]
pub struct TreePersistence {
    base_path: PathBuf,
}

impl TreePersistence {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Write the tree image and refresh the metadata sidecar. Does not
    /// touch the tree's modified flag; callers clear it once the save is
    /// known to have succeeded.
    #[must_use = "Save errors should be handled to ensure data is persisted"]
    pub fn save(&self, tree: &TokenTree) -> StorageResult<()> {
        std::fs::create_dir_all(&self.base_path)?;

        let image_path = self.base_path.join(TREE_IMAGE_FILE);
        let mut writer = BufWriter::new(File::create(&image_path)?);
        tree.serialize_out(&mut writer)?;
        writer.flush()?;

        let mut metadata = TreeMetadata::load(&self.base_path).unwrap_or_default();
        metadata.update_counts(tree.real_size() as u32, tree.file_count() as u32);
        metadata.save(&self.base_path)?;

        info!(
            tokens = tree.real_size(),
            files = tree.file_count(),
            path = %image_path.display(),
            "tree image saved"
        );
        Ok(())
    }

    /// Load the tree from disk. Derived data (free lists, name index,
    /// inheritance closures) is rebuilt as part of the load.
    #[must_use = "Load errors should be handled appropriately"]
    pub fn load(&self) -> StorageResult<TokenTree> {
        let image_path = self.base_path.join(TREE_IMAGE_FILE);
        let mut reader = BufReader::new(File::open(&image_path)?);
        let tree = TokenTree::serialize_in(&mut reader)?;

        if let Ok(metadata) = TreeMetadata::load(&self.base_path) {
            info!(
                tokens = tree.real_size(),
                files = tree.file_count(),
                saved_at = metadata.last_modified,
                "tree image loaded"
            );
        }
        Ok(tree)
    }

    /// Check if a persisted image exists.
    pub fn exists(&self) -> bool {
        self.base_path.join(TREE_IMAGE_FILE).exists()
    }

    /// Delete the persisted image and its metadata.
    pub fn clear(&self) -> std::io::Result<()> {
        for name in [TREE_IMAGE_FILE, "tree.meta"] {
            let path = self.base_path.join(name);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Token;
    use crate::types::TokenKind;
    use tempfile::TempDir;

    fn sample_tree() -> TokenTree {
        let mut tree = TokenTree::new();
        let file_idx = tree.file_index("sample.h");
        let mut token = Token::new("Sample", file_idx, 3);
        token.kind = TokenKind::CLASS;
        tree.insert(token);
        tree.flag_file_as_parsed("sample.h");
        tree
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = TreePersistence::new(temp_dir.path().to_path_buf());

        let tree = sample_tree();
        persistence.save(&tree).unwrap();
        assert!(persistence.exists());

        let loaded = persistence.load().unwrap();
        assert_eq!(loaded.real_size(), 1);
        assert!(loaded.is_file_parsed("sample.h"));
        assert!(
            loaded
                .token_exists("Sample", None, TokenKind::CLASS)
                .is_some()
        );
    }

    #[test]
    fn test_exists_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = TreePersistence::new(temp_dir.path().to_path_buf());
        assert!(!persistence.exists());

        persistence.save(&sample_tree()).unwrap();
        assert!(persistence.exists());

        persistence.clear().unwrap();
        assert!(!persistence.exists());
    }

    #[test]
    fn test_load_without_image_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = TreePersistence::new(temp_dir.path().to_path_buf());
        assert!(persistence.load().is_err());
    }
}
