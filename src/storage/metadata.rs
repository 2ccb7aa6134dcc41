//! Metadata sidecar tracking what a persisted tree image contains.

use crate::storage::{StorageError, StorageResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const METADATA_FILE: &str = "tree.meta";

/// JSON sidecar written next to the binary tree image. Cheap to read
/// without touching the image itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeMetadata {
    /// Version of the metadata schema.
    pub version: u32,

    /// Number of live tokens in the image.
    pub token_count: u32,

    /// Number of files in the image.
    pub file_count: u32,

    /// Last save timestamp, seconds since UNIX_EPOCH.
    pub last_modified: u64,

    /// Optional checksum for validation.
    pub checksum: Option<String>,
}

/// Current UTC timestamp in seconds since UNIX_EPOCH.
pub fn utc_timestamp() -> u64 {
    Utc::now().timestamp() as u64
}

impl TreeMetadata {
    pub fn new() -> Self {
        Self {
            version: 1,
            token_count: 0,
            file_count: 0,
            last_modified: utc_timestamp(),
            checksum: None,
        }
    }

    pub fn update_counts(&mut self, token_count: u32, file_count: u32) {
        self.token_count = token_count;
        self.file_count = file_count;
        self.last_modified = utc_timestamp();
    }

    pub fn save(&self, base_path: &Path) -> StorageResult<()> {
        let metadata_path = base_path.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| StorageError::Metadata(format!("failed to serialize metadata: {e}")))?;
        fs::write(&metadata_path, json)?;
        Ok(())
    }

    pub fn load(base_path: &Path) -> StorageResult<Self> {
        let metadata_path = base_path.join(METADATA_FILE);
        if !metadata_path.exists() {
            return Ok(Self::new());
        }
        let json = fs::read_to_string(&metadata_path)?;
        serde_json::from_str(&json)
            .map_err(|e| StorageError::Metadata(format!("failed to parse metadata: {e}")))
    }
}

impl Default for TreeMetadata {
    fn default() -> Self {
        Self::new()
    }
}
