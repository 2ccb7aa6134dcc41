pub mod error;
pub mod metadata;
pub mod persistence;

pub use error::{StorageError, StorageResult};
pub use metadata::TreeMetadata;
pub use persistence::TreePersistence;
