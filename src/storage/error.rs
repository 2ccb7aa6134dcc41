use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("bad magic: expected {expected:?}, found {found:?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },

    #[error("unsupported tree image version {0}")]
    UnsupportedVersion(i32),

    #[error("corrupt stream during {operation}: {cause}")]
    Corrupt { operation: String, cause: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Metadata(String),
}

impl StorageError {
    pub(crate) fn corrupt(operation: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::Corrupt {
            operation: operation.into(),
            cause: cause.into(),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
