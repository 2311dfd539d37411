use thiserror::Error;
use toolsync_core::{CoreError, ImportFormatError};
use toolsync_storage::StorageError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Both local tiers failed for the same operation. The only storage
    /// condition that reaches the user.
    #[error("local storage unavailable (structured: {structured}; fallback: {flat})")]
    TiersExhausted {
        structured: StorageError,
        flat: StorageError,
    },

    #[error("import rejected: {0}")]
    ImportFormat(#[from] ImportFormatError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
