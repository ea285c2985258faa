//! Panel error types.

use std::path::PathBuf;

/// Panel error.
#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    /// No persisted record exists for the UID.
    #[error("user does not exist in db")]
    UserNotFound,

    /// A record for the UID already exists.
    #[error("user already exists in db")]
    UserExists,

    /// The UID has no live entry in the active-user cache.
    #[error("user is not active")]
    UserNotActive,

    /// A backup file with the generated name already exists; the
    /// delete that requested it is aborted.
    #[error("backup file already exists: {0}")]
    BackupCollision(PathBuf),

    /// Storage or transaction failure from the embedded store.
    #[error("store: {0}")]
    Store(#[from] sled::Error),

    /// Filesystem failure while writing or reading a backup.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A stored field had the wrong width. Impossible in a clean store;
    /// kept distinguishable so it can be told apart in logs.
    #[error("field {field}: expected {expected} bytes, got {actual}")]
    Decode {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl From<sled::transaction::TransactionError<PanelError>> for PanelError {
    fn from(err: sled::transaction::TransactionError<PanelError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => PanelError::Store(e),
        }
    }
}
