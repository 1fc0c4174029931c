use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    /// Bad arguments: missing folder, missing query, `k` out of range.
    #[error("invalid input: {0}")]
    Input(String),

    /// The snapshot exists but cannot be decoded.
    #[error("vector store {} is corrupt: {reason}", path.display())]
    StoreCorrupt { path: PathBuf, reason: String },

    /// A single embedding call failed. Recoverable per file.
    #[error("embedding provider failed: {0}")]
    Provider(String),

    /// A durable write failed; in-memory state is still valid.
    #[error("failed to flush vector store to {}: {source}", path.display())]
    Flush {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("configuration error: {0}")]
    Config(String),
}
