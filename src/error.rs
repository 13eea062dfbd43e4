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

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("no text found in {0}")]
    NoTextFound(String),

    #[error("chunking produced no chunks for {0}")]
    ChunkingProducedNothing(String),

    #[error("embedding provider unavailable")]
    EmbeddingUnavailable,

    #[error("context window exceeded")]
    ContextWindowExceeded,

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("cancelled")]
    Cancelled { partial: String },

    #[error("completion service error: {0}")]
    Completion(String),

    #[error("memory content is empty")]
    EmptyMemory,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}
