use std::sync::Arc;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Message bus error: {0}")]
    Transport(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Bulk sync failed: {0}")]
    Sync(String),

    #[error("Unable to dispatch message: {0}")]
    Dispatch(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("No write completion received within {0:?}")]
    Timeout(Duration),

    /// Readiness failure, shared between every caller of the same attempt.
    #[error("Initialization failed: {0}")]
    Init(Arc<Error>),

    #[error("Settings database connection is poisoned")]
    Poisoned,

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unable to serialize: {0}")]
    BincodeSerialization(#[from] bincode::Error),

    #[error("Dump is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
