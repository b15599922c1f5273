use std::path::PathBuf;
use thiserror::Error;

/// Every failure a single command can produce.
///
/// Each variant is contained to the response of the command that raised it;
/// none of them terminate the scheduler or the connection.
///
/// ## Classes
/// - **Validation**: `UnknownCommand`, `InvalidArgument`
/// - **Not found**: `KeyNotFound`, `TableNotFound`
/// - **Engine**: `Engine` carries the SQLite message verbatim
/// - **I/O**: `Io` for `init`/`load` files and snapshot exports
/// - **Payload**: `Json` when an `init`/`load` document does not parse
/// - **Internal**: an engine task panicked or was cancelled
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("Key not found")]
    KeyNotFound,

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("{0}")]
    Engine(#[from] rusqlite::Error),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io { path: path.into(), source }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        StoreError::InvalidArgument(msg.into())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
