use thiserror::Error;

/// Errors surfaced by queue, job and migration operations.
///
/// Unique-index collisions on insert are *not* represented here: for
/// throttled, debounced and singleton sends a duplicate key is a normal
/// outcome, and the insert path reports it as a `None` job id instead.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied argument was rejected before touching the database.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// The referenced queue, job or migration hop does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The stored schema version did not match the migration's source version.
    #[error("schema version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: i32, found: i32 },

    /// The operation was attempted after the manager was stopped.
    #[error("manager is stopped")]
    Stopped,

    /// An error occurred while executing an SQL query
    #[error("Error occured while query: {0}")]
    Sql(#[from] sqlx::Error),

    /// An error occurred while serializing or deserializing JSON data
    #[error("Error while serializing params: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }
}

/// A Result type alias for queue operations.
pub type Result<T> = core::result::Result<T, Error>;
