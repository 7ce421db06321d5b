//! Storage error types.
//!
//! Every error variant carries enough context to diagnose the problem
//! without a debugger. The variants separate "could not open the database"
//! (a deployment problem) from "a query failed" (a bug or a disk problem)
//! because operators react to them differently.

/// Errors that can occur at the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to open the database file at the given path.
    #[error("failed to open database at '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },

    /// Schema bootstrap (CREATE TABLE / CREATE INDEX) failed.
    #[error("schema bootstrap failed: {0}")]
    Schema(#[source] sqlx::Error),

    /// A query against the store failed.
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
}
