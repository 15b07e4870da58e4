use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage-layer failures, wrapped with the operation that produced them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool: {0}")]
    Connection(String),
    #[error("migration: {0}")]
    Migration(String),
    #[error("{op}: {source}")]
    Query {
        op: &'static str,
        #[source]
        source: diesel::result::Error,
    },
    #[error("store worker: {0}")]
    Worker(String),
}
