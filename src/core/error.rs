use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("No shard found for key: {0}")]
    NoShardFound(String),

    #[error("Shard {0} not found")]
    ShardNotFound(u32),

    #[error("Replica '{0}' not found")]
    ReplicaNotFound(String),

    #[error("Invalid shard key: {0}")]
    InvalidKey(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Connection pool '{0}' is closed")]
    PoolClosed(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Background worker error: {0}")]
    Worker(String),
}

impl DbError {
    /// True for failures that say nothing about the statement itself:
    /// refused or dropped connections, timeouts and closed pools.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Connectivity(_) | Self::Timeout(_) | Self::PoolClosed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for DbError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(err.to_string())
    }
}
