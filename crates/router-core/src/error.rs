use thiserror::Error;

/// Errors that can occur in router-core operations
#[derive(Error, Debug)]
pub enum RouterError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] state_store::DbError),

    /// Transport error
    #[error("transport error: {0}")]
    Net(#[from] peer_net::NetError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Password hashing failed
    #[error("password hashing failed: {0}")]
    PasswordHash(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for router-core operations
pub type RouterResult<T> = Result<T, RouterError>;

// Allow conversion from sqlx::Error
impl From<sqlx::Error> for RouterError {
    fn from(err: sqlx::Error) -> Self {
        RouterError::Database(state_store::DbError::from(err))
    }
}
