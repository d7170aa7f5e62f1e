//! Client error types for the command wrappers

use kvguard_common::{ConnectionError, StoreError};

/// Error type for kvguard command operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether the failure came from the connection rather than the command.
    pub fn is_connection(&self) -> bool {
        match self {
            ClientError::Connection(_) => true,
            ClientError::Store(e) => e.is_connection(),
            ClientError::Serialization(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
