//! Error taxonomy shared by the index, cache and streaming layers.

use http::StatusCode;
use thiserror::Error;

use crate::classify::FileType;

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Derivation(#[from] DerivationError),

    /// Range start lies beyond the end of the resource.
    #[error("range not satisfiable (total {0} bytes)")]
    Range(u64),

    #[error("{0} is a folder")]
    IsFolder(String),

    #[error("invalid tag name: {0:?}")]
    InvalidTag(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Storage(e.to_string())
    }
}

impl CoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound(_))
    }

    /// Status a routing layer should answer with.
    pub fn status(&self) -> StatusCode {
        match self {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Range(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            CoreError::IsFolder(_) | CoreError::InvalidTag(_) => StatusCode::BAD_REQUEST,
            CoreError::Derivation(DerivationError::Unsupported(_)) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            CoreError::Derivation(DerivationError::Source(_)) => StatusCode::NOT_FOUND,
            CoreError::Derivation(DerivationError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Why an artifact could not be produced. `Clone` so a single derivation
/// outcome can be handed to every waiter on the same key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DerivationError {
    #[error("no artifact of this kind for {0} files")]
    Unsupported(FileType),

    #[error("source unreadable: {0}")]
    Source(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encoder(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("derivation task aborted")]
    Cancelled,
}
