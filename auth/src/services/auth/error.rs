use thiserror::Error;

use crate::repos::error::RepoError;

/// Failure kinds of the refresh-token protocol.
///
/// `NotFound`, `Expired`, `Revoked` and `ReuseDetected` are distinct here so
/// they can be logged; the HTTP boundary collapses them into one response.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("refresh token not found")]
    NotFound,

    #[error("refresh token expired")]
    Expired,

    #[error("refresh token revoked")]
    Revoked,

    #[error("refresh token reuse detected")]
    ReuseDetected,

    #[error("token storage unavailable")]
    StorageUnavailable,

    #[error("internal error")]
    Internal,
}

impl TokenError {
    /// Stable name for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TokenError::InvalidInput(_) => "invalid_input",
            TokenError::NotFound => "not_found",
            TokenError::Expired => "expired",
            TokenError::Revoked => "revoked",
            TokenError::ReuseDetected => "reuse_detected",
            TokenError::StorageUnavailable => "storage_unavailable",
            TokenError::Internal => "internal",
        }
    }

    /// True for the kinds a client must only ever see as a generic auth failure.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            TokenError::NotFound
                | TokenError::Expired
                | TokenError::Revoked
                | TokenError::ReuseDetected
        )
    }
}

impl From<RepoError> for TokenError {
    fn from(e: RepoError) -> Self {
        match e {
            // A rejected record means a bad TTL, i.e. server misconfiguration.
            RepoError::InvalidRecord(_) => TokenError::Internal,
            RepoError::Db(_) | RepoError::Migrate(_) => TokenError::StorageUnavailable,
        }
    }
}

/// Access-token verification failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessTokenError {
    #[error("invalid access token")]
    Invalid,

    #[error("access token expired")]
    Expired,
}
