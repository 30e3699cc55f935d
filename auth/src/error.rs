use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::services::auth::TokenError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("service unavailable")]
    ServiceUnavailable,

    #[error("internal server error")]
    Internal,
}

#[derive(Serialize)]
struct ErrorResponseBody {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            AppError::ServiceUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE")
            }
            AppError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };

        let body = ErrorResponseBody {
            error: ErrorBody {
                code,
                message: self.to_string(),
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        // The distinct kind stays in the logs; clients get one generic failure
        // so they cannot probe which state a token is in.
        if e.is_auth_failure() {
            warn!(kind = e.kind(), "refresh token rejected");
            return AppError::Unauthorized;
        }

        match e {
            TokenError::InvalidInput(msg) => AppError::InvalidRequest(msg),
            TokenError::StorageUnavailable => {
                error!(kind = e.kind(), "token storage unavailable");
                AppError::ServiceUnavailable
            }
            _ => {
                error!(kind = e.kind(), "token operation failed");
                AppError::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_collapse_to_unauthorized() {
        for e in [
            TokenError::NotFound,
            TokenError::Expired,
            TokenError::Revoked,
            TokenError::ReuseDetected,
        ] {
            assert!(matches!(AppError::from(e), AppError::Unauthorized));
        }
    }

    #[test]
    fn operational_failures_keep_their_class() {
        assert!(matches!(
            AppError::from(TokenError::InvalidInput("x".into())),
            AppError::InvalidRequest(m) if m == "x"
        ));
        assert!(matches!(
            AppError::from(TokenError::StorageUnavailable),
            AppError::ServiceUnavailable
        ));
        assert!(matches!(
            AppError::from(TokenError::Internal),
            AppError::Internal
        ));
    }

    #[test]
    fn status_codes() {
        assert_eq!(
            AppError::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::ServiceUnavailable.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::InvalidRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
