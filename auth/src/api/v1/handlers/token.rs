use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;

use crate::api::v1::dto::{refresh_request::RefreshTokenRequest, token_response::TokenResponse};
use crate::api::v1::extractors::JsonBody;
use crate::error::AppError;
use crate::services::auth::TokenError;
use crate::state::AppState;

/// `POST /auth/refresh-token`
///
/// Thin boundary: the request carries only the refresh token; axum drops this
/// future on client disconnect or request timeout, which is how cancellation
/// reaches the service.
pub async fn refresh_token(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<RefreshTokenRequest>,
) -> Result<(StatusCode, Json<TokenResponse>), AppError> {
    let out = state.tokens.refresh(&req.refresh_token).await?;
    Ok((StatusCode::OK, Json(out.into())))
}

/// `POST /auth/revoke-token`
///
/// Unknown tokens are answered like revoked ones (RFC 7009 §2.2).
pub async fn revoke_token(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<RefreshTokenRequest>,
) -> Result<StatusCode, AppError> {
    match state.tokens.revoke(&req.refresh_token).await {
        Ok(()) | Err(TokenError::NotFound) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(e.into()),
    }
}
