use axum::{
    Json,
    extract::{FromRequest, Request, rejection::JsonRejection},
};
use serde::de::DeserializeOwned;

use crate::error::AppError;

/// `Json<T>` whose rejection is a 400 `AppError` instead of axum's plain-text
/// 415/422.
#[derive(Debug)]
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(reject)?;
        Ok(Self(value))
    }
}

// serde's message can echo request content; keep it in the logs only.
fn reject(rejection: JsonRejection) -> AppError {
    tracing::debug!(
        status = %rejection.status(),
        reason = %rejection.body_text(),
        "rejected request body"
    );
    AppError::InvalidRequest("malformed request body".to_string())
}
