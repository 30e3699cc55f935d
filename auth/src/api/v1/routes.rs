use axum::{Router, routing::post};

use crate::api::v1::handlers::token::{refresh_token, revoke_token};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth/refresh-token", post(refresh_token))
        .route("/auth/revoke-token", post(revoke_token))
}
