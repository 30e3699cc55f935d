use serde::Deserialize;

/// Body for `/auth/refresh-token` and `/auth/revoke-token`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}
