use serde::Serialize;

use crate::services::auth::IssuedTokenPair;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Usually "Bearer"
    pub token_type: String,
    /// Seconds until the access token expires.
    pub expires_in: u64,
}

impl From<IssuedTokenPair> for TokenResponse {
    fn from(out: IssuedTokenPair) -> Self {
        Self {
            access_token: out.access_token,
            refresh_token: out.refresh_token,
            token_type: out.token_type.to_string(),
            expires_in: out.expires_in,
        }
    }
}
