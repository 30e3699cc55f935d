use std::sync::Arc;

use crate::services::auth::token_service::TokenService;

#[derive(Clone, Debug)]
pub struct AppState {
    pub tokens: Arc<TokenService>,
}

impl AppState {
    pub fn new(tokens: Arc<TokenService>) -> Self {
        Self { tokens }
    }
}
