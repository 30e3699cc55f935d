pub mod error;
pub mod memory;
pub mod refresh_token_repo;
pub mod store;
