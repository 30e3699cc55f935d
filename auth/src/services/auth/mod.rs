pub mod error;
pub mod jwt;
pub mod retry;
pub mod token_codec;
pub mod token_service;

pub use error::{AccessTokenError, TokenError};
pub use token_codec::TokenCodec;
pub use token_service::{IssuedTokenPair, RevocationScope, TokenService, TokenServiceSettings};
