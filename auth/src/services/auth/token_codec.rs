use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, error};
use uuid::Uuid;

use crate::services::auth::error::{AccessTokenError, TokenError};
use crate::services::auth::jwt::{JwtIssuer, JwtVerifier};

/// Entropy of an opaque refresh value, in bytes.
const REFRESH_VALUE_BYTES: usize = 32;

/// Access token (JWT) claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub aud: String,
    /// User id (UUID string, project convention).
    pub sub: String,
    /// Token family the access token was minted from.
    pub sid: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

impl AccessTokenClaims {
    pub fn user_id(&self) -> Result<Uuid, AccessTokenError> {
        Uuid::parse_str(&self.sub).map_err(|_| AccessTokenError::Invalid)
    }
}

/// Opaque refresh value as handed to the client, plus what gets persisted.
///
/// `Debug` hides the plaintext.
#[derive(Clone)]
pub struct OpaqueRefreshValue {
    pub plaintext: String,
    pub reference: Vec<u8>,
}

impl std::fmt::Debug for OpaqueRefreshValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpaqueRefreshValue")
            .field("reference", &hex::encode(&self.reference))
            .finish_non_exhaustive()
    }
}

/// Stateless codec for access tokens (signed JWT) and refresh values (opaque).
#[derive(Clone, Debug)]
pub struct TokenCodec {
    issuer: JwtIssuer,
    verifier: JwtVerifier,
}

impl TokenCodec {
    pub fn new(issuer: JwtIssuer, verifier: JwtVerifier) -> Self {
        Self { issuer, verifier }
    }

    /// Build both halves from PEM key material.
    pub fn from_pem(
        private_key_pem: &str,
        public_key_pem: &str,
        issuer: &str,
        audience: &str,
    ) -> Result<Self, TokenError> {
        let jwt_issuer = JwtIssuer::new(private_key_pem, issuer.to_string(), audience.to_string())?;
        let verifier = JwtVerifier::new(public_key_pem, issuer, audience)?;
        Ok(Self::new(jwt_issuer, verifier))
    }

    /// Issue an access token for `user_id`, valid for `ttl_seconds` from `now`.
    pub fn issue_access_token(
        &self,
        user_id: Uuid,
        family_id: Uuid,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let ttl = i64::try_from(ttl_seconds)
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| {
                error!(ttl_seconds, "access token ttl out of range");
                TokenError::Internal
            })?;

        let iat = now.timestamp();
        let claims = AccessTokenClaims {
            iss: self.issuer.issuer().to_string(),
            aud: self.issuer.audience().to_string(),
            sub: user_id.to_string(),
            sid: family_id.to_string(),
            iat,
            exp: iat + ttl,
            jti: Uuid::new_v4().to_string(),
        };

        self.issuer.sign(&claims)
    }

    /// Verify signature, issuer and audience, then check expiry against `now`.
    ///
    /// Expiry is inclusive: `exp == now` is expired.
    pub fn verify_access_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessTokenClaims, AccessTokenError> {
        let claims = self
            .verifier
            .decode::<AccessTokenClaims>(token)
            .map_err(|e| {
                debug!(error = %e, "access token rejected");
                AccessTokenError::Invalid
            })?;

        if claims.sub.trim().is_empty() || claims.user_id().is_err() {
            return Err(AccessTokenError::Invalid);
        }
        if claims.exp <= now.timestamp() {
            return Err(AccessTokenError::Expired);
        }

        Ok(claims)
    }

    /// Mint a fresh opaque refresh value.
    ///
    /// The plaintext goes to the client; only `reference` is persisted.
    pub fn issue_refresh_opaque_value(&self) -> Result<OpaqueRefreshValue, TokenError> {
        let mut bytes = [0u8; REFRESH_VALUE_BYTES];
        getrandom::fill(&mut bytes).map_err(|e| {
            error!(error = %e, "os rng unavailable");
            TokenError::Internal
        })?;

        let plaintext = URL_SAFE_NO_PAD.encode(bytes);
        let reference = refresh_reference(&plaintext);

        Ok(OpaqueRefreshValue {
            plaintext,
            reference,
        })
    }

    /// Constant-time check that `plaintext` hashes to `stored_reference`.
    pub fn match_refresh_value(&self, plaintext: &str, stored_reference: &[u8]) -> bool {
        refresh_reference(plaintext).ct_eq(stored_reference).into()
    }
}

/// sha256(token) -> raw 32 bytes (stored as BYTEA).
pub fn refresh_reference(plaintext: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hasher.finalize().to_vec()
}


#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    use super::test_keys::*;
    use super::*;

    #[test]
    fn access_token_round_trip() {
        let codec = codec();
        let now = Utc::now();
        let user_id = Uuid::new_v4();
        let family_id = Uuid::new_v4();

        let token = codec.issue_access_token(user_id, family_id, 600, now).unwrap();
        let claims = codec.verify_access_token(&token, now).unwrap();

        assert_eq!(claims.user_id().unwrap(), user_id);
        assert_eq!(claims.sid, family_id.to_string());
        assert_eq!(claims.iss, ISSUER);
        assert_eq!(claims.aud, AUDIENCE);
        assert_eq!(claims.iat, now.timestamp());
        assert_eq!(claims.exp, now.timestamp() + 600);
    }

    #[test]
    fn access_token_expiry_is_inclusive() {
        let codec = codec();
        let now = Utc::now();
        let token = codec
            .issue_access_token(Uuid::new_v4(), Uuid::new_v4(), 60, now)
            .unwrap();

        let just_before = now + ChronoDuration::seconds(59);
        let at_expiry = now + ChronoDuration::seconds(60);

        assert!(codec.verify_access_token(&token, just_before).is_ok());
        assert_eq!(
            codec.verify_access_token(&token, at_expiry),
            Err(AccessTokenError::Expired)
        );
    }

    #[test]
    fn access_token_from_other_key_is_invalid() {
        let codec = codec();
        let other = TokenCodec::from_pem(PRIVATE_KEY_PEM, OTHER_PUBLIC_KEY_PEM, ISSUER, AUDIENCE)
            .unwrap();
        let now = Utc::now();
        let token = codec
            .issue_access_token(Uuid::new_v4(), Uuid::new_v4(), 60, now)
            .unwrap();

        assert_eq!(
            other.verify_access_token(&token, now),
            Err(AccessTokenError::Invalid)
        );
    }

    #[test]
    fn access_token_for_other_audience_is_invalid() {
        let codec = codec();
        let other_aud =
            TokenCodec::from_pem(PRIVATE_KEY_PEM, PUBLIC_KEY_PEM, ISSUER, "other.api").unwrap();
        let now = Utc::now();
        let token = other_aud
            .issue_access_token(Uuid::new_v4(), Uuid::new_v4(), 60, now)
            .unwrap();

        assert_eq!(
            codec.verify_access_token(&token, now),
            Err(AccessTokenError::Invalid)
        );
    }

    #[test]
    fn garbage_is_invalid() {
        let codec = codec();
        assert_eq!(
            codec.verify_access_token("not.a.jwt", Utc::now()),
            Err(AccessTokenError::Invalid)
        );
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let res = codec().issue_access_token(Uuid::new_v4(), Uuid::new_v4(), 0, Utc::now());
        assert!(matches!(res, Err(TokenError::Internal)));
    }

    #[test]
    fn invalid_pem_is_rejected() {
        let res = TokenCodec::from_pem("nope", PUBLIC_KEY_PEM, ISSUER, AUDIENCE);
        assert!(matches!(res, Err(TokenError::Internal)));
    }

    #[test]
    fn refresh_values_are_unique_and_match_their_reference() {
        let codec = codec();
        let a = codec.issue_refresh_opaque_value().unwrap();
        let b = codec.issue_refresh_opaque_value().unwrap();

        assert_ne!(a.plaintext, b.plaintext);
        assert_eq!(a.plaintext.len(), 43); // base64url(32 bytes), no padding
        assert_eq!(a.reference.len(), 32);
        assert!(codec.match_refresh_value(&a.plaintext, &a.reference));
        assert!(!codec.match_refresh_value(&a.plaintext, &b.reference));
        assert!(!format!("{a:?}").contains(&a.plaintext));
    }

    proptest! {
        #[test]
        fn reference_only_matches_its_own_plaintext(a in "[A-Za-z0-9_-]{1,64}", b in "[A-Za-z0-9_-]{1,64}") {
            let codec = codec();
            let reference = refresh_reference(&a);
            prop_assert!(codec.match_refresh_value(&a, &reference));
            prop_assert_eq!(codec.match_refresh_value(&b, &reference), a == b);
        }

        #[test]
        fn truncated_reference_never_matches(a in "[A-Za-z0-9_-]{1,64}", cut in 0usize..32) {
            let codec = codec();
            let reference = refresh_reference(&a);
            prop_assert!(!codec.match_refresh_value(&a, &reference[..cut]));
        }
    }
}
