use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::repos::store::{NewRefreshToken, RecordState, RefreshTokenStore, RotateOutcome};
use crate::services::auth::error::{AccessTokenError, TokenError};
use crate::services::auth::retry::StorePolicy;
use crate::services::auth::token_codec::{AccessTokenClaims, TokenCodec, refresh_reference};

/// Upper bound on a presented refresh token. Issued values are 43 chars.
const MAX_PRESENTED_TOKEN_LEN: usize = 512;

/// What an explicit `revoke` invalidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevocationScope {
    /// Only the presented record.
    Token,
    /// Every record descended from the same original issuance.
    #[default]
    Family,
}

#[derive(Debug, Clone)]
pub struct TokenServiceSettings {
    pub access_token_ttl_seconds: u64,
    pub refresh_token_ttl_seconds: u64,
    pub revocation_scope: RevocationScope,
    pub store_policy: StorePolicy,
}

/// Service that orchestrates the refresh-token exchange.
///
/// - TokenCodec signs/verifies access tokens and mints opaque refresh values.
/// - RefreshTokenStore persists records; its `mark_rotated` is the only
///   serialization point between concurrent refreshes of the same token.
#[derive(Clone)]
pub struct TokenService {
    codec: TokenCodec,
    store: Arc<dyn RefreshTokenStore>,
    settings: TokenServiceSettings,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("store", &self.store.backend_name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl TokenService {
    pub fn new(
        codec: TokenCodec,
        store: Arc<dyn RefreshTokenStore>,
        settings: TokenServiceSettings,
    ) -> Self {
        Self {
            codec,
            store,
            settings,
        }
    }

    /// Start a new token family for an already authenticated user.
    ///
    /// Called by the login flow; the refresh protocol itself never creates families.
    pub async fn start_family(&self, user_id: Uuid) -> Result<IssuedTokenPair, TokenError> {
        self.start_family_at(user_id, Utc::now()).await
    }

    pub async fn start_family_at(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<IssuedTokenPair, TokenError> {
        let family_id = Uuid::new_v4();
        let value = self.codec.issue_refresh_opaque_value()?;
        let access_token = self.codec.issue_access_token(
            user_id,
            family_id,
            self.settings.access_token_ttl_seconds,
            now,
        )?;

        let root = NewRefreshToken::new(
            user_id,
            family_id,
            value.reference.clone(),
            now,
            self.settings.refresh_token_ttl_seconds,
        )?;

        let record = self
            .settings
            .store_policy
            .once("create", self.store.create(root))
            .await?;

        info!(
            user_id = %user_id,
            family_id = %family_id,
            token_id = %record.id,
            expires_at = %record.expires_at,
            "Started refresh token family"
        );

        Ok(IssuedTokenPair {
            access_token,
            refresh_token: value.plaintext,
            token_type: "Bearer",
            expires_in: self.settings.access_token_ttl_seconds,
            family_id,
        })
    }

    /// Exchange a refresh token for a new access token and a new refresh token.
    pub async fn refresh(&self, presented: &str) -> Result<IssuedTokenPair, TokenError> {
        self.refresh_at(presented, Utc::now()).await
    }

    /// Exchange a refresh token, evaluating expiry against `now`.
    ///
    /// - validate the presented token (known + unexpired + not revoked)
    /// - a token that was already rotated is reuse: revoke the family and fail
    /// - otherwise compare-and-set the rotation and hand out the successor
    pub async fn refresh_at(
        &self,
        presented: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedTokenPair, TokenError> {
        let presented = validate_presented(presented)?;
        let reference = refresh_reference(presented);
        let token_ref = short_ref(&reference);

        let record = self
            .settings
            .store_policy
            .idempotent("find_by_reference", || {
                self.store.find_by_reference(&reference)
            })
            .await?
            .filter(|r| self.codec.match_refresh_value(presented, &r.token_hash))
            .ok_or_else(|| {
                debug!(token_ref = %token_ref, "Refresh token not found");
                TokenError::NotFound
            })?;

        if record.is_revoked() {
            debug!(token_id = %record.id, family_id = %record.family_id, "Refresh token revoked");
            return Err(TokenError::Revoked);
        }
        if record.is_expired(now) {
            debug!(token_id = %record.id, expires_at = %record.expires_at, "Refresh token expired");
            return Err(TokenError::Expired);
        }
        if record.state() == RecordState::Rotated {
            return Err(self
                .reuse_detected(record.id, record.family_id, record.user_id, now)
                .await);
        }

        // Everything that can fail without touching the store happens first,
        // so a signing failure never burns the presented token.
        let value = self.codec.issue_refresh_opaque_value()?;
        let access_token = self.codec.issue_access_token(
            record.user_id,
            record.family_id,
            self.settings.access_token_ttl_seconds,
            now,
        )?;
        let successor = NewRefreshToken::new(
            record.user_id,
            record.family_id,
            value.reference.clone(),
            now,
            self.settings.refresh_token_ttl_seconds,
        )?;

        match self.commit_rotation(record.id, successor, now).await? {
            RotateOutcome::Rotated(next) => {
                info!(
                    user_id = %record.user_id,
                    family_id = %record.family_id,
                    token_id = %record.id,
                    successor_id = %next.id,
                    "Rotated refresh token"
                );
                Ok(IssuedTokenPair {
                    access_token,
                    refresh_token: value.plaintext,
                    token_type: "Bearer",
                    expires_in: self.settings.access_token_ttl_seconds,
                    family_id: record.family_id,
                })
            }
            // Lost the race against a concurrent presentation of the same token.
            RotateOutcome::AlreadyRotated => Err(self
                .reuse_detected(record.id, record.family_id, record.user_id, now)
                .await),
            RotateOutcome::Revoked => Err(TokenError::Revoked),
            RotateOutcome::Expired => Err(TokenError::Expired),
            RotateOutcome::NotFound => Err(TokenError::NotFound),
        }
    }

    /// Revoke a refresh token (and, by policy, its family).
    ///
    /// Idempotent: an already revoked token is accepted silently.
    pub async fn revoke(&self, presented: &str) -> Result<(), TokenError> {
        self.revoke_at(presented, Utc::now()).await
    }

    pub async fn revoke_at(&self, presented: &str, now: DateTime<Utc>) -> Result<(), TokenError> {
        let presented = validate_presented(presented)?;
        let reference = refresh_reference(presented);
        let policy = &self.settings.store_policy;

        let record = policy
            .idempotent("find_by_reference", || {
                self.store.find_by_reference(&reference)
            })
            .await?
            .filter(|r| self.codec.match_refresh_value(presented, &r.token_hash))
            .ok_or(TokenError::NotFound)?;

        let affected = match self.settings.revocation_scope {
            RevocationScope::Family => {
                policy
                    .idempotent("revoke_family", || {
                        self.store.revoke_family(record.family_id, now)
                    })
                    .await?
            }
            RevocationScope::Token => {
                policy
                    .idempotent("revoke_token", || self.store.revoke_token(record.id, now))
                    .await?
            }
        };

        info!(
            user_id = %record.user_id,
            family_id = %record.family_id,
            token_id = %record.id,
            scope = ?self.settings.revocation_scope,
            affected,
            "Revoked refresh token"
        );

        Ok(())
    }

    /// Verify an access token presented to a resource endpoint.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessTokenClaims, AccessTokenError> {
        self.codec.verify_access_token(token, Utc::now())
    }

    /// Drop records that expired before `before`.
    pub async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64, TokenError> {
        let purged = self
            .settings
            .store_policy
            .idempotent("purge_expired", || self.store.purge_expired(before))
            .await?;
        if purged > 0 {
            info!(purged, backend = self.store.backend_name(), "Purged expired refresh tokens");
        }
        Ok(purged)
    }

    /// Run the rotation compare-and-set on its own task.
    ///
    /// Dropping the caller's future (client gone, request timeout) must not
    /// interrupt a commit in flight, so the store call is detached from it.
    async fn commit_rotation(
        &self,
        predecessor_id: Uuid,
        successor: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, TokenError> {
        let store = self.store.clone();
        let policy = self.settings.store_policy.clone();

        let task = tokio::spawn(async move {
            policy
                .once(
                    "mark_rotated",
                    store.mark_rotated(predecessor_id, successor, now),
                )
                .await
        });

        task.await.map_err(|e| {
            error!(error = %e, token_id = %predecessor_id, "Rotation task failed");
            TokenError::Internal
        })?
    }

    /// Revoke the whole family after a rotated token came back.
    ///
    /// Returns the error to surface: `ReuseDetected` once the family is
    /// revoked, `StorageUnavailable` if the revocation itself could not land.
    async fn reuse_detected(
        &self,
        token_id: Uuid,
        family_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> TokenError {
        warn!(
            user_id = %user_id,
            family_id = %family_id,
            token_id = %token_id,
            "Refresh token reuse detected - revoking token family"
        );

        match self
            .settings
            .store_policy
            .idempotent("revoke_family", || self.store.revoke_family(family_id, now))
            .await
        {
            Ok(affected) => {
                warn!(family_id = %family_id, affected, "Revoked token family after reuse");
                TokenError::ReuseDetected
            }
            Err(e) => {
                error!(family_id = %family_id, error = %e, "Failed to revoke token family after reuse");
                e
            }
        }
    }
}

fn validate_presented(presented: &str) -> Result<&str, TokenError> {
    let presented = presented.trim();
    if presented.is_empty() {
        return Err(TokenError::InvalidInput(
            "refresh token must not be empty".to_string(),
        ));
    }
    if presented.len() > MAX_PRESENTED_TOKEN_LEN {
        return Err(TokenError::InvalidInput(
            "refresh token is too long".to_string(),
        ));
    }
    Ok(presented)
}

// Log-safe handle: a prefix of the sha256 reference, never the token itself.
fn short_ref(reference: &[u8]) -> String {
    hex::encode(&reference[..reference.len().min(8)])
}

/// Service-level return type to keep handlers thin.
///
/// Handlers map this into the HTTP DTO (TokenResponse).
#[derive(Clone)]
pub struct IssuedTokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub family_id: Uuid,
}

impl std::fmt::Debug for IssuedTokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedTokenPair")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("family_id", &self.family_id)
            .finish_non_exhaustive()
    }
}
