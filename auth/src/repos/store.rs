/*
 * Responsibility
 * - storage-agnostic view of refresh token records
 * - the RefreshTokenStore seam (Postgres in production, in-memory for dev/tests)
 */
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::repos::error::{RepoError, RepoResult};

/// A persisted refresh token.
///
/// Only `token_hash` (sha256 of the opaque value) is stored; the plaintext is
/// handed to the client once and never kept.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub family_id: Uuid,
    pub token_hash: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub rotated_to: Option<Uuid>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RefreshTokenRecord {
    /// Expiry is inclusive: a record whose `expires_at` equals `now` is expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_rotated(&self) -> bool {
        self.rotated_to.is_some()
    }

    pub fn state(&self) -> RecordState {
        if self.is_revoked() {
            RecordState::Revoked
        } else if self.is_rotated() {
            RecordState::Rotated
        } else {
            RecordState::Active
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Active,
    Rotated,
    Revoked,
}

/// Insert payload for a refresh token (root of a family, or a successor).
#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub family_id: Uuid,
    pub token_hash: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl NewRefreshToken {
    /// Build a record issued at `now` that lives for `ttl_seconds`.
    ///
    /// Rejects a zero TTL so `expires_at > issued_at` always holds.
    pub fn new(
        user_id: Uuid,
        family_id: Uuid,
        token_hash: Vec<u8>,
        now: DateTime<Utc>,
        ttl_seconds: u64,
    ) -> RepoResult<Self> {
        let ttl = i64::try_from(ttl_seconds)
            .ok()
            .filter(|s| *s > 0)
            .ok_or(RepoError::InvalidRecord("ttl must be a positive number of seconds"))?;

        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            family_id,
            token_hash,
            issued_at: now,
            expires_at: now + ChronoDuration::seconds(ttl),
        })
    }

    pub fn into_record(self) -> RefreshTokenRecord {
        RefreshTokenRecord {
            id: self.id,
            user_id: self.user_id,
            family_id: self.family_id,
            token_hash: self.token_hash,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            used_at: None,
            rotated_to: None,
            revoked_at: None,
        }
    }
}

/// Result of the compare-and-set rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotateOutcome {
    /// This caller won; the successor is persisted.
    Rotated(RefreshTokenRecord),
    /// Someone else rotated the predecessor first.
    AlreadyRotated,
    Revoked,
    Expired,
    NotFound,
}

/// Durable storage for refresh token records.
///
/// `mark_rotated` is the only serialization point of the refresh protocol and
/// must be atomic per record: among concurrent callers for the same
/// predecessor exactly one observes `RotateOutcome::Rotated`.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync + 'static {
    // Backend name (for logging).
    fn backend_name(&self) -> &'static str;

    async fn create(&self, token: NewRefreshToken) -> RepoResult<RefreshTokenRecord>;

    // Look up a record by its stored reference (sha256 of the opaque value).
    async fn find_by_reference(
        &self,
        token_hash: &[u8],
    ) -> RepoResult<Option<RefreshTokenRecord>>;

    // Atomically set `rotated_to` on the predecessor and insert the successor.
    //
    // Never inserts the successor unless the predecessor was active and unexpired.
    async fn mark_rotated(
        &self,
        predecessor_id: Uuid,
        successor: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> RepoResult<RotateOutcome>;

    // Revoke a single record. Returns rows affected (0 if already revoked).
    async fn revoke_token(&self, id: Uuid, now: DateTime<Utc>) -> RepoResult<u64>;

    // Revoke every record of a family. Returns rows affected.
    async fn revoke_family(&self, family_id: Uuid, now: DateTime<Utc>) -> RepoResult<u64>;

    // Delete records that expired before `before`. Returns rows deleted.
    async fn purge_expired(&self, before: DateTime<Utc>) -> RepoResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_token_rejects_zero_ttl() {
        let now = Utc::now();
        let res = NewRefreshToken::new(Uuid::new_v4(), Uuid::new_v4(), vec![1], now, 0);
        assert!(matches!(res, Err(RepoError::InvalidRecord(_))));
    }

    #[test]
    fn expiry_is_inclusive() {
        let now = Utc::now();
        let record = NewRefreshToken::new(Uuid::new_v4(), Uuid::new_v4(), vec![1], now, 60)
            .unwrap()
            .into_record();

        assert!(record.expires_at > record.issued_at);
        assert!(!record.is_expired(now));
        assert!(record.is_expired(record.expires_at));
        assert!(record.is_expired(record.expires_at + ChronoDuration::seconds(1)));
    }

    #[test]
    fn revoked_wins_over_rotated() {
        let now = Utc::now();
        let mut record = NewRefreshToken::new(Uuid::new_v4(), Uuid::new_v4(), vec![1], now, 60)
            .unwrap()
            .into_record();
        assert_eq!(record.state(), RecordState::Active);

        record.rotated_to = Some(Uuid::new_v4());
        assert_eq!(record.state(), RecordState::Rotated);

        record.revoked_at = Some(now);
        assert_eq!(record.state(), RecordState::Revoked);
    }
}
