use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::repos::error::RepoResult;
use crate::repos::store::{NewRefreshToken, RefreshTokenRecord, RefreshTokenStore, RotateOutcome};

const RECORD_COLUMNS: &str = r#"
    id,
    user_id,
    family_id,
    token_hash,
    issued_at,
    expires_at,
    used_at,
    rotated_to,
    revoked_at
"#;

/// Postgres-backed refresh token persistence.
///
/// Notes:
/// - Only sha256(token) is stored (opaque token design).
/// - Schema lives in `migrations/0001_refresh_tokens.sql`.
/// - Rotation relies on a conditional UPDATE inside a transaction; no
///   application-level lock is taken, so several server instances can share
///   the same database.
#[derive(Clone, Debug)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> RepoResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RotationState {
    rotated_to: Option<Uuid>,
    revoked_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn create(&self, token: NewRefreshToken) -> RepoResult<RefreshTokenRecord> {
        let sql = format!(
            r#"
            INSERT INTO refresh_tokens (id, user_id, family_id, token_hash, issued_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {RECORD_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, RefreshTokenRecord>(&sql)
            .bind(token.id)
            .bind(token.user_id)
            .bind(token.family_id)
            .bind(token.token_hash)
            .bind(token.issued_at)
            .bind(token.expires_at)
            .fetch_one(&self.pool)
            .await?;

        Ok(row)
    }

    async fn find_by_reference(
        &self,
        token_hash: &[u8],
    ) -> RepoResult<Option<RefreshTokenRecord>> {
        // No state filter here: the caller needs rotated/revoked rows to detect reuse.
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM refresh_tokens
            WHERE token_hash = $1
            LIMIT 1
            "#
        );

        let row = sqlx::query_as::<_, RefreshTokenRecord>(&sql)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn mark_rotated(
        &self,
        predecessor_id: Uuid,
        successor: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> RepoResult<RotateOutcome> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            INSERT INTO refresh_tokens (id, user_id, family_id, token_hash, issued_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {RECORD_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, RefreshTokenRecord>(&sql)
            .bind(successor.id)
            .bind(successor.user_id)
            .bind(successor.family_id)
            .bind(successor.token_hash)
            .bind(successor.issued_at)
            .bind(successor.expires_at)
            .fetch_one(&mut *tx)
            .await?;

        // Compare-and-set. A concurrent rotation holds the row lock until it
        // commits; this statement then re-checks the predicate and matches nothing.
        let done = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET rotated_to = $2,
                used_at = $3
            WHERE id = $1
                AND rotated_to IS NULL
                AND revoked_at IS NULL
                AND expires_at > $3
            "#,
        )
        .bind(predecessor_id)
        .bind(inserted.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if done.rows_affected() == 1 {
            tx.commit().await?;
            return Ok(RotateOutcome::Rotated(inserted));
        }

        let state = sqlx::query_as::<_, RotationState>(
            r#"
            SELECT rotated_to, revoked_at, expires_at
            FROM refresh_tokens
            WHERE id = $1
            "#,
        )
        .bind(predecessor_id)
        .fetch_optional(&mut *tx)
        .await?;

        tx.rollback().await?;

        let outcome = match state {
            None => RotateOutcome::NotFound,
            Some(s) if s.revoked_at.is_some() => RotateOutcome::Revoked,
            Some(s) if s.rotated_to.is_some() => RotateOutcome::AlreadyRotated,
            Some(s) if now >= s.expires_at => RotateOutcome::Expired,
            // The UPDATE predicate and this read disagree only if the row changed
            // in between; report the conservative outcome.
            Some(_) => RotateOutcome::AlreadyRotated,
        };

        Ok(outcome)
    }

    async fn revoke_token(&self, id: Uuid, now: DateTime<Utc>) -> RepoResult<u64> {
        let done = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked_at = $2
            WHERE id = $1
                AND revoked_at IS NULL
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected())
    }

    async fn revoke_family(&self, family_id: Uuid, now: DateTime<Utc>) -> RepoResult<u64> {
        let done = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked_at = $2
            WHERE family_id = $1
                AND revoked_at IS NULL
            "#,
        )
        .bind(family_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected())
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> RepoResult<u64> {
        // Keep rows still referenced by an unexpired predecessor so rotation
        // lineage stays intact for reuse detection.
        let done = sqlx::query(
            r#"
            DELETE FROM refresh_tokens t
            WHERE t.expires_at < $1
                AND NOT EXISTS (
                    SELECT 1
                    FROM refresh_tokens p
                    WHERE p.rotated_to = t.id
                        AND p.expires_at >= $1
                )
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected())
    }
}
