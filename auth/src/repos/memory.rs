use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::repos::error::RepoResult;
use crate::repos::store::{NewRefreshToken, RefreshTokenRecord, RefreshTokenStore, RotateOutcome};

/// Records of one family. Guarded by its own mutex so rotations in
/// different families never contend.
#[derive(Debug, Default)]
struct Family {
    records: HashMap<Uuid, RefreshTokenRecord>,
}

#[derive(Debug, Clone, Copy)]
struct RecordKey {
    family_id: Uuid,
    id: Uuid,
}

/// In-process store used when no database is configured, and by tests.
///
/// Lock order is always families map -> family. Only `create` awaits a family
/// lock while holding the map; no path awaits the map while holding a family.
#[derive(Debug, Default, Clone)]
pub struct MemoryRefreshTokenStore {
    by_hash: Arc<RwLock<HashMap<Vec<u8>, RecordKey>>>,
    families: Arc<RwLock<HashMap<Uuid, Arc<Mutex<Family>>>>>,
}

impl MemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn family(&self, family_id: Uuid) -> Option<Arc<Mutex<Family>>> {
        self.families.read().await.get(&family_id).cloned()
    }

    /// Number of records currently held (all families).
    pub async fn len(&self) -> usize {
        self.by_hash.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of every record in a family, oldest first.
    pub async fn family_records(&self, family_id: Uuid) -> Vec<RefreshTokenRecord> {
        let Some(family) = self.family(family_id).await else {
            return Vec::new();
        };
        let guard = family.lock().await;
        let mut records: Vec<_> = guard.records.values().cloned().collect();
        records.sort_by_key(|r| r.issued_at);
        records
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryRefreshTokenStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, token: NewRefreshToken) -> RepoResult<RefreshTokenRecord> {
        let record = token.into_record();
        let key = RecordKey {
            family_id: record.family_id,
            id: record.id,
        };

        {
            // Held until the record is in place so a purge cannot drop the
            // family while it is still empty.
            let mut families = self.families.write().await;
            let family = families.entry(record.family_id).or_default().clone();
            family.lock().await.records.insert(record.id, record.clone());
        }
        self.by_hash
            .write()
            .await
            .insert(record.token_hash.clone(), key);

        Ok(record)
    }

    async fn find_by_reference(
        &self,
        token_hash: &[u8],
    ) -> RepoResult<Option<RefreshTokenRecord>> {
        let key = match self.by_hash.read().await.get(token_hash).copied() {
            Some(k) => k,
            None => return Ok(None),
        };

        let Some(family) = self.family(key.family_id).await else {
            return Ok(None);
        };
        let guard = family.lock().await;
        Ok(guard.records.get(&key.id).cloned())
    }

    async fn mark_rotated(
        &self,
        predecessor_id: Uuid,
        successor: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> RepoResult<RotateOutcome> {
        let Some(family) = self.family(successor.family_id).await else {
            return Ok(RotateOutcome::NotFound);
        };

        let inserted = {
            let mut guard = family.lock().await;

            let Some(predecessor) = guard.records.get_mut(&predecessor_id) else {
                return Ok(RotateOutcome::NotFound);
            };
            if predecessor.is_revoked() {
                return Ok(RotateOutcome::Revoked);
            }
            if predecessor.is_rotated() {
                return Ok(RotateOutcome::AlreadyRotated);
            }
            if predecessor.is_expired(now) {
                return Ok(RotateOutcome::Expired);
            }

            predecessor.rotated_to = Some(successor.id);
            predecessor.used_at = Some(now);

            // Insert under the same family lock so a concurrent family
            // revocation always sees the successor.
            let record = successor.into_record();
            guard.records.insert(record.id, record.clone());
            record
        };

        self.by_hash.write().await.insert(
            inserted.token_hash.clone(),
            RecordKey {
                family_id: inserted.family_id,
                id: inserted.id,
            },
        );

        Ok(RotateOutcome::Rotated(inserted))
    }

    async fn revoke_token(&self, id: Uuid, now: DateTime<Utc>) -> RepoResult<u64> {
        let families: Vec<_> = self.families.read().await.values().cloned().collect();
        for family in families {
            let mut guard = family.lock().await;
            if let Some(record) = guard.records.get_mut(&id) {
                if record.is_revoked() {
                    return Ok(0);
                }
                record.revoked_at = Some(now);
                return Ok(1);
            }
        }
        Ok(0)
    }

    async fn revoke_family(&self, family_id: Uuid, now: DateTime<Utc>) -> RepoResult<u64> {
        let Some(family) = self.family(family_id).await else {
            return Ok(0);
        };

        let mut guard = family.lock().await;
        let mut affected = 0;
        for record in guard.records.values_mut().filter(|r| !r.is_revoked()) {
            record.revoked_at = Some(now);
            affected += 1;
        }
        Ok(affected)
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> RepoResult<u64> {
        let families: Vec<(Uuid, Arc<Mutex<Family>>)> = self
            .families
            .read()
            .await
            .iter()
            .map(|(id, f)| (*id, f.clone()))
            .collect();

        let mut purged_hashes = Vec::new();
        let mut emptied = Vec::new();

        for (family_id, family) in families {
            let mut guard = family.lock().await;

            // Keep successors still referenced by an unexpired predecessor.
            let pinned: Vec<Uuid> = guard
                .records
                .values()
                .filter(|r| r.expires_at >= before)
                .filter_map(|r| r.rotated_to)
                .collect();

            guard.records.retain(|id, r| {
                let keep = r.expires_at >= before || pinned.contains(id);
                if !keep {
                    purged_hashes.push(r.token_hash.clone());
                }
                keep
            });

            if guard.records.is_empty() {
                emptied.push(family_id);
            }
        }

        {
            let mut by_hash = self.by_hash.write().await;
            for hash in &purged_hashes {
                by_hash.remove(hash);
            }
        }

        if !emptied.is_empty() {
            let mut families = self.families.write().await;
            for family_id in emptied {
                // A concurrent create may have refilled it.
                let still_empty = match families.get(&family_id) {
                    Some(f) => f.try_lock().map(|g| g.records.is_empty()).unwrap_or(false),
                    None => false,
                };
                if still_empty {
                    families.remove(&family_id);
                }
            }
        }

        Ok(purged_hashes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    fn new_token(family_id: Uuid, hash: &[u8], now: DateTime<Utc>) -> NewRefreshToken {
        NewRefreshToken::new(Uuid::nil(), family_id, hash.to_vec(), now, 60).unwrap()
    }

    #[tokio::test]
    async fn create_then_find_by_reference() {
        let store = MemoryRefreshTokenStore::new();
        let now = Utc::now();
        let family_id = Uuid::new_v4();

        let created = store.create(new_token(family_id, b"h1", now)).await.unwrap();
        let found = store.find_by_reference(b"h1").await.unwrap();

        assert_eq!(found, Some(created));
        assert!(store.find_by_reference(b"nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_rotated_is_compare_and_set() {
        let store = MemoryRefreshTokenStore::new();
        let now = Utc::now();
        let family_id = Uuid::new_v4();
        let root = store.create(new_token(family_id, b"h1", now)).await.unwrap();

        let first = store
            .mark_rotated(root.id, new_token(family_id, b"h2", now), now)
            .await
            .unwrap();
        let RotateOutcome::Rotated(successor) = first else {
            panic!("expected rotation, got {first:?}");
        };

        let second = store
            .mark_rotated(root.id, new_token(family_id, b"h3", now), now)
            .await
            .unwrap();
        assert_eq!(second, RotateOutcome::AlreadyRotated);

        // The losing successor must not have been stored.
        assert!(store.find_by_reference(b"h3").await.unwrap().is_none());

        let root = store.find_by_reference(b"h1").await.unwrap().unwrap();
        assert_eq!(root.rotated_to, Some(successor.id));
        assert_eq!(root.used_at, Some(now));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn mark_rotated_rejects_revoked_and_expired() {
        let store = MemoryRefreshTokenStore::new();
        let now = Utc::now();

        let revoked_family = Uuid::new_v4();
        let revoked = store.create(new_token(revoked_family, b"r1", now)).await.unwrap();
        store.revoke_token(revoked.id, now).await.unwrap();
        let outcome = store
            .mark_rotated(revoked.id, new_token(revoked_family, b"r2", now), now)
            .await
            .unwrap();
        assert_eq!(outcome, RotateOutcome::Revoked);

        let expired_family = Uuid::new_v4();
        let expired = store.create(new_token(expired_family, b"e1", now)).await.unwrap();
        let outcome = store
            .mark_rotated(
                expired.id,
                new_token(expired_family, b"e2", now),
                expired.expires_at,
            )
            .await
            .unwrap();
        assert_eq!(outcome, RotateOutcome::Expired);

        let outcome = store
            .mark_rotated(Uuid::new_v4(), new_token(Uuid::new_v4(), b"x", now), now)
            .await
            .unwrap();
        assert_eq!(outcome, RotateOutcome::NotFound);
    }

    #[tokio::test]
    async fn revoke_family_is_idempotent_and_scoped() {
        let store = MemoryRefreshTokenStore::new();
        let now = Utc::now();
        let family_a = Uuid::new_v4();
        let family_b = Uuid::new_v4();

        let root = store.create(new_token(family_a, b"a1", now)).await.unwrap();
        store
            .mark_rotated(root.id, new_token(family_a, b"a2", now), now)
            .await
            .unwrap();
        store.create(new_token(family_b, b"b1", now)).await.unwrap();

        assert_eq!(store.revoke_family(family_a, now).await.unwrap(), 2);
        assert_eq!(store.revoke_family(family_a, now).await.unwrap(), 0);

        assert!(store.family_records(family_a).await.iter().all(|r| r.is_revoked()));
        let b1 = store.find_by_reference(b"b1").await.unwrap().unwrap();
        assert!(!b1.is_revoked());
    }

    #[tokio::test]
    async fn purge_expired_keeps_live_lineage() {
        let store = MemoryRefreshTokenStore::new();
        let now = Utc::now();
        let family_id = Uuid::new_v4();

        let old = store.create(new_token(family_id, b"old", now)).await.unwrap();
        let later = now + ChronoDuration::seconds(30);
        let live = NewRefreshToken::new(Uuid::nil(), family_id, b"live".to_vec(), later, 60).unwrap();
        store.mark_rotated(old.id, live, later).await.unwrap();

        let other = store
            .create(new_token(Uuid::new_v4(), b"gone", now))
            .await
            .unwrap();

        // `old` and `gone` expire at now+60, `live` at now+90.
        let purged = store
            .purge_expired(now + ChronoDuration::seconds(61))
            .await
            .unwrap();

        assert_eq!(purged, 2);
        assert!(store.find_by_reference(b"old").await.unwrap().is_none());
        assert!(store.find_by_reference(b"live").await.unwrap().is_some());
        assert!(store.family_records(other.family_id).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn create_racing_purge_of_same_family_stays_findable() {
        let store = MemoryRefreshTokenStore::new();
        let now = Utc::now();
        let after_expiry = now + ChronoDuration::seconds(61);

        for i in 0..200u32 {
            let family_id = Uuid::new_v4();
            store
                .create(new_token(family_id, format!("stale-{i}").as_bytes(), now))
                .await
                .unwrap();

            let hash = format!("fresh-{i}").into_bytes();
            let purge = tokio::spawn({
                let store = store.clone();
                async move { store.purge_expired(after_expiry).await }
            });
            let create = tokio::spawn({
                let store = store.clone();
                let token = new_token(family_id, &hash, after_expiry);
                async move { store.create(token).await }
            });
            purge.await.unwrap().unwrap();
            create.await.unwrap().unwrap();

            assert!(store.find_by_reference(&hash).await.unwrap().is_some());
            assert_eq!(store.family_records(family_id).await.len(), 1);
        }
    }
}
