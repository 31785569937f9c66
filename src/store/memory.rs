//! In-memory store backed by `DashMap` indices.
//!
//! - `codes`:      code id          → `VerificationCode`
//! - `redeemable`: (realm, code)    → code id  (short and long forms)
//! - `tokens`:     token id (`jti`) → `IssuedToken`
//!
//! Conditional updates run under the `DashMap` shard write lock of the row
//! they touch, which makes them atomic with respect to each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;
use uuid::Uuid;

use super::{
    ApiApp, ClaimOutcome, ClaimRejection, IssuedToken, Realm, RealmId, RealmStore, Session,
    StoreError, TestType, TokenStore, User, UserId, VerificationCode, VerificationCodeStore,
};

/// In-memory implementation of every store trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    realms: DashMap<RealmId, Realm>,
    apps: DashMap<String, ApiApp>,
    users: DashMap<UserId, User>,
    sessions: DashMap<String, Session>,
    codes: DashMap<Uuid, VerificationCode>,
    redeemable: DashMap<(RealmId, String), Uuid>,
    tokens: DashMap<String, IssuedToken>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a realm.
    pub fn put_realm(&self, realm: Realm) {
        self.realms.insert(realm.id, realm);
    }

    /// Add or replace an app, indexed by its key digest.
    pub fn put_app(&self, app: ApiApp) {
        self.apps.insert(app.key_digest.clone(), app);
    }

    /// Add or replace a user.
    pub fn put_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    /// Add or replace a session.
    pub fn put_session(&self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    /// Number of stored codes (live and dead).
    #[must_use]
    pub fn code_count(&self) -> usize {
        self.codes.len()
    }

    fn reserve(&self, realm: RealmId, value: &str, id: Uuid) -> Result<(), StoreError> {
        match self.redeemable.entry((realm, value.to_string())) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "code already in use in realm {realm}"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(id);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl VerificationCodeStore for MemoryStore {
    async fn insert_code(&self, code: VerificationCode) -> Result<(), StoreError> {
        if self.codes.contains_key(&code.id) {
            return Err(StoreError::Conflict(format!("duplicate code id {}", code.id)));
        }

        self.reserve(code.realm_id, &code.code, code.id)?;
        if let Err(e) = self.reserve(code.realm_id, &code.long_code, code.id) {
            self.redeemable.remove(&(code.realm_id, code.code.clone()));
            return Err(e);
        }

        self.codes.insert(code.id, code);
        Ok(())
    }

    async fn find_code(&self, id: Uuid) -> Result<Option<VerificationCode>, StoreError> {
        Ok(self.codes.get(&id).map(|entry| entry.value().clone()))
    }

    async fn claim_code(
        &self,
        realm: RealmId,
        code: &str,
        accept: &[TestType],
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome<VerificationCode>, StoreError> {
        let Some(id) = self
            .redeemable
            .get(&(realm, code.to_string()))
            .map(|entry| *entry.value())
        else {
            return Ok(ClaimOutcome::Rejected(ClaimRejection::NotFound));
        };

        // Holding the write guard for the whole check-and-set.
        let Some(mut entry) = self.codes.get_mut(&id) else {
            return Ok(ClaimOutcome::Rejected(ClaimRejection::NotFound));
        };
        let row = entry.value_mut();

        if row.claimed {
            return Ok(ClaimOutcome::Rejected(ClaimRejection::AlreadyUsed));
        }
        if !row.redeemable_with(code, now) {
            return Ok(ClaimOutcome::Rejected(ClaimRejection::Expired));
        }
        if !accept.is_empty() && !accept.contains(&row.test_type) {
            return Ok(ClaimOutcome::Rejected(ClaimRejection::UnsupportedTestType));
        }

        row.claimed = true;
        Ok(ClaimOutcome::Claimed(row.clone()))
    }

    async fn revoke_code(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome<VerificationCode>, StoreError> {
        let Some(mut entry) = self.codes.get_mut(&id) else {
            return Ok(ClaimOutcome::Rejected(ClaimRejection::NotFound));
        };
        let row = entry.value_mut();

        if row.claimed {
            return Ok(ClaimOutcome::Rejected(ClaimRejection::AlreadyUsed));
        }
        if row.is_expired_at(now) {
            return Ok(ClaimOutcome::Rejected(ClaimRejection::Expired));
        }

        row.revoked_at = Some(now);
        Ok(ClaimOutcome::Claimed(row.clone()))
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let dead: Vec<Uuid> = self
            .codes
            .iter()
            .filter(|e| {
                let code = e.value();
                (code.long_expires_at < cutoff && code.expires_at < cutoff)
                    || code.revoked_at.is_some_and(|at| at < cutoff)
            })
            .map(|e| *e.key())
            .collect();

        let count = dead.len();
        for id in dead {
            if let Some((_, code)) = self.codes.remove(&id) {
                self.redeemable.remove(&(code.realm_id, code.code));
                self.redeemable.remove(&(code.realm_id, code.long_code));
                debug!(code_id = %id, "Purged dead verification code");
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl RealmStore for MemoryStore {
    async fn find_realm(&self, id: RealmId) -> Result<Option<Realm>, StoreError> {
        Ok(self.realms.get(&id).map(|e| e.value().clone()))
    }

    async fn find_app_by_digest(&self, digest: &str) -> Result<Option<ApiApp>, StoreError> {
        Ok(self.apps.get(digest).map(|e| e.value().clone()))
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|e| e.value().clone()))
    }

    async fn find_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(id).map(|e| e.value().clone()))
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn save_token(&self, token: IssuedToken) -> Result<(), StoreError> {
        match self.tokens.entry(token.token_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "duplicate token id {}",
                token.token_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(token);
                Ok(())
            }
        }
    }

    async fn claim_token(
        &self,
        token_id: &str,
        subject: &str,
        realm: RealmId,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome<IssuedToken>, StoreError> {
        let Some(mut entry) = self.tokens.get_mut(token_id) else {
            return Ok(ClaimOutcome::Rejected(ClaimRejection::NotFound));
        };
        let row = entry.value_mut();

        if row.used {
            return Ok(ClaimOutcome::Rejected(ClaimRejection::AlreadyUsed));
        }
        if now > row.expires_at {
            return Ok(ClaimOutcome::Rejected(ClaimRejection::Expired));
        }
        if row.subject != subject || row.realm_id != realm {
            return Ok(ClaimOutcome::Rejected(ClaimRejection::Mismatch));
        }

        row.used = true;
        Ok(ClaimOutcome::Claimed(row.clone()))
    }

    async fn purge_tokens(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.tokens.len();
        self.tokens.retain(|_, token| token.expires_at >= cutoff);
        Ok(before.saturating_sub(self.tokens.len()))
    }
}
