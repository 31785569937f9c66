//! Persistence seams for realms, verification codes and issued tokens.
//!
//! The traits abstract over storage backends; the only shipped implementation
//! is [`MemoryStore`]. Every lookup returns `Option` so a missing row can
//! never be mistaken for a zero-valued one.
//!
//! Claiming a code and consuming a token must each happen exactly once, so
//! both are single conditional updates
//! ([`VerificationCodeStore::claim_code`], [`TokenStore::claim_token`]), never
//! a read followed by a write.

mod cached;
mod memory;
pub mod models;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use cached::CachedRealmStore;
pub use memory::MemoryStore;
pub use models::{
    ApiApp, ApiKeyType, AppId, IssuedToken, Realm, RealmId, RealmSettings, Session, TestType,
    TokenSubject, User, UserId, VerificationCode,
};

/// Storage failures. Never shown to callers verbatim.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint was violated
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend could not serve the request
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Why a conditional claim did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRejection {
    /// No matching row
    NotFound,
    /// Past its validity window or revoked
    Expired,
    /// Already claimed / consumed
    AlreadyUsed,
    /// Row exists but does not match the presented binding (subject, realm)
    Mismatch,
    /// The code's test type is not accepted by the caller
    UnsupportedTestType,
}

impl ClaimRejection {
    /// Log-friendly label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::AlreadyUsed => "already_used",
            Self::Mismatch => "mismatch",
            Self::UnsupportedTestType => "unsupported_test_type",
        }
    }
}

/// Result of a compare-and-swap style claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome<T> {
    /// This call performed the transition
    Claimed(T),
    /// The transition did not happen
    Rejected(ClaimRejection),
}

/// Verification code storage.
#[async_trait]
pub trait VerificationCodeStore: Send + Sync + 'static {
    /// Insert a new code. Fails with [`StoreError::Conflict`] when the short or
    /// long code is already in use in the realm.
    async fn insert_code(&self, code: VerificationCode) -> Result<(), StoreError>;

    /// Look up a code by its opaque id.
    async fn find_code(&self, id: Uuid) -> Result<Option<VerificationCode>, StoreError>;

    /// Atomically flip `claimed` from false to true.
    ///
    /// Only one of any number of concurrent calls for the same code returns
    /// [`ClaimOutcome::Claimed`]. An empty `accept` list accepts every test type.
    async fn claim_code(
        &self,
        realm: RealmId,
        code: &str,
        accept: &[TestType],
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome<VerificationCode>, StoreError>;

    /// Mark a live code revoked. Dead codes are left untouched.
    async fn revoke_code(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome<VerificationCode>, StoreError>;

    /// Delete codes whose long window ended before `cutoff`. Returns how many.
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Realm, application, user and session lookups.
#[async_trait]
pub trait RealmStore: Send + Sync + 'static {
    /// Find a realm by id.
    async fn find_realm(&self, id: RealmId) -> Result<Option<Realm>, StoreError>;

    /// Find the app whose API key has the given HMAC digest.
    async fn find_app_by_digest(&self, digest: &str) -> Result<Option<ApiApp>, StoreError>;

    /// Find a user by id.
    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    /// Find a session by its opaque id.
    async fn find_session(&self, id: &str) -> Result<Option<Session>, StoreError>;
}

/// Consumption markers for issued tokens.
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    /// Record a freshly issued token.
    async fn save_token(&self, token: IssuedToken) -> Result<(), StoreError>;

    /// Atomically flip `used` from false to true, checking subject, realm and expiry.
    async fn claim_token(
        &self,
        token_id: &str,
        subject: &str,
        realm: RealmId,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome<IssuedToken>, StoreError>;

    /// Delete token records that expired before `cutoff`. Returns how many.
    async fn purge_tokens(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}
