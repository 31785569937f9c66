//! Verification code state machine
//!
//! ```text
//!            issue                 redeem (first writer wins)
//!   (none) ────────► Issued ─────────────────────────────► Claimed
//!                      │
//!                      ├── both windows pass ──► Expired
//!                      └── expire (revoke) ────► Expired
//! ```
//!
//! `Claimed` and `Expired` are terminal. A status check never mutates a
//! code. Redemption is a single conditional update in the store, so any
//! number of concurrent redemptions of one code produce exactly one token.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{ApiError, ErrorCode};
use crate::audit::{self, AuditEvent};
use crate::authorization::{AuthorizedCaller, ResolvedCaller};
use crate::codes;
use crate::config::{SigningConfig, VerificationConfig};
use crate::context::Deadline;
use crate::keys::JwtCodec;
use crate::store::{
    ClaimOutcome, ClaimRejection, IssuedToken, RealmId, StoreError, TestType, TokenStore,
    TokenSubject, VerificationCode, VerificationCodeStore,
};
use crate::{Error, Result};

/// Message shared by every "you cannot see this code" answer, so unknown,
/// cross-realm and hidden-expired codes are indistinguishable.
const CODE_NOT_FOUND: &str = "code does not exist";

/// Claims of a verification token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// `<testtype>.<symptomdate>`
    pub sub: String,
    /// Token id, key of the consumption record
    pub jti: String,
    /// Issued at, unix seconds
    pub iat: i64,
    /// Expiry, unix seconds
    pub exp: i64,
    /// Realm the code was redeemed in
    pub realm: RealmId,
}

/// Read-only view returned by a status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeStatus {
    /// Whether the code was redeemed
    pub claimed: bool,
    /// Short-code expiry
    pub expires_at: DateTime<Utc>,
    /// Long-code expiry
    pub long_expires_at: DateTime<Utc>,
}

/// A successful redemption.
#[derive(Debug, Clone)]
pub struct Redemption {
    /// The code as claimed
    pub code: VerificationCode,
    /// Signed verification token
    pub token: String,
    /// Token expiry
    pub token_expiry: DateTime<Utc>,
}

/// Validates, issues, redeems and revokes verification codes.
pub struct CodeExchangeEngine {
    codes: Arc<dyn VerificationCodeStore>,
    tokens: Arc<dyn TokenStore>,
    token_codec: JwtCodec,
    token_duration: TimeDelta,
    max_symptom_age: TimeDelta,
    collision_retries: usize,
}

impl CodeExchangeEngine {
    /// Create an engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the token duration is out of range.
    pub fn new(
        codes: Arc<dyn VerificationCodeStore>,
        tokens: Arc<dyn TokenStore>,
        token_codec: JwtCodec,
        token_signing: &SigningConfig,
        verification: &VerificationConfig,
    ) -> Result<Self> {
        let token_duration = TimeDelta::from_std(token_signing.duration)
            .map_err(|e| Error::Config(format!("token_signing.duration: {e}")))?;
        Ok(Self {
            codes,
            tokens,
            token_codec,
            token_duration,
            max_symptom_age: TimeDelta::days(i64::from(verification.max_symptom_age_days)),
            collision_retries: verification.collision_retries.max(1),
        })
    }

    /// Report whether a code was claimed and when it expires.
    ///
    /// Never mutates the code. Visibility rules, in order:
    /// unknown id or other realm → `code_not_found`; caller neither issuer
    /// nor admin → `code_not_found` if expired, else `code_user_unauthorized`;
    /// expired → `code_expired`.
    ///
    /// # Errors
    ///
    /// See above; store failures map to `Internal` / `Timeout`.
    pub async fn check_status(
        &self,
        deadline: &Deadline,
        caller: &ResolvedCaller,
        id: &str,
    ) -> std::result::Result<CodeStatus, ApiError> {
        let code = self.visible_code(deadline, caller, id).await?;

        if code.is_expired_at(Utc::now()) {
            debug!(code_id = %code.id, "Status check on expired code");
            return Err(ApiError::code_expired());
        }

        Ok(CodeStatus {
            claimed: code.claimed,
            expires_at: code.expires_at,
            long_expires_at: code.long_expires_at,
        })
    }

    /// Redeem a short or long code for a verification token.
    ///
    /// Unknown, expired, revoked and already claimed codes all fail with
    /// the same `InvalidCode`. A code whose test type is not in `accept`
    /// fails with `UnsupportedTestType` and stays unclaimed.
    ///
    /// # Errors
    ///
    /// See above; store and signing failures map to `Internal` / `Timeout`.
    pub async fn redeem(
        &self,
        deadline: &Deadline,
        caller: &ResolvedCaller,
        code: &str,
        accept: &[TestType],
    ) -> std::result::Result<Redemption, ApiError> {
        let realm_id = caller.realm_id();
        let actor = caller.label();
        let now = Utc::now();

        let outcome = deadline
            .call(
                "claim_code",
                self.codes.claim_code(realm_id, code.trim(), accept, now),
            )
            .await?;

        let claimed = match outcome {
            ClaimOutcome::Claimed(claimed) => claimed,
            ClaimOutcome::Rejected(reason) => {
                warn!(realm_id = %realm_id, caller = %actor, reason = reason.as_str(), "Code redemption rejected");
                audit::emit(&AuditEvent::code_rejected(realm_id, &actor, reason.as_str()));
                return Err(match reason {
                    ClaimRejection::UnsupportedTestType => ApiError::UnsupportedTestType,
                    _ => ApiError::InvalidCode,
                });
            }
        };

        let subject = TokenSubject {
            test_type: claimed.test_type,
            symptom_date: claimed.symptom_date,
        }
        .to_string();
        let token_expiry = now + self.token_duration;
        let claims = TokenClaims {
            iss: self.token_codec.issuer().to_string(),
            aud: self.token_codec.audience().to_string(),
            sub: subject.clone(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: token_expiry.timestamp(),
            realm: realm_id,
        };

        // The code is already burned at this point: a signing failure leaves
        // it claimed and the device must get a new code.
        let token = deadline
            .call("sign_token", self.token_codec.sign(&claims))
            .await
            .inspect_err(|_| error!(code_id = %claimed.id, "Code claimed but token signing failed"))?;

        deadline
            .call(
                "save_token",
                self.tokens.save_token(IssuedToken {
                    token_id: claims.jti.clone(),
                    realm_id,
                    code_id: claimed.id,
                    subject,
                    expires_at: token_expiry,
                    used: false,
                }),
            )
            .await?;

        info!(code_id = %claimed.id, realm_id = %realm_id, "Code redeemed");
        audit::emit(&AuditEvent::code_claimed(&claimed, &actor, &claims.jti));

        Ok(Redemption {
            code: claimed,
            token,
            token_expiry,
        })
    }

    /// Issue a new code in the caller's realm, bound to the caller.
    ///
    /// # Errors
    ///
    /// `invalid_test_type`, `missing_date` or `invalid_date` for bad input;
    /// store failures (or exhausting collision retries) map to `Internal`.
    pub async fn issue(
        &self,
        deadline: &Deadline,
        caller: &ResolvedCaller,
        test_type: &str,
        symptom_date: Option<&str>,
    ) -> std::result::Result<VerificationCode, ApiError> {
        let settings = &caller.realm.settings;

        let test_type: TestType = test_type.parse().map_err(|_| {
            ApiError::bad_request(ErrorCode::InvalidTestType, "invalid test type")
        })?;
        if !settings.allowed_test_types.contains(&test_type) {
            return Err(ApiError::bad_request(
                ErrorCode::InvalidTestType,
                "test type not allowed in this realm",
            ));
        }

        let now = Utc::now();
        let symptom_date = self.validate_symptom_date(symptom_date, now.date_naive())?;
        if symptom_date.is_none() && settings.require_date {
            return Err(ApiError::bad_request(
                ErrorCode::MissingDate,
                "symptom date is required",
            ));
        }

        let expires_at = now + seconds(settings.code_duration_secs);
        let long_expires_at = now + seconds(settings.long_code_duration_secs);
        let (issuing_user, issuing_app) = match &caller.caller {
            AuthorizedCaller::App(app) => (None, Some(app.id)),
            AuthorizedCaller::User(session) => (Some(session.user.id), None),
        };

        for attempt in 1..=self.collision_retries {
            let code = VerificationCode {
                id: Uuid::new_v4(),
                code: codes::numeric(settings.code_length),
                long_code: codes::alphanumeric(settings.long_code_length),
                realm_id: caller.realm_id(),
                issuing_user,
                issuing_app,
                claimed: false,
                test_type,
                symptom_date,
                created_at: now,
                expires_at,
                long_expires_at,
                revoked_at: None,
            };

            match deadline
                .bound(self.codes.insert_code(code.clone()))
                .await?
            {
                Ok(()) => {
                    info!(code_id = %code.id, realm_id = %code.realm_id, "Code issued");
                    audit::emit(&AuditEvent::code_issued(&code, &caller.label()));
                    return Ok(code);
                }
                Err(StoreError::Conflict(reason)) => {
                    debug!(attempt, reason = %reason, "Generated code collided, retrying");
                }
                Err(e) => {
                    error!(error = %e, "Failed to store verification code");
                    return Err(ApiError::Internal);
                }
            }
        }

        error!(
            retries = self.collision_retries,
            realm_id = %caller.realm_id(),
            "Could not generate a unique code"
        );
        Err(ApiError::Internal)
    }

    /// Revoke a code early. Same visibility rules as [`Self::check_status`];
    /// codes that are already dead report `code_expired`.
    ///
    /// # Errors
    ///
    /// See above; store failures map to `Internal` / `Timeout`.
    pub async fn expire(
        &self,
        deadline: &Deadline,
        caller: &ResolvedCaller,
        id: &str,
    ) -> std::result::Result<VerificationCode, ApiError> {
        let code = self.visible_code(deadline, caller, id).await?;

        let outcome = deadline
            .call("revoke_code", self.codes.revoke_code(code.id, Utc::now()))
            .await?;
        match outcome {
            ClaimOutcome::Claimed(revoked) => {
                info!(code_id = %revoked.id, "Code revoked");
                audit::emit(&AuditEvent::code_revoked(&revoked, &caller.label()));
                Ok(revoked)
            }
            ClaimOutcome::Rejected(ClaimRejection::NotFound) => {
                Err(ApiError::code_not_found(CODE_NOT_FOUND))
            }
            ClaimOutcome::Rejected(reason) => {
                debug!(code_id = %code.id, reason = reason.as_str(), "Code already dead");
                Err(ApiError::code_expired())
            }
        }
    }

    /// Fetch a code and apply the realm and authorization rules shared by
    /// status and expiry.
    async fn visible_code(
        &self,
        deadline: &Deadline,
        caller: &ResolvedCaller,
        id: &str,
    ) -> std::result::Result<VerificationCode, ApiError> {
        let Ok(id) = Uuid::parse_str(id.trim()) else {
            debug!("Malformed code id");
            return Err(ApiError::code_not_found(CODE_NOT_FOUND));
        };

        let Some(code) = deadline.call("find_code", self.codes.find_code(id)).await? else {
            debug!(code_id = %id, "Code not found");
            return Err(ApiError::code_not_found(CODE_NOT_FOUND));
        };

        if code.realm_id != caller.realm_id() {
            warn!(
                code_id = %code.id,
                caller = %caller.label(),
                caller_realm = %caller.realm_id(),
                "Cross-realm code lookup"
            );
            return Err(ApiError::code_not_found(CODE_NOT_FOUND));
        }

        if !(caller.issued(&code) || caller.can_admin()) {
            if code.is_expired_at(Utc::now()) {
                return Err(ApiError::code_not_found(CODE_NOT_FOUND));
            }
            warn!(
                code_id = %code.id,
                caller = %caller.label(),
                "Caller did not issue this code and is not a realm admin"
            );
            return Err(ApiError::Unauthorized(Some(ErrorCode::CodeUserUnauthorized)));
        }

        Ok(code)
    }

    fn validate_symptom_date(
        &self,
        raw: Option<&str>,
        today: NaiveDate,
    ) -> std::result::Result<Option<NaiveDate>, ApiError> {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
            ApiError::bad_request(ErrorCode::InvalidDate, "symptom date must be YYYY-MM-DD")
        })?;
        if date > today {
            return Err(ApiError::bad_request(
                ErrorCode::InvalidDate,
                "symptom date is in the future",
            ));
        }
        if today - date > self.max_symptom_age {
            return Err(ApiError::bad_request(
                ErrorCode::InvalidDate,
                "symptom date is too old",
            ));
        }
        Ok(Some(date))
    }
}

fn seconds(secs: u64) -> TimeDelta {
    TimeDelta::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::authorization::SessionUser;
    use crate::keys::{HmacKeyManager, KeyManager};
    use crate::store::{
        ApiApp, ApiKeyType, AppId, MemoryStore, Realm, RealmSettings, User, UserId,
    };

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: CodeExchangeEngine,
        codec: JwtCodec,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut secrets = BTreeMap::new();
        secrets.insert("v1".to_string(), "t".repeat(32));
        let manager: Arc<dyn KeyManager> = Arc::new(HmacKeyManager::new("v1", &secrets).unwrap());
        let codec = JwtCodec::new(manager, "issuer", "audience");
        let engine = CodeExchangeEngine::new(
            store.clone(),
            store.clone(),
            codec.clone(),
            &SigningConfig::default(),
            &VerificationConfig::default(),
        )
        .unwrap();
        Fixture {
            store,
            engine,
            codec,
        }
    }

    fn realm(id: u64) -> Realm {
        Realm {
            id: RealmId(id),
            name: format!("realm-{id}"),
            admins: BTreeSet::from([UserId(99)]),
            settings: RealmSettings::default(),
        }
    }

    fn user(id: u64, realm_id: u64) -> ResolvedCaller {
        ResolvedCaller {
            caller: AuthorizedCaller::User(SessionUser {
                user: User {
                    id: UserId(id),
                    email: format!("{id}@example.com"),
                    name: String::new(),
                    system_admin: false,
                },
                realm_id: Some(RealmId(realm_id)),
            }),
            realm: realm(realm_id),
        }
    }

    fn device(realm_id: u64) -> ResolvedCaller {
        ResolvedCaller {
            caller: AuthorizedCaller::App(ApiApp {
                id: AppId(500),
                name: "device".into(),
                realm_id: Some(RealmId(realm_id)),
                key_type: ApiKeyType::Device,
                key_digest: String::new(),
            }),
            realm: realm(realm_id),
        }
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    async fn insert_expired(store: &MemoryStore, issuer: u64) -> VerificationCode {
        let past = Utc::now() - ChronoDuration::hours(2);
        let code = VerificationCode {
            id: Uuid::new_v4(),
            code: "00000000".into(),
            long_code: "expiredexpired00".into(),
            realm_id: RealmId(1),
            issuing_user: Some(UserId(issuer)),
            issuing_app: None,
            claimed: false,
            test_type: TestType::Confirmed,
            symptom_date: None,
            created_at: past - ChronoDuration::hours(1),
            expires_at: past,
            long_expires_at: past,
            revoked_at: None,
        };
        store.insert_code(code.clone()).await.unwrap();
        code
    }

    fn code_of(err: &ApiError) -> Option<ErrorCode> {
        err.code()
    }

    #[tokio::test]
    async fn issued_code_status_is_unclaimed_and_idempotent() {
        let f = fixture();
        let issuer = user(10, 1);
        let code = f
            .engine
            .issue(&deadline(), &issuer, "confirmed", None)
            .await
            .unwrap();

        let first = f
            .engine
            .check_status(&deadline(), &issuer, &code.id.to_string())
            .await
            .unwrap();
        let second = f
            .engine
            .check_status(&deadline(), &issuer, &code.id.to_string())
            .await
            .unwrap();

        assert!(!first.claimed);
        assert_eq!(first.expires_at, code.expires_at);
        assert_eq!(first.long_expires_at, code.long_expires_at);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn status_reports_long_window_after_short_one_passes() {
        // GIVEN: a code whose short form expired but whose long form is live
        let f = fixture();
        let now = Utc::now();
        let code = VerificationCode {
            id: Uuid::new_v4(),
            code: "11112222".into(),
            long_code: "longlivedlonglive".into(),
            realm_id: RealmId(1),
            issuing_user: Some(UserId(10)),
            issuing_app: None,
            claimed: false,
            test_type: TestType::Confirmed,
            symptom_date: None,
            created_at: now - ChronoDuration::hours(1),
            expires_at: now - ChronoDuration::minutes(30),
            long_expires_at: now + ChronoDuration::hours(20),
            revoked_at: None,
        };
        f.store.insert_code(code.clone()).await.unwrap();

        // WHEN: the issuer checks it
        let status = f
            .engine
            .check_status(&deadline(), &user(10, 1), &code.id.to_string())
            .await
            .unwrap();

        // THEN: both windows are reported and the short one is in the past
        assert!(!status.claimed);
        assert_eq!(status.expires_at, code.expires_at);
        assert_eq!(status.long_expires_at, code.long_expires_at);
        assert!(status.expires_at < now);
    }

    #[tokio::test]
    async fn status_for_other_user_is_unauthorized_but_admin_sees_it() {
        let f = fixture();
        let code = f
            .engine
            .issue(&deadline(), &user(10, 1), "confirmed", None)
            .await
            .unwrap();
        let id = code.id.to_string();

        let err = f
            .engine
            .check_status(&deadline(), &user(11, 1), &id)
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
        assert_eq!(code_of(&err), Some(ErrorCode::CodeUserUnauthorized));

        // user 99 is a realm admin
        assert!(
            f.engine
                .check_status(&deadline(), &user(99, 1), &id)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn expired_code_asymmetry() {
        let f = fixture();
        let code = insert_expired(&f.store, 10).await;
        let id = code.id.to_string();

        let issuer_err = f
            .engine
            .check_status(&deadline(), &user(10, 1), &id)
            .await
            .unwrap_err();
        assert_eq!(code_of(&issuer_err), Some(ErrorCode::CodeExpired));

        let other_err = f
            .engine
            .check_status(&deadline(), &user(11, 1), &id)
            .await
            .unwrap_err();
        assert_eq!(code_of(&other_err), Some(ErrorCode::CodeNotFound));
        assert_eq!(other_err.to_string(), CODE_NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_not_found() {
        let f = fixture();
        for id in [Uuid::new_v4().to_string(), "not-a-uuid".to_string()] {
            let err = f
                .engine
                .check_status(&deadline(), &user(10, 1), &id)
                .await
                .unwrap_err();
            assert_eq!(code_of(&err), Some(ErrorCode::CodeNotFound));
        }
    }

    #[tokio::test]
    async fn other_realm_never_sees_the_code() {
        let f = fixture();
        let code = f
            .engine
            .issue(&deadline(), &user(10, 1), "confirmed", None)
            .await
            .unwrap();

        // even a realm-2 admin gets a plain not-found
        let err = f
            .engine
            .check_status(&deadline(), &user(99, 2), &code.id.to_string())
            .await
            .unwrap_err();
        assert_eq!(code_of(&err), Some(ErrorCode::CodeNotFound));
        assert_eq!(err.to_string(), CODE_NOT_FOUND);

        let err = f
            .engine
            .redeem(&deadline(), &device(2), &code.code, &[TestType::Confirmed])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidCode));
    }

    #[tokio::test]
    async fn redeem_issues_verifiable_token_once() {
        let f = fixture();
        let code = f
            .engine
            .issue(&deadline(), &user(10, 1), "likely", Some("2020-07-14"))
            .await;
        // 2020 is older than the allowed symptom age
        assert_eq!(
            code_of(&code.unwrap_err()),
            Some(ErrorCode::InvalidDate)
        );

        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let code = f
            .engine
            .issue(&deadline(), &user(10, 1), "likely", Some(&today))
            .await
            .unwrap();

        let redemption = f
            .engine
            .redeem(&deadline(), &device(1), &code.long_code, &[TestType::Likely])
            .await
            .unwrap();
        assert!(redemption.code.claimed);

        let claims: TokenClaims = f.codec.verify(&redemption.token).await.unwrap();
        assert_eq!(claims.sub, format!("likely.{today}"));
        assert_eq!(claims.realm, RealmId(1));
        assert_eq!(claims.exp, redemption.token_expiry.timestamp());

        let again = f
            .engine
            .redeem(&deadline(), &device(1), &code.code, &[TestType::Likely])
            .await
            .unwrap_err();
        assert!(matches!(again, ApiError::InvalidCode));

        let status = f
            .engine
            .check_status(&deadline(), &user(10, 1), &code.id.to_string())
            .await
            .unwrap();
        assert!(status.claimed);
    }

    #[tokio::test]
    async fn unsupported_test_type_leaves_code_unclaimed() {
        let f = fixture();
        let code = f
            .engine
            .issue(&deadline(), &user(10, 1), "negative", None)
            .await
            .unwrap();

        let err = f
            .engine
            .redeem(&deadline(), &device(1), &code.code, &[TestType::Confirmed])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::UnsupportedTestType));

        assert!(
            f.engine
                .redeem(&deadline(), &device(1), &code.code, &[TestType::Negative])
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn expired_and_unknown_codes_are_uniformly_invalid() {
        let f = fixture();
        let expired = insert_expired(&f.store, 10).await;
        for candidate in [expired.code.as_str(), expired.long_code.as_str(), "99999999"] {
            let err = f
                .engine
                .redeem(&deadline(), &device(1), candidate, &[TestType::Confirmed])
                .await
                .unwrap_err();
            assert!(matches!(err, ApiError::InvalidCode), "{candidate}");
        }
    }

    #[tokio::test]
    async fn concurrent_redemptions_have_one_winner() {
        let f = fixture();
        let code = f
            .engine
            .issue(&deadline(), &user(10, 1), "confirmed", None)
            .await
            .unwrap();
        let engine = Arc::new(f.engine);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let engine = engine.clone();
                let candidate = code.code.clone();
                tokio::spawn(async move {
                    engine
                        .redeem(&deadline(), &device(1), &candidate, &[TestType::Confirmed])
                        .await
                })
            })
            .collect();

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) => assert!(matches!(e, ApiError::InvalidCode)),
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn issue_validates_input() {
        let f = fixture();
        let issuer = user(10, 1);

        let err = f
            .engine
            .issue(&deadline(), &issuer, "positive-ish", None)
            .await
            .unwrap_err();
        assert_eq!(code_of(&err), Some(ErrorCode::InvalidTestType));

        let tomorrow = (Utc::now().date_naive() + ChronoDuration::days(1))
            .format("%Y-%m-%d")
            .to_string();
        let err = f
            .engine
            .issue(&deadline(), &issuer, "confirmed", Some(&tomorrow))
            .await
            .unwrap_err();
        assert_eq!(code_of(&err), Some(ErrorCode::InvalidDate));

        let err = f
            .engine
            .issue(&deadline(), &issuer, "confirmed", Some("14/07/2020"))
            .await
            .unwrap_err();
        assert_eq!(code_of(&err), Some(ErrorCode::InvalidDate));

        let mut strict = user(10, 1);
        strict.realm.settings.require_date = true;
        strict.realm.settings.allowed_test_types = vec![TestType::Confirmed];
        let err = f
            .engine
            .issue(&deadline(), &strict, "confirmed", None)
            .await
            .unwrap_err();
        assert_eq!(code_of(&err), Some(ErrorCode::MissingDate));
        let err = f
            .engine
            .issue(&deadline(), &strict, "likely", None)
            .await
            .unwrap_err();
        assert_eq!(code_of(&err), Some(ErrorCode::InvalidTestType));
    }

    #[tokio::test]
    async fn issued_code_matches_realm_settings() {
        let f = fixture();
        let caller = user(10, 1);
        let code = f
            .engine
            .issue(&deadline(), &caller, "confirmed", None)
            .await
            .unwrap();

        assert_eq!(code.code.len(), 8);
        assert_eq!(code.long_code.len(), 16);
        assert_eq!(code.issuing_user, Some(UserId(10)));
        assert_eq!(code.issuing_app, None);
        assert_eq!((code.expires_at - code.created_at).num_seconds(), 15 * 60);
        assert_eq!(
            (code.long_expires_at - code.created_at).num_seconds(),
            24 * 60 * 60
        );
        assert_eq!(f.store.code_count(), 1);
    }

    #[tokio::test]
    async fn expire_revokes_and_reports_dead_codes() {
        let f = fixture();
        let issuer = user(10, 1);
        let code = f
            .engine
            .issue(&deadline(), &issuer, "confirmed", None)
            .await
            .unwrap();
        let id = code.id.to_string();

        let err = f
            .engine
            .expire(&deadline(), &user(11, 1), &id)
            .await
            .unwrap_err();
        assert_eq!(code_of(&err), Some(ErrorCode::CodeUserUnauthorized));

        let revoked = f.engine.expire(&deadline(), &issuer, &id).await.unwrap();
        assert!(revoked.revoked_at.is_some());
        assert_eq!(revoked.expires_at, code.expires_at);

        let err = f
            .engine
            .expire(&deadline(), &issuer, &id)
            .await
            .unwrap_err();
        assert_eq!(code_of(&err), Some(ErrorCode::CodeExpired));

        let err = f
            .engine
            .redeem(&deadline(), &device(1), &code.code, &[TestType::Confirmed])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidCode));

        // revoked codes are hidden from non-issuers like any expired code
        let err = f
            .engine
            .check_status(&deadline(), &user(11, 1), &id)
            .await
            .unwrap_err();
        assert_eq!(code_of(&err), Some(ErrorCode::CodeNotFound));
    }
}
