//! Audit logging for verification code and token lifecycle events.
//!
//! Every event is emitted via `tracing::info!` as a JSON blob in the `audit`
//! field.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `code.issued` | A verification code is created |
//! | `code.claimed` | A code is redeemed for a token |
//! | `code.revoked` | A code is expired early by its issuer or an admin |
//! | `code.rejected` | A redemption attempt fails |
//! | `token.consumed` | A token is exchanged for a certificate |
//! | `token.rejected` | A certificate exchange fails |
//! | `certificate.issued` | A certificate is signed |

use serde::Serialize;
use uuid::Uuid;

use crate::store::{RealmId, TestType, VerificationCode};

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"code.claimed"`).
    pub event: &'static str,
    /// Realm the event happened in.
    pub realm_id: RealmId,
    /// Acting app or user (`app:<id>` / `user:<id>`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Affected code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_id: Option<Uuid>,
    /// Token id (`jti`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    /// Test type of the affected code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_type: Option<TestType>,
    /// Why an operation was rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn base(event: &'static str, realm_id: RealmId, actor: &str) -> Self {
        Self {
            event,
            realm_id,
            actor: Some(actor.to_string()),
            code_id: None,
            token_id: None,
            test_type: None,
            reason: None,
        }
    }

    /// `code.issued`
    #[must_use]
    pub fn code_issued(code: &VerificationCode, actor: &str) -> Self {
        Self {
            code_id: Some(code.id),
            test_type: Some(code.test_type),
            ..Self::base("code.issued", code.realm_id, actor)
        }
    }

    /// `code.claimed`; `token_id` is the token the code was exchanged for.
    #[must_use]
    pub fn code_claimed(code: &VerificationCode, actor: &str, token_id: &str) -> Self {
        Self {
            code_id: Some(code.id),
            token_id: Some(token_id.to_string()),
            test_type: Some(code.test_type),
            ..Self::base("code.claimed", code.realm_id, actor)
        }
    }

    /// `code.revoked`
    #[must_use]
    pub fn code_revoked(code: &VerificationCode, actor: &str) -> Self {
        Self {
            code_id: Some(code.id),
            ..Self::base("code.revoked", code.realm_id, actor)
        }
    }

    /// `code.rejected`
    #[must_use]
    pub fn code_rejected(realm_id: RealmId, actor: &str, reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::base("code.rejected", realm_id, actor)
        }
    }

    /// `token.consumed`
    #[must_use]
    pub fn token_consumed(realm_id: RealmId, actor: &str, token_id: &str) -> Self {
        Self {
            token_id: Some(token_id.to_string()),
            ..Self::base("token.consumed", realm_id, actor)
        }
    }

    /// `token.rejected`
    #[must_use]
    pub fn token_rejected(realm_id: RealmId, actor: &str, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::base("token.rejected", realm_id, actor)
        }
    }

    /// `certificate.issued`
    #[must_use]
    pub fn certificate_issued(realm_id: RealmId, actor: &str, token_id: &str) -> Self {
        Self {
            token_id: Some(token_id.to_string()),
            ..Self::base("certificate.issued", realm_id, actor)
        }
    }
}

/// Emit an audit event via `tracing::info!`.
///
/// ```text
/// INFO verification_gateway::audit audit={"event":"code.claimed","realm_id":1,...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "verification audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn code() -> VerificationCode {
        let now = Utc::now();
        VerificationCode {
            id: Uuid::nil(),
            code: "12345678".into(),
            long_code: "abcdefghijklmnop".into(),
            realm_id: RealmId(7),
            issuing_user: None,
            issuing_app: None,
            claimed: false,
            test_type: TestType::Confirmed,
            symptom_date: None,
            created_at: now,
            expires_at: now + Duration::minutes(15),
            long_expires_at: now + Duration::hours(24),
            revoked_at: None,
        }
    }

    #[test]
    fn claimed_event_serializes_without_code_values() {
        // GIVEN: a claimed code
        let code = code();

        // WHEN: serializing the audit event
        let json = serde_json::to_value(AuditEvent::code_claimed(&code, "app:3", "jti-1")).unwrap();

        // THEN: ids are present, redeemable values are not
        assert_eq!(json["event"], "code.claimed");
        assert_eq!(json["realm_id"], 7);
        assert_eq!(json["actor"], "app:3");
        assert_eq!(json["token_id"], "jti-1");
        assert_eq!(json["test_type"], "confirmed");
        let text = json.to_string();
        assert!(!text.contains("12345678"));
        assert!(!text.contains("abcdefghijklmnop"));
    }

    #[test]
    fn rejected_event_skips_empty_fields() {
        let json =
            serde_json::to_value(AuditEvent::code_rejected(RealmId(1), "app:1", "expired")).unwrap();
        assert_eq!(json["reason"], "expired");
        assert!(json.get("code_id").is_none());
        assert!(json.get("token_id").is_none());
    }

    #[test]
    fn emit_does_not_panic() {
        emit(&AuditEvent::certificate_issued(RealmId(1), "app:1", "jti"));
    }
}
