//! Token → certificate exchange.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use chrono::{NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::api::{ApiError, ErrorCode};
use crate::audit::{self, AuditEvent};
use crate::authorization::ResolvedCaller;
use crate::config::SigningConfig;
use crate::context::Deadline;
use crate::exchange::TokenClaims;
use crate::keys::JwtCodec;
use crate::store::{ClaimOutcome, TokenStore, TokenSubject};
use crate::{Error, Result};

/// Length of the HMAC the device computes over its diagnosis keys.
pub const REPORT_HMAC_LEN: usize = 32;

/// Seconds per exposure-notification interval.
const INTERVAL_SECS: i64 = 600;

/// Builds the attestation claims carried by a certificate.
pub trait CertificatePayload: Send + Sync + 'static {
    /// Claims describing the diagnosis, merged next to `iss`/`aud`/`iat`/`exp`.
    fn claims(&self, subject: &TokenSubject, report_hmac: &str) -> Map<String, Value>;
}

/// `reportType`, `symptomOnsetInterval` and `tekmac`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnosisPayload;

impl CertificatePayload for DiagnosisPayload {
    fn claims(&self, subject: &TokenSubject, report_hmac: &str) -> Map<String, Value> {
        let mut claims = Map::new();
        claims.insert("reportType".into(), subject.test_type.as_str().into());
        if let Some(date) = subject.symptom_date {
            let midnight = date.and_time(NaiveTime::MIN).and_utc().timestamp();
            claims.insert("symptomOnsetInterval".into(), (midnight / INTERVAL_SECS).into());
        }
        claims.insert("tekmac".into(), report_hmac.into());
        claims
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CertificateClaims {
    iss: String,
    aud: String,
    iat: i64,
    exp: i64,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

/// Exchanges verification tokens for signed certificates.
pub struct CertificateIssuer {
    tokens: Arc<dyn TokenStore>,
    token_codec: JwtCodec,
    certificate_codec: JwtCodec,
    duration: TimeDelta,
    payload: Arc<dyn CertificatePayload>,
}

impl CertificateIssuer {
    /// Create an issuer with the [`DiagnosisPayload`] claims.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the certificate duration is out of range.
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        token_codec: JwtCodec,
        certificate_codec: JwtCodec,
        certificate_signing: &SigningConfig,
    ) -> Result<Self> {
        let duration = TimeDelta::from_std(certificate_signing.duration)
            .map_err(|e| Error::Config(format!("certificate_signing.duration: {e}")))?;
        Ok(Self {
            tokens,
            token_codec,
            certificate_codec,
            duration,
            payload: Arc::new(DiagnosisPayload),
        })
    }

    /// Replace the certificate claims builder.
    #[must_use]
    pub fn with_payload(mut self, payload: Arc<dyn CertificatePayload>) -> Self {
        self.payload = payload;
        self
    }

    /// Consume `token` and sign a certificate over `report_payload`.
    ///
    /// # Errors
    ///
    /// `hmac_invalid` for a malformed payload, `token_invalid` for any token
    /// problem (bad signature, expired, wrong realm, already used), and
    /// `Internal` / `Timeout` for store or signing failures.
    pub async fn issue_certificate(
        &self,
        deadline: &Deadline,
        caller: &ResolvedCaller,
        token: &str,
        report_payload: &str,
    ) -> std::result::Result<String, ApiError> {
        let report_payload = report_payload.trim();
        if !is_report_hmac(report_payload) {
            return Err(ApiError::bad_request(
                ErrorCode::HmacInvalid,
                "report payload must be a base64 encoded 32 byte HMAC",
            ));
        }

        let realm_id = caller.realm_id();
        let actor = caller.label();
        let reject = |reason: String| {
            warn!(realm_id = %realm_id, caller = %actor, reason = %reason, "Token rejected");
            audit::emit(&AuditEvent::token_rejected(realm_id, &actor, reason));
            ApiError::InvalidToken
        };

        let claims: TokenClaims = match deadline.bound(self.token_codec.verify(token.trim())).await? {
            Ok(claims) => claims,
            Err(e) => return Err(reject(e.to_string())),
        };
        if claims.realm != realm_id {
            return Err(reject(format!("token issued in realm {}", claims.realm)));
        }
        let subject: TokenSubject = claims.sub.parse().map_err(&reject)?;

        let now = Utc::now();
        let outcome = deadline
            .call(
                "claim_token",
                self.tokens.claim_token(&claims.jti, &claims.sub, realm_id, now),
            )
            .await?;
        if let ClaimOutcome::Rejected(reason) = outcome {
            return Err(reject(reason.as_str().to_string()));
        }
        audit::emit(&AuditEvent::token_consumed(realm_id, &actor, &claims.jti));

        let certificate = CertificateClaims {
            iss: self.certificate_codec.issuer().to_string(),
            aud: self.certificate_codec.audience().to_string(),
            iat: now.timestamp(),
            exp: (now + self.duration).timestamp(),
            payload: self.payload.claims(&subject, report_payload),
        };
        let signed = deadline
            .call("sign_certificate", self.certificate_codec.sign(&certificate))
            .await?;

        info!(realm_id = %realm_id, token_id = %claims.jti, "Certificate issued");
        audit::emit(&AuditEvent::certificate_issued(realm_id, &actor, &claims.jti));
        Ok(signed)
    }
}

fn is_report_hmac(payload: &str) -> bool {
    STANDARD
        .decode(payload)
        .or_else(|_| URL_SAFE.decode(payload))
        .is_ok_and(|bytes| bytes.len() == REPORT_HMAC_LEN)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::Duration;

    use chrono::NaiveDate;
    use uuid::Uuid;

    use super::*;
    use crate::authorization::AuthorizedCaller;
    use crate::keys::{HmacKeyManager, KeyManager};
    use crate::store::{
        ApiApp, ApiKeyType, AppId, IssuedToken, MemoryStore, Realm, RealmId, RealmSettings,
        TestType,
    };

    fn codec(secret: char, audience: &str) -> JwtCodec {
        let mut secrets = BTreeMap::new();
        secrets.insert("v1".to_string(), secret.to_string().repeat(32));
        let manager: Arc<dyn KeyManager> = Arc::new(HmacKeyManager::new("v1", &secrets).unwrap());
        JwtCodec::new(manager, "verification-server", audience)
    }

    fn device(realm_id: u64) -> ResolvedCaller {
        ResolvedCaller {
            caller: AuthorizedCaller::App(ApiApp {
                id: AppId(1),
                name: "device".into(),
                realm_id: Some(RealmId(realm_id)),
                key_type: ApiKeyType::Device,
                key_digest: String::new(),
            }),
            realm: Realm {
                id: RealmId(realm_id),
                name: "realm".into(),
                admins: BTreeSet::new(),
                settings: RealmSettings::default(),
            },
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        tokens: JwtCodec,
        certificates: JwtCodec,
        issuer: CertificateIssuer,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let tokens = codec('t', "tokens");
        let certificates = codec('c', "certificates");
        let issuer = CertificateIssuer::new(
            store.clone(),
            tokens.clone(),
            certificates.clone(),
            &SigningConfig::default(),
        )
        .unwrap();
        Fixture {
            store,
            tokens,
            certificates,
            issuer,
        }
    }

    async fn mint(f: &Fixture, realm: u64, sub: &str, ttl: TimeDelta) -> String {
        let now = Utc::now();
        let claims = TokenClaims {
            iss: f.tokens.issuer().to_string(),
            aud: f.tokens.audience().to_string(),
            sub: sub.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            realm: RealmId(realm),
        };
        f.store
            .save_token(IssuedToken {
                token_id: claims.jti.clone(),
                realm_id: RealmId(realm),
                code_id: Uuid::new_v4(),
                subject: claims.sub.clone(),
                expires_at: now + ttl,
                used: false,
            })
            .await
            .unwrap();
        f.tokens.sign(&claims).await.unwrap()
    }

    fn hmac() -> String {
        STANDARD.encode([7u8; REPORT_HMAC_LEN])
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn token_exchanges_for_certificate_once() {
        // GIVEN: a fresh token
        let f = fixture();
        let token = mint(&f, 1, "confirmed.2020-07-14", TimeDelta::minutes(30)).await;

        // WHEN: exchanging it
        let cert = f
            .issuer
            .issue_certificate(&deadline(), &device(1), &token, &hmac())
            .await
            .unwrap();

        // THEN: the certificate carries the diagnosis claims
        let claims: Map<String, Value> = f.certificates.verify(&cert).await.unwrap();
        assert_eq!(claims["reportType"], "confirmed");
        assert_eq!(claims["tekmac"], hmac().as_str());
        let midnight = NaiveDate::from_ymd_opt(2020, 7, 14)
            .unwrap()
            .and_time(NaiveTime::MIN)
            .and_utc()
            .timestamp();
        assert_eq!(claims["symptomOnsetInterval"], midnight / 600);

        // AND: the token cannot be used again
        let err = f
            .issuer
            .issue_certificate(&deadline(), &device(1), &token, &hmac())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidToken));
    }

    #[tokio::test]
    async fn payload_without_symptom_date_omits_interval() {
        let f = fixture();
        let token = mint(&f, 1, "negative.", TimeDelta::minutes(30)).await;
        let cert = f
            .issuer
            .issue_certificate(&deadline(), &device(1), &token, &hmac())
            .await
            .unwrap();
        let claims: Map<String, Value> = f.certificates.verify(&cert).await.unwrap();
        assert_eq!(claims["reportType"], "negative");
        assert!(claims.get("symptomOnsetInterval").is_none());
    }

    #[tokio::test]
    async fn malformed_hmac_is_rejected_before_the_token_is_touched() {
        let f = fixture();
        let token = mint(&f, 1, "confirmed.", TimeDelta::minutes(30)).await;

        for payload in ["not base64!".to_string(), STANDARD.encode([1u8; 16])] {
            let err = f
                .issuer
                .issue_certificate(&deadline(), &device(1), &token, &payload)
                .await
                .unwrap_err();
            assert_eq!(err.code(), Some(ErrorCode::HmacInvalid));
        }

        assert!(
            f.issuer
                .issue_certificate(&deadline(), &device(1), &token, &hmac())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn token_from_other_realm_is_invalid() {
        let f = fixture();
        let token = mint(&f, 1, "confirmed.", TimeDelta::minutes(30)).await;
        let err = f
            .issuer
            .issue_certificate(&deadline(), &device(2), &token, &hmac())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidToken));
    }

    #[tokio::test]
    async fn expired_forged_and_unknown_tokens_are_invalid() {
        let f = fixture();
        let expired = mint(&f, 1, "confirmed.", TimeDelta::minutes(-10)).await;

        let forged = {
            let other = codec('x', "tokens");
            let now = Utc::now();
            other
                .sign(&TokenClaims {
                    iss: other.issuer().to_string(),
                    aud: other.audience().to_string(),
                    sub: "confirmed.".into(),
                    jti: "forged".into(),
                    iat: now.timestamp(),
                    exp: (now + TimeDelta::minutes(5)).timestamp(),
                    realm: RealmId(1),
                })
                .await
                .unwrap()
        };

        for token in [expired.as_str(), forged.as_str(), "garbage"] {
            let err = f
                .issuer
                .issue_certificate(&deadline(), &device(1), token, &hmac())
                .await
                .unwrap_err();
            assert!(matches!(err, ApiError::InvalidToken), "{token}");
        }
    }

    #[tokio::test]
    async fn custom_payload_builder_is_used() {
        struct Fixed;
        impl CertificatePayload for Fixed {
            fn claims(&self, subject: &TokenSubject, _: &str) -> Map<String, Value> {
                let mut m = Map::new();
                m.insert("kind".into(), subject.test_type.as_str().into());
                m
            }
        }

        let f = fixture();
        let issuer = CertificateIssuer::new(
            f.store.clone(),
            f.tokens.clone(),
            f.certificates.clone(),
            &SigningConfig::default(),
        )
        .unwrap()
        .with_payload(Arc::new(Fixed));
        let token = mint(&f, 1, "likely.", TimeDelta::minutes(30)).await;

        let cert = issuer
            .issue_certificate(&deadline(), &device(1), &token, &hmac())
            .await
            .unwrap();
        let claims: Map<String, Value> = f.certificates.verify(&cert).await.unwrap();
        assert_eq!(claims["kind"], TestType::Likely.as_str());
        assert!(claims.get("tekmac").is_none());
    }
}
