//! JWT signing and verification on top of a [`KeyManager`].

use std::sync::Arc;

use jsonwebtoken::Validation;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{KeyError, KeyManager};

/// Signs claims with the active key and verifies tokens by `kid` lookup.
#[derive(Clone)]
pub struct JwtCodec {
    manager: Arc<dyn KeyManager>,
    issuer: String,
    audience: String,
}

impl JwtCodec {
    /// Create a codec bound to one issuer / audience pair.
    pub fn new(
        manager: Arc<dyn KeyManager>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    /// Expected `iss` claim.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Expected `aud` claim.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Sign `claims` with the active key version.
    pub async fn sign<T: Serialize + Sync>(&self, claims: &T) -> Result<String, KeyError> {
        let signer = self.manager.signer().await?;
        signer.sign(claims)
    }

    /// Verify signature, expiry, issuer and audience; return the claims.
    pub async fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T, KeyError> {
        let header = jsonwebtoken::decode_header(token)?;
        let version = header.kid.ok_or(KeyError::MissingKeyId)?;
        let verifier = self.manager.verifier(&version).await?;

        let mut validation = Validation::new(verifier.algorithm());
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        verifier.verify(token, &validation)
    }
}

impl std::fmt::Debug for JwtCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtCodec")
            .field("backend", &self.manager.backend())
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::Deserialize;

    use super::*;
    use crate::keys::HmacKeyManager;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Claims {
        iss: String,
        aud: String,
        sub: String,
        exp: i64,
    }

    fn manager(active: &str) -> Arc<dyn KeyManager> {
        let mut secrets = BTreeMap::new();
        secrets.insert("v1".to_string(), "a".repeat(32));
        secrets.insert("v2".to_string(), "b".repeat(32));
        Arc::new(HmacKeyManager::new(active, &secrets).unwrap())
    }

    fn claims(iss: &str, aud: &str, exp_offset: i64) -> Claims {
        Claims {
            iss: iss.into(),
            aud: aud.into(),
            sub: "confirmed.2020-07-14".into(),
            exp: chrono::Utc::now().timestamp() + exp_offset,
        }
    }

    #[tokio::test]
    async fn verifies_across_rotation() {
        let before = JwtCodec::new(manager("v1"), "iss", "aud");
        let after = JwtCodec::new(manager("v2"), "iss", "aud");

        let token = before.sign(&claims("iss", "aud", 60)).await.unwrap();
        let decoded: Claims = after.verify(&token).await.unwrap();
        assert_eq!(decoded.sub, "confirmed.2020-07-14");
    }

    #[tokio::test]
    async fn rejects_wrong_audience_and_issuer() {
        let codec = JwtCodec::new(manager("v1"), "iss", "aud");

        let token = codec.sign(&claims("iss", "other", 60)).await.unwrap();
        assert!(codec.verify::<Claims>(&token).await.is_err());

        let token = codec.sign(&claims("someone", "aud", 60)).await.unwrap();
        assert!(codec.verify::<Claims>(&token).await.is_err());
    }

    #[tokio::test]
    async fn rejects_expired_and_tampered() {
        let codec = JwtCodec::new(manager("v1"), "iss", "aud");

        let expired = codec.sign(&claims("iss", "aud", -3600)).await.unwrap();
        assert!(codec.verify::<Claims>(&expired).await.is_err());

        let mut tampered = codec.sign(&claims("iss", "aud", 60)).await.unwrap();
        tampered.push('x');
        assert!(codec.verify::<Claims>(&tampered).await.is_err());

        assert!(codec.verify::<Claims>("not-a-jwt").await.is_err());
    }
}
