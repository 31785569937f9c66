//! Software key manager holding versioned HMAC secrets.

use std::collections::BTreeMap;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};

use super::{KeyError, KeyManager, KeySigner, KeyVerifier};
use crate::config::resolve_secret;

/// Shortest accepted secret, in bytes (the HS256 output size).
pub const MIN_SECRET_LEN: usize = 32;

/// HS256 signing with versioned shared secrets.
pub struct HmacKeyManager {
    active: String,
    secrets: BTreeMap<String, Vec<u8>>,
}

impl HmacKeyManager {
    /// Build from configured secrets. Values may use `env:VAR` indirection.
    pub fn new(active: &str, secrets: &BTreeMap<String, String>) -> Result<Self, KeyError> {
        if secrets.is_empty() {
            return Err(KeyError::NoKeys);
        }

        let mut resolved = BTreeMap::new();
        for (version, raw) in secrets {
            let secret = resolve_secret(raw)
                .map_err(|e| KeyError::InvalidKey {
                    version: version.clone(),
                    reason: e.to_string(),
                })?
                .into_bytes();
            if secret.len() < MIN_SECRET_LEN {
                return Err(KeyError::InvalidKey {
                    version: version.clone(),
                    reason: format!("secret must be at least {MIN_SECRET_LEN} bytes"),
                });
            }
            resolved.insert(version.clone(), secret);
        }

        if !resolved.contains_key(active) {
            return Err(KeyError::UnknownVersion(active.to_string()));
        }

        Ok(Self {
            active: active.to_string(),
            secrets: resolved,
        })
    }
}

#[async_trait]
impl KeyManager for HmacKeyManager {
    fn backend(&self) -> &'static str {
        "hmac"
    }

    async fn signer(&self) -> Result<KeySigner, KeyError> {
        let secret = self
            .secrets
            .get(&self.active)
            .ok_or_else(|| KeyError::UnknownVersion(self.active.clone()))?;
        Ok(KeySigner::new(
            self.active.clone(),
            Algorithm::HS256,
            EncodingKey::from_secret(secret),
        ))
    }

    async fn verifier(&self, version: &str) -> Result<KeyVerifier, KeyError> {
        let secret = self
            .secrets
            .get(version)
            .ok_or_else(|| KeyError::UnknownVersion(version.to_string()))?;
        Ok(KeyVerifier::new(
            version,
            Algorithm::HS256,
            DecodingKey::from_secret(secret),
        ))
    }

    fn versions(&self) -> Vec<String> {
        self.secrets.keys().cloned().collect()
    }
}
