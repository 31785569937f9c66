//! Asymmetric key manager loading versioned PEM key pairs from disk.
//!
//! Retired versions may ship only a public key: they keep verifying tokens
//! signed before the rotation but can never sign again.

use std::collections::BTreeMap;
use std::fs;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};

use super::{KeyError, KeyManager, KeySigner, KeyVerifier};
use crate::config::{PemAlgorithm, PemKeyPaths};

struct LoadedKey {
    signing: Option<EncodingKey>,
    verifying: DecodingKey,
}

/// ES256 / EdDSA signing with PEM key pairs.
pub struct PemKeyManager {
    active: String,
    algorithm: Algorithm,
    keys: BTreeMap<String, LoadedKey>,
}

impl PemKeyManager {
    /// Read and parse every configured key pair.
    pub fn load(
        active: &str,
        algorithm: PemAlgorithm,
        paths: &BTreeMap<String, PemKeyPaths>,
    ) -> Result<Self, KeyError> {
        if paths.is_empty() {
            return Err(KeyError::NoKeys);
        }

        let mut keys = BTreeMap::new();
        for (version, pair) in paths {
            let invalid = |reason: String| KeyError::InvalidKey {
                version: version.clone(),
                reason,
            };

            let public_pem = fs::read(&pair.public_key)?;
            let verifying = match algorithm {
                PemAlgorithm::Es256 => DecodingKey::from_ec_pem(&public_pem),
                PemAlgorithm::EdDsa => DecodingKey::from_ed_pem(&public_pem),
            }
            .map_err(|e| invalid(format!("public key: {e}")))?;

            let signing = match &pair.private_key {
                Some(path) => {
                    let private_pem = fs::read(path)?;
                    let key = match algorithm {
                        PemAlgorithm::Es256 => EncodingKey::from_ec_pem(&private_pem),
                        PemAlgorithm::EdDsa => EncodingKey::from_ed_pem(&private_pem),
                    }
                    .map_err(|e| invalid(format!("private key: {e}")))?;
                    Some(key)
                }
                None => None,
            };

            keys.insert(version.clone(), LoadedKey { signing, verifying });
        }

        match keys.get(active) {
            None => return Err(KeyError::UnknownVersion(active.to_string())),
            Some(key) if key.signing.is_none() => {
                return Err(KeyError::InvalidKey {
                    version: active.to_string(),
                    reason: "active version has no private key".to_string(),
                });
            }
            Some(_) => {}
        }

        Ok(Self {
            active: active.to_string(),
            algorithm: algorithm.algorithm(),
            keys,
        })
    }
}

#[async_trait]
impl KeyManager for PemKeyManager {
    fn backend(&self) -> &'static str {
        "pem"
    }

    async fn signer(&self) -> Result<KeySigner, KeyError> {
        let key = self
            .keys
            .get(&self.active)
            .and_then(|k| k.signing.clone())
            .ok_or_else(|| KeyError::UnknownVersion(self.active.clone()))?;
        Ok(KeySigner::new(self.active.clone(), self.algorithm, key))
    }

    async fn verifier(&self, version: &str) -> Result<KeyVerifier, KeyError> {
        let key = self
            .keys
            .get(version)
            .ok_or_else(|| KeyError::UnknownVersion(version.to_string()))?;
        Ok(KeyVerifier::new(
            version,
            self.algorithm,
            key.verifying.clone(),
        ))
    }

    fn versions(&self) -> Vec<String> {
        self.keys.keys().cloned().collect()
    }
}
