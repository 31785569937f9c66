//! Signing key management.
//!
//! [`KeyManager`] is the capability interface every signing backend
//! implements. Backends are selected once at startup from configuration
//! ([`key_manager_for`]); a backend that cannot produce a signer stops the
//! process.
//!
//! | Backend | Algorithm | Material |
//! |---------|-----------|----------|
//! | [`HmacKeyManager`] | HS256 | versioned shared secrets |
//! | [`PemKeyManager`] | ES256 / EdDSA | versioned PEM key pairs on disk |
//!
//! Neither signers nor verifiers expose key bytes: they wrap opaque
//! `jsonwebtoken` keys and only offer sign / verify.

pub mod jwt;
mod pem;
mod software;

use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::KeyManagerConfig;

pub use jwt::JwtCodec;
pub use pem::PemKeyManager;
pub use software::HmacKeyManager;

/// Key management failures.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// The backend has no key material at all
    #[error("no signing keys configured")]
    NoKeys,

    /// The requested key version does not exist
    #[error("unknown key version '{0}'")]
    UnknownVersion(String),

    /// Token header carries no `kid`
    #[error("token has no key id")]
    MissingKeyId,

    /// Key material is present but unusable
    #[error("invalid key material for version '{version}': {reason}")]
    InvalidKey {
        /// Key version
        version: String,
        /// What is wrong with it
        reason: String,
    },

    /// JWT encode / decode / signature failure
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Key file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Signs claims with one specific key version.
pub struct KeySigner {
    version: String,
    algorithm: Algorithm,
    key: EncodingKey,
}

impl KeySigner {
    pub(crate) fn new(version: impl Into<String>, algorithm: Algorithm, key: EncodingKey) -> Self {
        Self {
            version: version.into(),
            algorithm,
            key,
        }
    }

    /// Key version, written into the JWT `kid` header.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Signature algorithm.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Produce a compact JWS over `claims`.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, KeyError> {
        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.version.clone());
        Ok(jsonwebtoken::encode(&header, claims, &self.key)?)
    }
}

impl std::fmt::Debug for KeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySigner")
            .field("version", &self.version)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Verifies signatures made by one specific key version.
pub struct KeyVerifier {
    version: String,
    algorithm: Algorithm,
    key: DecodingKey,
}

impl KeyVerifier {
    pub(crate) fn new(version: impl Into<String>, algorithm: Algorithm, key: DecodingKey) -> Self {
        Self {
            version: version.into(),
            algorithm,
            key,
        }
    }

    /// Key version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Signature algorithm.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Check the signature and the standard claims required by `validation`.
    pub fn verify<T: DeserializeOwned>(
        &self,
        token: &str,
        validation: &Validation,
    ) -> Result<T, KeyError> {
        Ok(jsonwebtoken::decode::<T>(token, &self.key, validation)?.claims)
    }
}

/// Capability interface over signing backends (software, HSM, cloud KMS).
#[async_trait]
pub trait KeyManager: Send + Sync + 'static {
    /// Backend name, for logs.
    fn backend(&self) -> &'static str;

    /// Signer for the active key version.
    async fn signer(&self) -> Result<KeySigner, KeyError>;

    /// Verifier for a specific key version (rotation lookup).
    async fn verifier(&self, version: &str) -> Result<KeyVerifier, KeyError>;

    /// All versions this manager can verify, active one included.
    fn versions(&self) -> Vec<String>;
}

/// Build the key manager selected by configuration.
///
/// Called once at startup; errors are fatal.
pub fn key_manager_for(config: &KeyManagerConfig) -> Result<Arc<dyn KeyManager>, KeyError> {
    let manager: Arc<dyn KeyManager> = match config {
        KeyManagerConfig::Hmac { active, secrets } => {
            Arc::new(HmacKeyManager::new(active, secrets)?)
        }
        KeyManagerConfig::Pem {
            active,
            algorithm,
            keys,
        } => Arc::new(PemKeyManager::load(active, *algorithm, keys)?),
    };

    tracing::info!(
        backend = manager.backend(),
        versions = ?manager.versions(),
        "Key manager ready"
    );
    Ok(manager)
}
