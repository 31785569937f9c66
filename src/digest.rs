//! Keyed digests for identifiers that must never be stored or keyed raw
//! (API keys, client addresses, cache keys).

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 keyed digester with a fixed secret.
#[derive(Clone)]
pub struct KeyedDigest {
    secret: Vec<u8>,
}

impl KeyedDigest {
    /// Create a digester. HMAC accepts keys of any length.
    #[must_use]
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Lowercase hex HMAC-SHA256 of `data`.
    #[must_use]
    pub fn hex(&self, data: impl AsRef<[u8]>) -> String {
        hex::encode(self.raw(data.as_ref()))
    }

    fn raw(&self, data: &[u8]) -> Vec<u8> {
        // HMAC is defined for every key length, so construction cannot fail.
        let mut mac = <HmacSha256 as KeyInit>::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

impl std::fmt::Debug for KeyedDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedDigest").finish_non_exhaustive()
    }
}

/// Constant-time equality for digests and secrets.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
