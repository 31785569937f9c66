//! Error types for the verification gateway process
//!
//! These are process-level errors: configuration, key-manager and store
//! failures raised while starting up or running background tasks. Errors
//! returned to HTTP callers live in [`crate::api::ApiError`].

use std::io;

use thiserror::Error;

use crate::keys::KeyError;
use crate::store::StoreError;

/// Result type alias for the verification gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Verification gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A signing key manager could not be created
    #[error("Key manager error: {0}")]
    KeyManager(#[from] KeyError),

    /// The backing store could not be opened or seeded
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error must stop the process instead of failing a request.
    ///
    /// Signers and the backing store are opened exactly once at startup.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::KeyManager(_) | Self::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_errors_are_fatal() {
        assert!(Error::Config("missing".into()).is_fatal());
        assert!(Error::KeyManager(KeyError::NoKeys).is_fatal());
        assert!(Error::Store(StoreError::Unavailable("down".into())).is_fatal());
        assert!(!Error::Internal("oops".into()).is_fatal());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::Config("Config file not found: /etc/x.yaml".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: Config file not found: /etc/x.yaml"
        );
    }
}
