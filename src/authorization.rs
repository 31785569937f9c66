//! Caller resolution and realm scoping
//!
//! Every API request is made either by an application holding an API key or
//! by a logged-in user presenting a session. [`AuthorizationResolver`] turns
//! the request credentials into a [`ResolvedCaller`] exactly once per request;
//! handlers only ever see the resolved value.
//!
//! | Credential | Header | Resolves to |
//! |------------|--------|-------------|
//! | API key | `X-API-Key` (configurable) | [`AuthorizedCaller::App`] + app realm |
//! | Session | `Authorization: Bearer <session>` | [`AuthorizedCaller::User`] + session realm |

use std::sync::Arc;

use axum::http::{HeaderMap, header};
use chrono::Utc;
use tracing::{debug, warn};

use crate::api::ApiError;
use crate::config::{AuthConfig, resolve_secret};
use crate::context::Deadline;
use crate::digest::KeyedDigest;
use crate::store::{ApiApp, ApiKeyType, Realm, RealmId, RealmStore, User, VerificationCode};

/// Which credentials an endpoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Device-facing endpoints: device API keys only
    Device,
    /// Administrative endpoints: admin API keys or user sessions
    Admin,
}

/// A user acting through a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    /// The user
    pub user: User,
    /// Realm selected in the session
    pub realm_id: Option<RealmId>,
}

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizedCaller {
    /// An application authenticated by API key
    App(ApiApp),
    /// A user authenticated by session
    User(SessionUser),
}

impl AuthorizedCaller {
    /// The realm this caller acts in.
    #[must_use]
    pub fn realm_id(&self) -> Option<RealmId> {
        match self {
            Self::App(app) => app.realm_id,
            Self::User(session) => session.realm_id,
        }
    }

    /// `app:<id>` or `user:<id>`, for logs and audit events.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::App(app) => format!("app:{}", app.id),
            Self::User(session) => format!("user:{}", session.user.id),
        }
    }
}

/// A caller together with the realm it is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCaller {
    /// Who is calling
    pub caller: AuthorizedCaller,
    /// The caller's realm
    pub realm: Realm,
}

impl ResolvedCaller {
    /// Realm id shorthand.
    #[must_use]
    pub fn realm_id(&self) -> RealmId {
        self.realm.id
    }

    /// Whether this caller issued `code`. Matches on identity, never on
    /// names or emails.
    #[must_use]
    pub fn issued(&self, code: &VerificationCode) -> bool {
        match &self.caller {
            AuthorizedCaller::App(app) => code.issuing_app == Some(app.id),
            AuthorizedCaller::User(session) => code.issuing_user == Some(session.user.id),
        }
    }

    /// Whether this caller may act on every code of its realm.
    #[must_use]
    pub fn can_admin(&self) -> bool {
        match &self.caller {
            AuthorizedCaller::App(app) => {
                app.key_type == ApiKeyType::Admin && app.realm_id == Some(self.realm.id)
            }
            AuthorizedCaller::User(session) => {
                session.user.system_admin || self.realm.is_admin(session.user.id)
            }
        }
    }

    /// See [`AuthorizedCaller::label`].
    #[must_use]
    pub fn label(&self) -> String {
        self.caller.label()
    }
}

/// Resolves request credentials to a [`ResolvedCaller`].
pub struct AuthorizationResolver {
    realms: Arc<dyn RealmStore>,
    digest: KeyedDigest,
    api_key_header: String,
}

impl AuthorizationResolver {
    /// Create a resolver over a (usually cache-backed) realm store.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the API-key secret cannot be resolved.
    pub fn new(realms: Arc<dyn RealmStore>, config: &AuthConfig) -> crate::Result<Self> {
        Ok(Self {
            realms,
            digest: KeyedDigest::new(resolve_secret(&config.api_key_hmac_key)?),
            api_key_header: config.api_key_header.clone(),
        })
    }

    /// Digest under which an API key is stored.
    #[must_use]
    pub fn api_key_digest(&self, api_key: &str) -> String {
        self.digest.hex(api_key)
    }

    /// Resolve the caller of a request.
    ///
    /// # Errors
    ///
    /// - `Unauthorized` for missing, unknown or wrong-type credentials and
    ///   for API keys without an owning realm
    /// - `BadRequest("missing realm")` for sessions without a realm
    /// - `Internal` / `Timeout` when the store fails or the deadline passes
    pub async fn resolve(
        &self,
        headers: &HeaderMap,
        deadline: &Deadline,
        audience: Audience,
    ) -> Result<ResolvedCaller, ApiError> {
        if let Some(api_key) = header_value(headers, &self.api_key_header) {
            return self.resolve_app(api_key, deadline, audience).await;
        }

        let session_id = header_value(headers, header::AUTHORIZATION.as_str()).and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        });
        if let Some(session_id) = session_id {
            if audience == Audience::Device {
                warn!("Session credential presented to a device endpoint");
                return Err(ApiError::Unauthorized(None));
            }
            return self.resolve_session(session_id, deadline).await;
        }

        warn!("Request without credentials");
        Err(ApiError::Unauthorized(None))
    }

    async fn resolve_app(
        &self,
        api_key: &str,
        deadline: &Deadline,
        audience: Audience,
    ) -> Result<ResolvedCaller, ApiError> {
        let digest = self.digest.hex(api_key);
        let Some(app) = deadline
            .call("find_app", self.realms.find_app_by_digest(&digest))
            .await?
        else {
            warn!("Unknown API key");
            return Err(ApiError::Unauthorized(None));
        };

        let expected = match audience {
            Audience::Device => ApiKeyType::Device,
            Audience::Admin => ApiKeyType::Admin,
        };
        if app.key_type != expected {
            warn!(app_id = %app.id, key_type = ?app.key_type, "API key type not allowed here");
            return Err(ApiError::Unauthorized(None));
        }

        let caller = AuthorizedCaller::App(app);
        let Some(realm_id) = caller.realm_id() else {
            warn!(caller = %caller.label(), "API key has no owning realm");
            return Err(ApiError::Unauthorized(None));
        };
        let Some(realm) = deadline
            .call("find_realm", self.realms.find_realm(realm_id))
            .await?
        else {
            warn!(caller = %caller.label(), realm_id = %realm_id, "API key realm does not exist");
            return Err(ApiError::Unauthorized(None));
        };

        debug!(caller = %caller.label(), realm_id = %realm.id, "Resolved API caller");
        Ok(ResolvedCaller { caller, realm })
    }

    async fn resolve_session(
        &self,
        session_id: &str,
        deadline: &Deadline,
    ) -> Result<ResolvedCaller, ApiError> {
        let Some(session) = deadline
            .call("find_session", self.realms.find_session(session_id))
            .await?
        else {
            warn!("Unknown session");
            return Err(ApiError::Unauthorized(None));
        };
        if session.is_expired_at(Utc::now()) {
            warn!(user_id = %session.user_id, "Expired session");
            return Err(ApiError::Unauthorized(None));
        }

        let Some(user) = deadline
            .call("find_user", self.realms.find_user(session.user_id))
            .await?
        else {
            warn!(user_id = %session.user_id, "Session user does not exist");
            return Err(ApiError::Unauthorized(None));
        };

        let caller = AuthorizedCaller::User(SessionUser {
            user,
            realm_id: session.realm_id,
        });
        let realm = match caller.realm_id() {
            Some(id) => deadline.call("find_realm", self.realms.find_realm(id)).await?,
            None => None,
        };
        let Some(realm) = realm else {
            return Err(ApiError::BadRequest {
                code: None,
                message: "missing realm".to_string(),
            });
        };

        debug!(caller = %caller.label(), realm_id = %realm.id, "Resolved session caller");
        Ok(ResolvedCaller { caller, realm })
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
