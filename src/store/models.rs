//! Entities owned by the stores.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::digest::constant_time_eq;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Realm (tenant) identifier
    RealmId
);
id_type!(
    /// Human user identifier
    UserId
);
id_type!(
    /// API application identifier
    AppId
);

/// Diagnosis test type carried by a code, its token and its certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    /// Confirmed positive test
    Confirmed,
    /// Clinical diagnosis without a test
    Likely,
    /// Negative test
    Negative,
}

impl TestType {
    /// All known test types, in severity order.
    pub const ALL: [Self; 3] = [Self::Confirmed, Self::Likely, Self::Negative];

    /// Wire name of the test type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Likely => "likely",
            Self::Negative => "negative",
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "confirmed" => Ok(Self::Confirmed),
            "likely" => Ok(Self::Likely),
            "negative" => Ok(Self::Negative),
            other => Err(format!("unknown test type '{other}'")),
        }
    }
}

/// Per-realm issuance settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmSettings {
    /// Test types this realm may issue codes for
    pub allowed_test_types: Vec<TestType>,
    /// Digits in the short code
    pub code_length: usize,
    /// Characters in the long code
    pub long_code_length: usize,
    /// Lifetime of the short code in seconds
    pub code_duration_secs: u64,
    /// Lifetime of the long code in seconds
    pub long_code_duration_secs: u64,
    /// Whether issuing a code requires a symptom date
    pub require_date: bool,
}

impl Default for RealmSettings {
    fn default() -> Self {
        Self {
            allowed_test_types: TestType::ALL.to_vec(),
            code_length: 8,
            long_code_length: 16,
            code_duration_secs: 15 * 60,
            long_code_duration_secs: 24 * 60 * 60,
            require_date: false,
        }
    }
}

/// Tenant boundary scoping codes, API keys and admin rights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Realm {
    /// Realm id
    pub id: RealmId,
    /// Display name
    pub name: String,
    /// Users allowed to administer this realm
    pub admins: BTreeSet<UserId>,
    /// Issuance settings
    pub settings: RealmSettings,
}

impl Realm {
    /// Whether `user` is a realm administrator.
    #[must_use]
    pub fn is_admin(&self, user: UserId) -> bool {
        self.admins.contains(&user)
    }
}

/// What an API key is allowed to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyType {
    /// Device-facing key: verify and certificate exchange
    Device,
    /// Administrative key: issue, status and expiry of codes
    Admin,
}

/// An application holding an API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiApp {
    /// App id
    pub id: AppId,
    /// Display name
    pub name: String,
    /// Owning realm; an app without one cannot act
    pub realm_id: Option<RealmId>,
    /// Key capability
    pub key_type: ApiKeyType,
    /// HMAC digest of the API key (the raw key is never stored)
    #[serde(skip_serializing)]
    pub key_digest: String,
}

/// A human user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id
    pub id: UserId,
    /// Email address
    pub email: String,
    /// Display name
    pub name: String,
    /// System administrators may administer every realm
    pub system_admin: bool,
}

/// A logged-in session; issued by the admin console, read here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Opaque session id
    pub id: String,
    /// Session owner
    pub user_id: UserId,
    /// Realm currently selected in the session, if any
    pub realm_id: Option<RealmId>,
    /// Session expiry
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Whether the session is past its expiry.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A one-time verification code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCode {
    /// Opaque identifier used by status and expiry calls
    pub id: Uuid,
    /// Short numeric code, read out to the patient
    pub code: String,
    /// Long alphanumeric code, delivered by link
    pub long_code: String,
    /// Owning realm
    pub realm_id: RealmId,
    /// Issuing user, when issued from a session
    pub issuing_user: Option<UserId>,
    /// Issuing app, when issued with an API key
    pub issuing_app: Option<AppId>,
    /// Set exactly once on successful redemption
    pub claimed: bool,
    /// Diagnosis test type
    pub test_type: TestType,
    /// Symptom onset (or test) date
    pub symptom_date: Option<NaiveDate>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry of the short code
    pub expires_at: DateTime<Utc>,
    /// Expiry of the long code
    pub long_expires_at: DateTime<Utc>,
    /// Set when the code was revoked by its issuer or an admin
    pub revoked_at: Option<DateTime<Utc>>,
}

impl VerificationCode {
    /// A code is expired once both redemption windows have passed or it was revoked.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_some() || (now > self.expires_at && now > self.long_expires_at)
    }

    /// Whether `candidate` redeems this code at `now`.
    ///
    /// The short code honours `expires_at`, the long code `long_expires_at`.
    #[must_use]
    pub fn redeemable_with(&self, candidate: &str, now: DateTime<Utc>) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        if constant_time_eq(candidate, &self.code) {
            now <= self.expires_at
        } else if constant_time_eq(candidate, &self.long_code) {
            now <= self.long_expires_at
        } else {
            false
        }
    }
}

/// The subject bound into a token: what the certificate will attest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSubject {
    /// Diagnosis test type
    pub test_type: TestType,
    /// Symptom onset date
    pub symptom_date: Option<NaiveDate>,
}

impl fmt::Display for TokenSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.symptom_date {
            Some(date) => write!(f, "{}.{}", self.test_type, date.format("%Y-%m-%d")),
            None => write!(f, "{}.", self.test_type),
        }
    }
}

impl FromStr for TokenSubject {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (test_type, date) = s
            .split_once('.')
            .ok_or_else(|| format!("malformed token subject '{s}'"))?;
        let test_type = test_type.parse()?;
        let symptom_date = if date.is_empty() {
            None
        } else {
            Some(
                NaiveDate::parse_from_str(date, "%Y-%m-%d")
                    .map_err(|e| format!("malformed symptom date '{date}': {e}"))?,
            )
        };
        Ok(Self {
            test_type,
            symptom_date,
        })
    }
}

/// Consumption record for a token issued by code redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Token id (`jti` claim)
    pub token_id: String,
    /// Realm the token was issued in
    pub realm_id: RealmId,
    /// Code the token was redeemed from
    pub code_id: Uuid,
    /// Subject string bound into the token
    pub subject: String,
    /// Token expiry
    pub expires_at: DateTime<Utc>,
    /// Set exactly once when exchanged for a certificate
    pub used: bool,
}
