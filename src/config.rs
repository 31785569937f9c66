//! Configuration management

use std::{
    collections::{BTreeMap, BTreeSet},
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use jsonwebtoken::Algorithm;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::store::{ApiKeyType, RealmSettings};
use crate::{Error, Result};

/// Environment variable prefix for overrides (`VERIFY_GATEWAY_SERVER__PORT=9000`)
pub const ENV_PREFIX: &str = "VERIFY_GATEWAY_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// API key / session authentication
    pub auth: AuthConfig,
    /// Rate limiting
    pub rate_limit: RateLimitConfig,
    /// Realm / API-app lookup cache
    pub cache: CacheConfig,
    /// Chaff (decoy traffic) handling
    pub chaff: ChaffConfig,
    /// Keys and claims for verification tokens
    pub token_signing: SigningConfig,
    /// Keys and claims for certificates
    pub certificate_signing: SigningConfig,
    /// Code issuance and retention
    pub verification: VerificationConfig,
    /// Realms (with their API apps) loaded into the store at startup
    pub realms: Vec<RealmSeed>,
    /// Users loaded into the store at startup
    pub users: Vec<UserSeed>,
    /// Sessions loaded into the store at startup
    pub sessions: Vec<SessionSeed>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        Self::from_figment(&figment)
    }

    /// Extract from an already-assembled figment, then resolve env files and
    /// `${VAR}` references.
    ///
    /// # Errors
    ///
    /// Returns an error if extraction fails.
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // env files first so that expansion can see their variables
        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in secret-bearing values
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for value in [
            &mut self.auth.api_key_hmac_key,
            &mut self.rate_limit.hmac_key,
            &mut self.cache.hmac_key,
        ] {
            *value = expand_string(&re, value);
        }

        for signing in [&mut self.token_signing, &mut self.certificate_signing] {
            match &mut signing.keys {
                KeyManagerConfig::Hmac { secrets, .. } => {
                    for secret in secrets.values_mut() {
                        *secret = expand_string(&re, secret);
                    }
                }
                KeyManagerConfig::Pem { keys, .. } => {
                    for pair in keys.values_mut() {
                        pair.public_key = expand_path(&re, &pair.public_key);
                        if let Some(private) = pair.private_key.as_mut() {
                            *private = expand_path(&re, private);
                        }
                    }
                }
            }
        }

        for app in self.realms.iter_mut().flat_map(|r| r.apps.iter_mut()) {
            app.api_key = expand_string(&re, &app.api_key);
        }
        for session in &mut self.sessions {
            session.id = expand_string(&re, &session.id);
        }
        Ok(())
    }

    /// Check cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));

        if resolve_secret(&self.auth.api_key_hmac_key)?.is_empty() {
            return fail("auth.api_key_hmac_key must be set".into());
        }
        if resolve_secret(&self.cache.hmac_key)?.is_empty() {
            return fail("cache.hmac_key must be set".into());
        }
        if self.rate_limit.enabled {
            if self.rate_limit.tokens == 0 || self.rate_limit.interval.is_zero() {
                return fail("rate_limit.tokens and rate_limit.interval must be non-zero".into());
            }
            if resolve_secret(&self.rate_limit.hmac_key)?.is_empty() {
                return fail("rate_limit.hmac_key must be set".into());
            }
        }
        if !(0.0..=1.0).contains(&self.chaff.sample_rate) {
            return fail("chaff.sample_rate must be between 0 and 1".into());
        }
        if self.chaff.history == 0 {
            return fail("chaff.history must be non-zero".into());
        }
        for (name, signing) in [
            ("token_signing", &self.token_signing),
            ("certificate_signing", &self.certificate_signing),
        ] {
            if signing.issuer.is_empty() || signing.audience.is_empty() {
                return fail(format!("{name}.issuer and {name}.audience must be set"));
            }
            if signing.duration.is_zero() {
                return fail(format!("{name}.duration must be non-zero"));
            }
            if let KeyManagerConfig::Hmac { secrets, .. } = &signing.keys {
                for (version, raw) in secrets {
                    resolve_secret(raw).map_err(|e| {
                        Error::Config(format!("{name}.keys.secrets.{version}: {e}"))
                    })?;
                }
            }
        }

        let mut realm_ids = BTreeSet::new();
        let mut app_ids = BTreeSet::new();
        for realm in &self.realms {
            if !realm_ids.insert(realm.id) {
                return fail(format!("duplicate realm id {}", realm.id));
            }
            let s = &realm.settings;
            if s.allowed_test_types.is_empty() {
                return fail(format!("realm {} allows no test types", realm.id));
            }
            if !(MIN_CODE_LENGTH..=MAX_CODE_LENGTH).contains(&s.code_length)
                || !(MIN_CODE_LENGTH..=MAX_CODE_LENGTH).contains(&s.long_code_length)
            {
                return fail(format!(
                    "realm {} code lengths must be between {MIN_CODE_LENGTH} and {MAX_CODE_LENGTH}",
                    realm.id
                ));
            }
            if s.code_duration_secs == 0 || s.long_code_duration_secs < s.code_duration_secs {
                return fail(format!(
                    "realm {}: long code must live at least as long as the short code",
                    realm.id
                ));
            }
            for app in &realm.apps {
                if !app_ids.insert(app.id) {
                    return fail(format!("duplicate app id {}", app.id));
                }
                if resolve_secret(&app.api_key)?.is_empty() {
                    return fail(format!("app {} has no api_key", app.id));
                }
            }
        }

        let user_ids: BTreeSet<u64> = self.users.iter().map(|u| u.id).collect();
        if user_ids.len() != self.users.len() {
            return fail("duplicate user id".into());
        }
        for session in &self.sessions {
            if resolve_secret(&session.id)?.is_empty() {
                return fail(format!("session of user {} has no id", session.user_id));
            }
            if !user_ids.contains(&session.user_id) {
                return fail(format!("session references unknown user {}", session.user_id));
            }
            if let Some(realm) = session.realm_id {
                if !realm_ids.contains(&realm) {
                    return fail(format!("session references unknown realm {realm}"));
                }
            }
        }

        Ok(())
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

fn expand_path(re: &Regex, path: &Path) -> PathBuf {
    PathBuf::from(expand_string(re, &path.to_string_lossy()))
}

/// Resolve a secret value: `env:VAR_NAME` reads the variable, anything else
/// is taken literally.
///
/// # Errors
///
/// Returns [`Error::Config`] if the referenced variable is not set.
pub fn resolve_secret(raw: &str) -> Result<String> {
    match raw.strip_prefix("env:") {
        Some(var_name) => env::var(var_name).map_err(|_| {
            Error::Config(format!("environment variable {var_name} is not set"))
        }),
        None => Ok(raw.to_string()),
    }
}

/// Shortest allowed code length
pub const MIN_CODE_LENGTH: usize = 6;
/// Longest allowed code length
pub const MAX_CODE_LENGTH: usize = 32;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Deadline for a whole request, store and signing calls included
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 64 * 1024,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Header carrying the API key
    pub api_key_header: String,
    /// Secret used to digest API keys before lookup (supports `env:VAR_NAME`)
    pub api_key_hmac_key: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key_header: "X-API-Key".to_string(),
            api_key_hmac_key: String::new(),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Requests allowed per interval (bucket size)
    pub tokens: u32,
    /// Refill interval for the whole bucket
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Secret salting limiter keys (supports `env:VAR_NAME`)
    pub hmac_key: String,
    /// Admit requests when the limiter store fails
    pub allow_on_error: bool,
    /// Prefix for limiter keys
    pub key_prefix: String,
    /// How often idle keys are pruned
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tokens: 60,
            interval: Duration::from_secs(60),
            hmac_key: String::new(),
            allow_on_error: false,
            key_prefix: "apiserver:ratelimit:".to_string(),
            prune_interval: Duration::from_secs(60),
        }
    }
}

/// Lookup cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long realm and API-app records are memoized
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Secret hashing cache keys (supports `env:VAR_NAME`)
    pub hmac_key: String,
    /// How often expired entries are evicted
    #[serde(with = "humantime_serde")]
    pub eviction_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            hmac_key: String::new(),
            eviction_interval: Duration::from_secs(60),
        }
    }
}

/// Chaff handling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaffConfig {
    /// Answer chaff requests with decoys
    pub enabled: bool,
    /// Header marking a request as chaff
    pub header: String,
    /// Real samples kept per endpoint
    pub history: usize,
    /// Fraction of real requests recorded (0.0-1.0)
    pub sample_rate: f64,
    /// Decoy latency before any sample exists
    #[serde(with = "humantime_serde")]
    pub default_latency: Duration,
    /// Decoy body size before any sample exists
    pub default_size: usize,
}

impl Default for ChaffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            header: "X-Chaff".to_string(),
            history: 128,
            sample_rate: 1.0,
            default_latency: Duration::from_millis(100),
            default_size: 256,
        }
    }
}

/// Signing configuration for tokens or certificates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Key manager backend and key material
    pub keys: KeyManagerConfig,
    /// `iss` claim
    pub issuer: String,
    /// `aud` claim
    pub audience: String,
    /// Validity of each signed artifact
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            keys: KeyManagerConfig::default(),
            issuer: "diagnosis-verification".to_string(),
            audience: "diagnosis-verification".to_string(),
            duration: Duration::from_secs(30 * 60),
        }
    }
}

/// Key manager selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum KeyManagerConfig {
    /// Versioned shared secrets, HS256
    Hmac {
        /// Version used for signing
        active: String,
        /// Secret per version (supports `env:VAR_NAME`)
        #[serde(default)]
        secrets: BTreeMap<String, String>,
    },
    /// Versioned PEM key pairs on disk
    Pem {
        /// Version used for signing
        active: String,
        /// Signature algorithm
        algorithm: PemAlgorithm,
        /// Key files per version
        #[serde(default)]
        keys: BTreeMap<String, PemKeyPaths>,
    },
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self::Hmac {
            active: "v1".to_string(),
            secrets: BTreeMap::new(),
        }
    }
}

/// Asymmetric algorithms supported by the PEM backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PemAlgorithm {
    /// ECDSA P-256 / SHA-256
    Es256,
    /// Ed25519
    #[serde(alias = "ed25519")]
    EdDsa,
}

impl PemAlgorithm {
    /// The JWT algorithm this maps to.
    #[must_use]
    pub fn algorithm(self) -> Algorithm {
        match self {
            Self::Es256 => Algorithm::ES256,
            Self::EdDsa => Algorithm::EdDSA,
        }
    }
}

/// Key files for one version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PemKeyPaths {
    /// PKCS#8 private key; absent for retired versions
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    /// Public key
    pub public_key: PathBuf,
}

/// Code issuance and retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Oldest accepted symptom date, in days before today
    pub max_symptom_age_days: u32,
    /// Attempts to generate a collision-free code pair
    pub collision_retries: usize,
    /// How long dead codes and used tokens are kept before purging
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// How often the purge runs
    #[serde(with = "humantime_serde")]
    pub purge_interval: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_symptom_age_days: 14,
            collision_retries: 6,
            retention: Duration::from_secs(24 * 60 * 60),
            purge_interval: Duration::from_secs(15 * 60),
        }
    }
}

/// A realm loaded at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealmSeed {
    /// Realm id
    pub id: u64,
    /// Display name
    pub name: String,
    /// Admin user ids
    #[serde(default)]
    pub admins: Vec<u64>,
    /// Issuance settings
    #[serde(default)]
    pub settings: RealmSettings,
    /// API apps owned by this realm
    #[serde(default)]
    pub apps: Vec<AppSeed>,
}

/// An API app loaded at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSeed {
    /// App id
    pub id: u64,
    /// Display name
    pub name: String,
    /// Key capability
    pub key_type: ApiKeyType,
    /// Raw API key (supports `env:VAR_NAME`); only its digest is stored
    pub api_key: String,
}

/// A user loaded at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSeed {
    /// User id
    pub id: u64,
    /// Email address
    pub email: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// May administer every realm
    #[serde(default)]
    pub system_admin: bool,
}

/// A session loaded at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSeed {
    /// Session id presented as a bearer credential (supports `env:VAR_NAME`)
    pub id: String,
    /// Session owner
    pub user_id: u64,
    /// Selected realm
    #[serde(default)]
    pub realm_id: Option<u64>,
    /// Lifetime from startup
    #[serde(with = "humantime_serde", default = "default_session_ttl")]
    pub ttl: Duration,
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(12 * 60 * 60)
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() > 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms", "2h")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }

}
