//! Shared harness for the HTTP-level tests
//!
//! Two realms, each with a device key and an admin key, plus users and
//! sessions covering issuer / colleague / realm admin / other realm.

#![allow(dead_code)]

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use figment::{
    Figment,
    providers::{Format, Yaml},
};
use serde_json::Value;
use tower::ServiceExt;

use verification_gateway::config::Config;
use verification_gateway::gateway::Gateway;

pub const CONFIG: &str = r"
auth:
  api_key_hmac_key: api-key-hmac-secret-0123456789abcdef
rate_limit:
  tokens: 10000
  hmac_key: rate-limit-hmac-secret-0123456789abcd
cache:
  hmac_key: cache-hmac-secret-0123456789abcdefgh
chaff:
  default_latency: 1ms
token_signing:
  issuer: verification-server
  audience: verification-tokens
  keys:
    backend: hmac
    active: v1
    secrets:
      v1: token-signing-secret-0123456789abcdef
certificate_signing:
  issuer: verification-server
  audience: diagnosis-certificates
  keys:
    backend: hmac
    active: v1
    secrets:
      v1: certificate-signing-secret-0123456789
realms:
  - id: 1
    name: Realm One
    admins: [12]
    apps:
      - id: 100
        name: device-one
        key_type: device
        api_key: device-1
      - id: 101
        name: admin-one
        key_type: admin
        api_key: admin-1
  - id: 2
    name: Realm Two
    admins: [20]
    apps:
      - id: 200
        name: device-two
        key_type: device
        api_key: device-2
      - id: 201
        name: admin-two
        key_type: admin
        api_key: admin-2
users:
  - id: 10
    email: issuer@one.example
  - id: 11
    email: colleague@one.example
  - id: 12
    email: admin@one.example
  - id: 20
    email: admin@two.example
sessions:
  - id: s-issuer
    user_id: 10
    realm_id: 1
  - id: s-colleague
    user_id: 11
    realm_id: 1
  - id: s-admin
    user_id: 12
    realm_id: 1
  - id: s-realm2
    user_id: 20
    realm_id: 2
  - id: s-norealm
    user_id: 11
";

/// Credentials a request is sent with.
#[derive(Debug, Clone, Copy)]
pub enum Auth {
    ApiKey(&'static str),
    Session(&'static str),
    None,
}

pub fn config() -> Config {
    Config::from_figment(&Figment::new().merge(Yaml::string(CONFIG))).unwrap()
}

pub struct Harness {
    pub gateway: Gateway,
    pub router: Router,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    pub fn with(adjust: impl FnOnce(&mut Config)) -> Self {
        let mut config = config();
        adjust(&mut config);
        let gateway = Gateway::new(config).unwrap();
        let router = gateway.router();
        Self { gateway, router }
    }

    pub async fn send(
        &self,
        path: &str,
        auth: Auth,
        extra: &[(&str, &str)],
        body: impl Into<Body>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        builder = match auth {
            Auth::ApiKey(key) => builder.header("X-API-Key", key),
            Auth::Session(id) => builder.header("Authorization", format!("Bearer {id}")),
            Auth::None => builder,
        };
        for (name, value) in extra {
            builder = builder.header(*name, *value);
        }

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body.into()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    pub async fn post(&self, path: &str, auth: Auth, body: Value) -> (StatusCode, Value) {
        self.send(path, auth, &[], body.to_string()).await
    }

    /// Issue a code as `auth`; returns the issue response.
    pub async fn issue(&self, auth: Auth, test_type: &str) -> Value {
        let (status, body) = self
            .post("/api/issue", auth, serde_json::json!({ "testType": test_type }))
            .await;
        assert_eq!(status, StatusCode::OK, "issue failed: {body}");
        body
    }
}

/// `errorCode` of an error envelope.
pub fn error_code(body: &Value) -> &str {
    body["errorCode"].as_str().unwrap_or_default()
}
