//! Wire types and the error taxonomy of the HTTP API
//!
//! Every failure crossing the API boundary is one [`ApiError`] variant and
//! renders as the same envelope:
//!
//! ```json
//! {"error": "human readable message", "errorCode": "code_not_found"}
//! ```
//!
//! Internal details (store, cache and signing errors) are logged where they
//! happen and never copied into the message.

use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::context::DeadlineExceeded;

/// Machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Body is not valid JSON for the endpoint
    UnparsableRequest,
    /// Code unknown, expired, revoked or already claimed
    CodeInvalid,
    /// Code expired (reported only to authorized callers)
    CodeExpired,
    /// Code does not exist for this caller
    CodeNotFound,
    /// Caller neither issued the code nor administers the realm
    CodeUserUnauthorized,
    /// Code's test type is outside the caller's accept list
    UnsupportedTestType,
    /// Test type unknown or not allowed in the realm
    InvalidTestType,
    /// Realm requires a symptom date
    MissingDate,
    /// Symptom date malformed or out of range
    InvalidDate,
    /// Token invalid, expired or already used
    TokenInvalid,
    /// Report payload is not a base64 HMAC
    HmacInvalid,
    /// Rate limit exceeded
    RateLimited,
    /// Anything internal
    InternalServerError,
}

impl ErrorCode {
    /// Wire representation
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnparsableRequest => "unparsable_request",
            Self::CodeInvalid => "code_invalid",
            Self::CodeExpired => "code_expired",
            Self::CodeNotFound => "code_not_found",
            Self::CodeUserUnauthorized => "code_user_unauthorized",
            Self::UnsupportedTestType => "unsupported_test_type",
            Self::InvalidTestType => "invalid_test_type",
            Self::MissingDate => "missing_date",
            Self::InvalidDate => "invalid_date",
            Self::TokenInvalid => "token_invalid",
            Self::HmacInvalid => "hmac_invalid",
            Self::RateLimited => "rate_limited",
            Self::InternalServerError => "internal_server_error",
        }
    }
}

/// Request-level failures, one per response class.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// Malformed input or missing realm; message surfaced verbatim
    #[error("{message}")]
    BadRequest {
        /// Error code, if a specific one applies
        code: Option<ErrorCode>,
        /// Message returned to the caller
        message: String,
    },

    /// Identity or realm mismatch; detail is logged, message is generic
    #[error("unauthorized")]
    Unauthorized(Option<ErrorCode>),

    /// Code absent, expired, or in another realm
    #[error("{message}")]
    NotFound {
        /// `code_not_found` or `code_expired`
        code: ErrorCode,
        /// Message returned to the caller
        message: &'static str,
    },

    /// Code cannot be redeemed, whatever the reason
    #[error("verification code invalid or already used")]
    InvalidCode,

    /// Code's test type is not in the accept list
    #[error("verification code has unsupported test type")]
    UnsupportedTestType,

    /// Token cannot be exchanged, whatever the reason
    #[error("verification token invalid or already used")]
    InvalidToken,

    /// Limiter exceeded
    #[error("rate limit exceeded")]
    TooManyRequests {
        /// Bucket size
        limit: u32,
        /// Time until a token frees up
        retry_after: Option<Duration>,
    },

    /// Storage or signing failure
    #[error("internal error, please try again")]
    Internal,

    /// The request ran past its deadline
    #[error("request timed out, please try again")]
    Timeout,
}

impl ApiError {
    /// `400` with a specific code.
    pub fn bad_request(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code: Some(code),
            message: message.into(),
        }
    }

    /// `404 code_not_found`.
    #[must_use]
    pub fn code_not_found(message: &'static str) -> Self {
        Self::NotFound {
            code: ErrorCode::CodeNotFound,
            message,
        }
    }

    /// `404 code_expired`.
    #[must_use]
    pub fn code_expired() -> Self {
        Self::NotFound {
            code: ErrorCode::CodeExpired,
            message: "code has expired",
        }
    }

    /// HTTP status for this error
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } | Self::InvalidCode | Self::InvalidToken => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::UnsupportedTestType => StatusCode::PRECONDITION_FAILED,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal | Self::Timeout => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code, if any
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::BadRequest { code, .. } => *code,
            Self::Unauthorized(code) => *code,
            Self::NotFound { code, .. } => Some(*code),
            Self::InvalidCode => Some(ErrorCode::CodeInvalid),
            Self::UnsupportedTestType => Some(ErrorCode::UnsupportedTestType),
            Self::InvalidToken => Some(ErrorCode::TokenInvalid),
            Self::TooManyRequests { .. } => Some(ErrorCode::RateLimited),
            Self::Internal | Self::Timeout => Some(ErrorCode::InternalServerError),
        }
    }
}

impl From<DeadlineExceeded> for ApiError {
    fn from(_: DeadlineExceeded) -> Self {
        Self::Timeout
    }
}

/// Uniform error body
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    /// Human-readable message
    pub error: String,
    /// Machine-readable code (empty when none applies)
    #[serde(rename = "errorCode")]
    pub error_code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorEnvelope {
            error: self.to_string(),
            error_code: self.code().map(ErrorCode::as_str).unwrap_or_default().to_string(),
        };
        let mut response = (status, Json(body)).into_response();

        if let Self::TooManyRequests { limit, retry_after } = self {
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
            let secs = retry_after.map_or(1, |d| d.as_secs().max(1));
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Parse a JSON request body; failures map to `400 unparsable_request`.
pub fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!(error = %e, "Unparsable request body");
        ApiError::bad_request(ErrorCode::UnparsableRequest, "unable to parse request body")
    })
}

/// `POST /api/verify`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerifyRequest {
    /// Short or long verification code
    pub code: String,
    /// Test types the device can handle; empty means `confirmed` only
    #[serde(default, rename = "accept")]
    pub accept_types: Vec<String>,
}

/// Response to `POST /api/verify`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerifyResponse {
    /// Test type of the redeemed code
    #[serde(rename = "testtype")]
    pub test_type: String,
    /// Symptom date (`YYYY-MM-DD`), when known
    #[serde(rename = "symptomDate", skip_serializing_if = "Option::is_none", default)]
    pub symptom_date: Option<String>,
    /// Signed verification token
    pub token: String,
    /// Token expiry, unix seconds
    pub token_expiry: i64,
}

/// `POST /api/certificate`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertificateRequest {
    /// Token from `/api/verify`
    pub token: String,
    /// Base64 HMAC over the diagnosis keys
    #[serde(alias = "ekeyhmac")]
    pub report_payload: String,
}

/// Response to `POST /api/certificate`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertificateResponse {
    /// Signed certificate
    pub certificate: String,
}

/// `POST /api/checkcodestatus` and `POST /api/expirecode`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CodeIdRequest {
    /// Code identifier returned at issuance
    pub uuid: String,
}

/// Response to `POST /api/checkcodestatus`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CheckCodeStatusResponse {
    /// Whether the code has been redeemed
    pub claimed: bool,
    /// Short-code expiry, unix seconds
    #[serde(rename = "expiresAtTimestamp")]
    pub expires_at_timestamp: i64,
    /// Long-code expiry, unix seconds
    #[serde(rename = "longExpiresAtTimestamp")]
    pub long_expires_at_timestamp: i64,
}

/// `POST /api/issue`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IssueCodeRequest {
    /// `confirmed`, `likely` or `negative`
    #[serde(rename = "testType")]
    pub test_type: String,
    /// Symptom onset date, `YYYY-MM-DD`
    #[serde(rename = "symptomDate", default)]
    pub symptom_date: Option<String>,
}

/// Response to `POST /api/issue`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IssueCodeResponse {
    /// Code identifier
    pub uuid: String,
    /// Short numeric code
    pub code: String,
    /// Long alphanumeric code
    #[serde(rename = "longCode")]
    pub long_code: String,
    /// Short-code expiry, unix seconds
    #[serde(rename = "expiresAtTimestamp")]
    pub expires_at_timestamp: i64,
    /// Long-code expiry, unix seconds
    #[serde(rename = "longExpiresAtTimestamp")]
    pub long_expires_at_timestamp: i64,
}

/// Response to `POST /api/expirecode`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExpireCodeResponse {
    /// Short-code expiry, unix seconds
    #[serde(rename = "expiresAtTimestamp")]
    pub expires_at_timestamp: i64,
    /// Long-code expiry, unix seconds
    #[serde(rename = "longExpiresAtTimestamp")]
    pub long_expires_at_timestamp: i64,
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use pretty_assertions::assert_eq;

    use super::*;

    async fn render(err: ApiError) -> (StatusCode, axum::http::HeaderMap, ErrorEnvelope) {
        let response = err.into_response();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn envelope_shape() {
        let (status, _, body) = render(ApiError::code_expired()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            body,
            ErrorEnvelope {
                error: "code has expired".into(),
                error_code: "code_expired".into(),
            }
        );
    }

    #[tokio::test]
    async fn internal_errors_are_generic() {
        let (status, _, body) = render(ApiError::Internal).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error_code, "internal_server_error");
        assert_eq!(body.error, "internal error, please try again");

        let (status, _, body) = render(ApiError::from(DeadlineExceeded)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error_code, "internal_server_error");
    }

    #[tokio::test]
    async fn rate_limit_headers() {
        let (status, headers, body) = render(ApiError::TooManyRequests {
            limit: 60,
            retry_after: Some(Duration::from_millis(2500)),
        })
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(headers["retry-after"], "2");
        assert_eq!(headers["x-ratelimit-limit"], "60");
        assert_eq!(body.error_code, "rate_limited");
    }

    #[tokio::test]
    async fn unauthorized_without_code_has_empty_error_code() {
        let (status, _, body) = render(ApiError::Unauthorized(None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.error_code, "");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::InvalidCode.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::InvalidToken.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::UnsupportedTestType.status(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            ApiError::Unauthorized(Some(ErrorCode::CodeUserUnauthorized)).code(),
            Some(ErrorCode::CodeUserUnauthorized)
        );
    }

    #[test]
    fn parse_body_rejects_garbage() {
        let err = parse_body::<VerifyRequest>(b"{not json").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::UnparsableRequest));

        let ok: VerifyRequest = parse_body(br#"{"code":"12345678"}"#).unwrap();
        assert!(ok.accept_types.is_empty());
    }

    #[test]
    fn certificate_request_accepts_legacy_field() {
        let req: CertificateRequest =
            parse_body(br#"{"token":"t","ekeyhmac":"aGVsbG8="}"#).unwrap();
        assert_eq!(req.report_payload, "aGVsbG8=");
    }
}
