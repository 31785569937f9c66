//! HTTP router and handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::{Request, State},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::debug;

use super::pipeline::{Pipeline, RequestContext};
use crate::api::{
    self, ApiError, CertificateRequest, CertificateResponse, CheckCodeStatusResponse,
    CodeIdRequest, ErrorCode, ExpireCodeResponse, IssueCodeRequest, IssueCodeResponse,
    VerifyRequest, VerifyResponse,
};
use crate::certificate::CertificateIssuer;
use crate::exchange::CodeExchangeEngine;
use crate::store::TestType;

/// Stage lists, one per endpoint.
#[derive(Debug, Clone)]
pub struct Pipelines {
    /// `/api/verify`
    pub verify: Pipeline,
    /// `/api/certificate`
    pub certificate: Pipeline,
    /// `/api/checkcodestatus`
    pub check_status: Pipeline,
    /// `/api/issue`
    pub issue: Pipeline,
    /// `/api/expirecode`
    pub expire: Pipeline,
}

/// Shared application state
pub struct AppState {
    /// Code status, issuance, redemption and revocation
    pub exchange: Arc<CodeExchangeEngine>,
    /// Token to certificate exchange
    pub certificates: Arc<CertificateIssuer>,
    /// Per-endpoint stages
    pub pipelines: Pipelines,
    /// Budget of each request
    pub request_timeout: Duration,
    /// Largest accepted request body
    pub max_body_size: usize,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/verify", post(verify_handler))
        .route("/api/certificate", post(certificate_handler))
        .route("/api/checkcodestatus", post(check_status_handler))
        .route("/api/issue", post(issue_handler))
        .route("/api/expirecode", post(expire_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler
async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Read and parse a JSON body. Oversized and malformed bodies are both
/// `unparsable_request`.
async fn read_json<T: DeserializeOwned>(body: Body, limit: usize) -> Result<T, ApiError> {
    let bytes = to_bytes(body, limit).await.map_err(|e| {
        debug!(error = %e, "Failed to read request body");
        ApiError::bad_request(ErrorCode::UnparsableRequest, "unable to parse request body")
    })?;
    api::parse_body(&bytes)
}

/// Accept list of a verify request; empty means `confirmed` only.
fn parse_accept(raw: &[String]) -> Result<Vec<TestType>, ApiError> {
    if raw.is_empty() {
        return Ok(vec![TestType::Confirmed]);
    }
    raw.iter()
        .map(|s| {
            s.parse().map_err(|_| {
                ApiError::bad_request(ErrorCode::InvalidTestType, format!("invalid accept type '{s}'"))
            })
        })
        .collect()
}

/// POST /api/verify - redeem a code for a token
async fn verify_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let ctx = RequestContext::new("verify", &parts, state.request_timeout);
    let exchange = Arc::clone(&state.exchange);
    let limit = state.max_body_size;

    state
        .pipelines
        .verify
        .run(ctx, |caller, deadline| async move {
            let req: VerifyRequest = read_json(body, limit).await?;
            let accept = parse_accept(&req.accept_types)?;
            let redemption = exchange
                .redeem(&deadline, &caller, &req.code, &accept)
                .await?;

            Ok::<_, ApiError>(Json(VerifyResponse {
                test_type: redemption.code.test_type.to_string(),
                symptom_date: redemption
                    .code
                    .symptom_date
                    .map(|d| d.format("%Y-%m-%d").to_string()),
                token: redemption.token,
                token_expiry: redemption.token_expiry.timestamp(),
            })
            .into_response())
        })
        .await
}

/// POST /api/certificate - exchange a token for a certificate
async fn certificate_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let ctx = RequestContext::new("certificate", &parts, state.request_timeout);
    let certificates = Arc::clone(&state.certificates);
    let limit = state.max_body_size;

    state
        .pipelines
        .certificate
        .run(ctx, |caller, deadline| async move {
            let req: CertificateRequest = read_json(body, limit).await?;
            let certificate = certificates
                .issue_certificate(&deadline, &caller, &req.token, &req.report_payload)
                .await?;
            Ok::<_, ApiError>(Json(CertificateResponse { certificate }).into_response())
        })
        .await
}

/// POST /api/checkcodestatus - read-only code status
async fn check_status_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let ctx = RequestContext::new("checkcodestatus", &parts, state.request_timeout);
    let exchange = Arc::clone(&state.exchange);
    let limit = state.max_body_size;

    state
        .pipelines
        .check_status
        .run(ctx, |caller, deadline| async move {
            let req: CodeIdRequest = read_json(body, limit).await?;
            let status = exchange.check_status(&deadline, &caller, &req.uuid).await?;
            Ok::<_, ApiError>(Json(CheckCodeStatusResponse {
                claimed: status.claimed,
                expires_at_timestamp: status.expires_at.timestamp(),
                long_expires_at_timestamp: status.long_expires_at.timestamp(),
            })
            .into_response())
        })
        .await
}

/// POST /api/issue - create a verification code
async fn issue_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let ctx = RequestContext::new("issue", &parts, state.request_timeout);
    let exchange = Arc::clone(&state.exchange);
    let limit = state.max_body_size;

    state
        .pipelines
        .issue
        .run(ctx, |caller, deadline| async move {
            let req: IssueCodeRequest = read_json(body, limit).await?;
            let code = exchange
                .issue(&deadline, &caller, &req.test_type, req.symptom_date.as_deref())
                .await?;
            Ok::<_, ApiError>(Json(IssueCodeResponse {
                uuid: code.id.to_string(),
                code: code.code,
                long_code: code.long_code,
                expires_at_timestamp: code.expires_at.timestamp(),
                long_expires_at_timestamp: code.long_expires_at.timestamp(),
            })
            .into_response())
        })
        .await
}

/// POST /api/expirecode - revoke a code early
async fn expire_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let ctx = RequestContext::new("expirecode", &parts, state.request_timeout);
    let exchange = Arc::clone(&state.exchange);
    let limit = state.max_body_size;

    state
        .pipelines
        .expire
        .run(ctx, |caller, deadline| async move {
            let req: CodeIdRequest = read_json(body, limit).await?;
            let code = exchange.expire(&deadline, &caller, &req.uuid).await?;
            Ok::<_, ApiError>(Json(ExpireCodeResponse {
                expires_at_timestamp: code.expires_at.timestamp(),
                long_expires_at_timestamp: code.long_expires_at.timestamp(),
            })
            .into_response())
        })
        .await
}
