//! Request pipeline
//!
//! Each API endpoint runs an explicit, ordered list of [`RequestStage`]s
//! before its handler:
//!
//! ```text
//! RateLimitStage -> ChaffStage -> AuthStage -> handler
//! ```
//!
//! A stage either lets the request continue or answers it. Stages run their
//! `after` hook in reverse order, and only for requests that reached the
//! handler.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    body::HttpBody,
    extract::ConnectInfo,
    http::{HeaderMap, request::Parts},
    response::{IntoResponse, Response},
};
use tracing::{debug, error, warn};

use crate::api::ApiError;
use crate::authorization::ResolvedCaller;
use crate::chaff::ChaffTracker;
use crate::context::Deadline;
use crate::ratelimit::{RateLimitKeys, RateLimitStore};

/// Request-scoped state threaded through the stages.
#[derive(Debug)]
pub struct RequestContext {
    /// Endpoint name, for logs
    pub endpoint: &'static str,
    /// Request headers
    pub headers: HeaderMap,
    /// Socket peer, when served over TCP
    pub peer: Option<SocketAddr>,
    /// Deadline shared by every collaborator call of the request
    pub deadline: Deadline,
    /// When the request entered the pipeline
    pub started: Instant,
    /// Set by the authorization stage
    pub caller: Option<ResolvedCaller>,
}

impl RequestContext {
    /// Build a context from request parts.
    #[must_use]
    pub fn new(endpoint: &'static str, parts: &Parts, timeout: Duration) -> Self {
        Self {
            endpoint,
            headers: parts.headers.clone(),
            peer: parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
            deadline: Deadline::after(timeout),
            started: Instant::now(),
            caller: None,
        }
    }
}

/// What a stage decided.
#[derive(Debug)]
pub enum StageOutcome {
    /// Run the next stage
    Continue,
    /// Answer the request with this response
    Respond(Response),
}

/// One step of the pipeline.
#[async_trait]
pub trait RequestStage: Send + Sync + 'static {
    /// Stage name, for logs.
    fn name(&self) -> &'static str;

    /// Inspect the request before the handler runs.
    async fn before(&self, ctx: &mut RequestContext) -> StageOutcome;

    /// Observe the handler's response.
    fn after(&self, _ctx: &RequestContext, _response: &Response) {}
}

/// Ordered stages in front of one handler.
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn RequestStage>>,
}

impl Pipeline {
    /// Create a pipeline; stages run in the given order.
    #[must_use]
    pub fn new(stages: Vec<Arc<dyn RequestStage>>) -> Self {
        Self { stages }
    }

    /// Stage names, in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run the stages, then `handler` with the resolved caller.
    pub async fn run<F, Fut>(&self, mut ctx: RequestContext, handler: F) -> Response
    where
        F: FnOnce(ResolvedCaller, Deadline) -> Fut,
        Fut: Future<Output = Result<Response, ApiError>>,
    {
        for stage in &self.stages {
            if let StageOutcome::Respond(response) = stage.before(&mut ctx).await {
                debug!(
                    endpoint = ctx.endpoint,
                    stage = stage.name(),
                    status = %response.status(),
                    "Request answered by stage"
                );
                return response;
            }
        }

        let Some(caller) = ctx.caller.take() else {
            error!(endpoint = ctx.endpoint, "Pipeline finished without a caller");
            return ApiError::Internal.into_response();
        };

        let response = handler(caller, ctx.deadline)
            .await
            .unwrap_or_else(IntoResponse::into_response);

        for stage in self.stages.iter().rev() {
            stage.after(&ctx, &response);
        }
        response
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

/// Token-bucket limiting per API key (or client IP).
pub struct RateLimitStage {
    store: Arc<dyn RateLimitStore>,
    keys: Arc<RateLimitKeys>,
    allow_on_error: bool,
}

impl RateLimitStage {
    /// Create the stage. With `allow_on_error`, limiter failures let the
    /// request through instead of failing it.
    #[must_use]
    pub fn new(store: Arc<dyn RateLimitStore>, keys: Arc<RateLimitKeys>, allow_on_error: bool) -> Self {
        Self {
            store,
            keys,
            allow_on_error,
        }
    }

    fn on_failure(&self, ctx: &RequestContext, reason: &str) -> StageOutcome {
        if self.allow_on_error {
            warn!(endpoint = ctx.endpoint, reason, "Rate limiter failed, allowing request");
            StageOutcome::Continue
        } else {
            error!(endpoint = ctx.endpoint, reason, "Rate limiter failed, rejecting request");
            StageOutcome::Respond(ApiError::Internal.into_response())
        }
    }
}

#[async_trait]
impl RequestStage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn before(&self, ctx: &mut RequestContext) -> StageOutcome {
        let key = self.keys.key(&ctx.headers, ctx.peer);
        match ctx.deadline.bound(self.store.take(&key)).await {
            Ok(Ok(decision)) if decision.allowed => StageOutcome::Continue,
            Ok(Ok(decision)) => {
                debug!(endpoint = ctx.endpoint, "Rate limit exceeded");
                StageOutcome::Respond(
                    ApiError::TooManyRequests {
                        limit: decision.limit,
                        retry_after: decision.retry_after,
                    }
                    .into_response(),
                )
            }
            Ok(Err(e)) => self.on_failure(ctx, &e.to_string()),
            Err(e) => self.on_failure(ctx, &e.to_string()),
        }
    }
}

/// Answers chaff requests and records real response shapes.
pub struct ChaffStage {
    tracker: Arc<ChaffTracker>,
}

impl ChaffStage {
    /// Create the stage around one endpoint's tracker.
    #[must_use]
    pub fn new(tracker: Arc<ChaffTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl RequestStage for ChaffStage {
    fn name(&self) -> &'static str {
        "chaff"
    }

    async fn before(&self, ctx: &mut RequestContext) -> StageOutcome {
        if self.tracker.is_chaff(&ctx.headers) {
            return StageOutcome::Respond(self.tracker.respond().await);
        }
        StageOutcome::Continue
    }

    fn after(&self, ctx: &RequestContext, response: &Response) {
        let hint = response.body().size_hint();
        let size = hint.exact().unwrap_or_else(|| hint.lower());
        self.tracker.record(
            ctx.started.elapsed(),
            usize::try_from(size).unwrap_or(usize::MAX),
        );
    }
}
