//! Authorization stage
//!
//! Resolves API key or session credentials once per request and stores the
//! [`ResolvedCaller`](crate::authorization::ResolvedCaller) in the request
//! context. Failures answer the request with the resolver's error.

use std::sync::Arc;

use async_trait::async_trait;
use axum::response::IntoResponse;
use tracing::debug;

use super::pipeline::{RequestContext, RequestStage, StageOutcome};
use crate::authorization::{Audience, AuthorizationResolver};

/// Pipeline stage wrapping [`AuthorizationResolver`].
pub struct AuthStage {
    resolver: Arc<AuthorizationResolver>,
    audience: Audience,
}

impl AuthStage {
    /// Create a stage accepting the credentials of `audience`.
    #[must_use]
    pub fn new(resolver: Arc<AuthorizationResolver>, audience: Audience) -> Self {
        Self { resolver, audience }
    }
}

#[async_trait]
impl RequestStage for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn before(&self, ctx: &mut RequestContext) -> StageOutcome {
        match self
            .resolver
            .resolve(&ctx.headers, &ctx.deadline, self.audience)
            .await
        {
            Ok(caller) => {
                debug!(endpoint = ctx.endpoint, caller = %caller.label(), "Caller resolved");
                ctx.caller = Some(caller);
                StageOutcome::Continue
            }
            Err(e) => StageOutcome::Respond(e.into_response()),
        }
    }
}
