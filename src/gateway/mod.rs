//! Gateway server implementation

pub mod auth;
pub mod pipeline;
mod router;
mod server;

pub use auth::AuthStage;
pub use pipeline::{ChaffStage, Pipeline, RateLimitStage, RequestContext, RequestStage, StageOutcome};
pub use router::{AppState, Pipelines, create_router};
pub use server::Gateway;
