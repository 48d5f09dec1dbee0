//! Per-call-chain request context.
//!
//! Established once at the inbound boundary with [`scope`] and read
//! implicitly by the audit logger. Backed by a Tokio task-local, so
//! concurrently running chains never see each other's values. Work moved to
//! a spawned task must be wrapped in its own `scope` to keep the context.

use std::future::Future;

use serde::Serialize;
use uuid::Uuid;

tokio::task_local! {
    static REQUEST_CONTEXT: RequestContext;
}

/// Correlation data for one inbound call chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: Option<String>,
    pub endpoint: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    /// Context with a fresh random request id.
    pub fn new() -> Self {
        Self::with_request_id(Uuid::new_v4().to_string())
    }

    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Run `fut` with `ctx` as the current request context.
pub async fn scope<F>(ctx: RequestContext, fut: F) -> F::Output
where
    F: Future,
{
    REQUEST_CONTEXT.scope(ctx, fut).await
}

/// Context of the current call chain, if one was established.
pub fn current() -> Option<RequestContext> {
    REQUEST_CONTEXT.try_with(Clone::clone).ok()
}
