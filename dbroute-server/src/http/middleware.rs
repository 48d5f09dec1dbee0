//! Request middleware
//!
//! - `request_context`: establishes the per-request [`RequestContext`] and
//!   echoes the request id back as `X-Request-Id`
//! - `require_primary`: rejects with 503 when production needs the primary
//!   and the router is serving from another backend

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use dbroute_core::context::{self, RequestContext};

use super::error::ApiError;
use super::server::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Headers checked, in order, for the acting user
const USER_HEADERS: [&str; 3] = ["x-user-id", "x-user", "x-actor-id"];

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Build the context for one inbound request.
pub fn context_from_request(req: &Request<Body>) -> RequestContext {
    let headers = req.headers();
    let mut ctx = match header(headers, REQUEST_ID_HEADER) {
        Some(id) => RequestContext::with_request_id(id),
        None => RequestContext::new(),
    };
    ctx.user_id = USER_HEADERS.iter().find_map(|name| header(headers, name));
    ctx.endpoint = Some(format!("{} {}", req.method(), req.uri()));
    ctx.ip = header(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
        .filter(|ip| !ip.is_empty());
    ctx.user_agent = header(headers, "user-agent");
    ctx
}

pub async fn request_context(req: Request<Body>, next: Next) -> Response {
    let ctx = context_from_request(&req);
    let request_id = ctx.request_id.clone();

    let mut response = context::scope(ctx, next.run(req)).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

pub async fn require_primary(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    match state.repo.router().require_primary().await {
        Ok(()) => next.run(req).await,
        Err(e) => {
            tracing::warn!(uri = %req.uri(), "Primary required but not active");
            ApiError::from(e).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_from_headers() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/things?x=1")
            .header("x-request-id", "abc")
            .header("x-user", "42")
            .header("x-forwarded-for", "10.0.0.1, 10.0.0.2")
            .header("user-agent", "curl/8")
            .body(Body::empty())
            .unwrap();
        let ctx = context_from_request(&req);
        assert_eq!(ctx.request_id, "abc");
        assert_eq!(ctx.user_id.as_deref(), Some("42"));
        assert_eq!(ctx.endpoint.as_deref(), Some("POST /api/things?x=1"));
        assert_eq!(ctx.ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(ctx.user_agent.as_deref(), Some("curl/8"));
    }

    #[test]
    fn missing_request_id_is_generated() {
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let ctx = context_from_request(&req);
        assert!(uuid::Uuid::parse_str(&ctx.request_id).is_ok());
        assert!(ctx.user_id.is_none());
    }
}
