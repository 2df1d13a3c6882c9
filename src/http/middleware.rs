//! Rate limiting middleware for axum routers.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::RETRY_AFTER, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, trace, warn};

use super::client::client_identifier;
use crate::ratelimit::{Decision, RateLimitBackend, RateLimitRules, RateLimiter};

/// Header carrying the `max_requests` of the applied policy.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Header carrying the requests left in the current window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Header carrying the window reset time in seconds since the Unix epoch.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Shared state for the rate limiting middleware.
#[derive(Clone)]
pub struct RateLimitState {
    /// Counter store
    backend: Arc<dyn RateLimitBackend>,
    /// Route classification and exemptions
    rules: Arc<RateLimitRules>,
    /// When false every request passes through untouched
    enabled: bool,
}

impl RateLimitState {
    /// Create middleware state backed by the in-memory limiter.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        let rules = Arc::new(limiter.rules().clone());
        Self {
            backend: limiter,
            rules,
            enabled: true,
        }
    }

    /// Create middleware state over an arbitrary backend.
    pub fn with_backend(backend: Arc<dyn RateLimitBackend>, rules: RateLimitRules) -> Self {
        Self {
            backend,
            rules: Arc::new(rules),
            enabled: true,
        }
    }

    /// Turn rate limiting on or off.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Body of a `429 Too Many Requests` response.
#[derive(Debug, Serialize)]
struct RateLimitExceeded {
    detail: String,
    retry_after: u64,
}

/// Wrap every route of `router` (including its fallback) with rate limiting.
pub fn apply_rate_limit(router: Router, state: RateLimitState) -> Router {
    router.layer(middleware::from_fn_with_state(state, rate_limit))
}

/// Rate limit a request.
///
/// Exempt paths skip the limiter. If the backend fails the request is
/// admitted and the failure is logged; a broken limiter never turns into a
/// failed request.
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if !state.enabled || state.rules.is_exempt(path) {
        trace!(path = %path, "Skipping rate limit");
        return next.run(request).await;
    }

    let class = state.rules.classify(path);
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_identifier(request.headers(), peer);

    let decision = match state.backend.check_and_record(&client, class).await {
        Ok(decision) => decision,
        Err(e) => {
            error!(
                error = %e,
                class = %class,
                client = %client,
                "Rate limiter failed, admitting request"
            );
            return next.run(request).await;
        }
    };

    if !decision.admitted {
        warn!(class = %class, client = %client, "Rate limit exceeded");
        return too_many_requests(&decision);
    }

    let mut response = next.run(request).await;
    set_rate_limit_headers(response.headers_mut(), &decision);
    response
}

fn too_many_requests(decision: &Decision) -> Response {
    let retry_after = decision.retry_after_seconds.unwrap_or_default();
    let body = RateLimitExceeded {
        detail: format!("Rate limit exceeded. Try again in {} seconds.", retry_after),
        retry_after,
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    set_rate_limit_headers(headers, decision);
    response
}

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(decision.reset_epoch_seconds()),
    );
}
