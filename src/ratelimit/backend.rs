//! Rate limiter trait for abstracting the counter store.

use async_trait::async_trait;

use super::key::EndpointClass;
use super::limiter::Decision;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// The HTTP middleware only talks to this trait, so the in-memory
/// `RateLimiter` can be swapped for a shared store without touching the
/// request pipeline. An `Err` means the store itself failed; callers decide
/// what to do with the request in that case.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Check the limit for a client on an endpoint class and record the
    /// request if it is admitted.
    async fn check_and_record(&self, client: &str, class: EndpointClass) -> Result<Decision>;
}
