//! HTTP layer: client identification, the rate limiting middleware and the
//! server that hosts it.

mod client;
mod middleware;
mod server;

pub use client::{client_identifier, X_FORWARDED_FOR, X_REAL_IP};
pub use middleware::{
    apply_rate_limit, rate_limit, RateLimitState, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
pub use server::HttpServer;
