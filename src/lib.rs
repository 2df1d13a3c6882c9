//! Gatekeeper - Rate Limiting for the Chat Backend
//!
//! This crate implements the in-memory rate limiter that protects the chat
//! and authentication endpoints. Each client gets an independent fixed-window
//! budget per endpoint class (`login`, `register`, `chat`, ...), enforced by
//! an axum middleware that answers `429 Too Many Requests` and reports quota
//! through `X-RateLimit-*` headers.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
