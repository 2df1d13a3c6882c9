//! Client identification for rate limiting.

use axum::http::HeaderMap;
use std::net::SocketAddr;

/// Header set by proxies with the originating client chain.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header set by some proxies with the originating client address.
pub const X_REAL_IP: &str = "x-real-ip";

/// Identifier used when neither headers nor the peer address are available.
const FALLBACK_IDENTIFIER: &str = "127.0.0.1";

/// Derive the client identifier for a request.
///
/// Priority: first entry of `X-Forwarded-For`, then `X-Real-IP`, then the
/// peer address. The first non-empty value wins.
pub fn client_identifier(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(client) = forwarded {
        return client.to_string();
    }

    let real_ip = headers
        .get(X_REAL_IP)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(client) = real_ip {
        return client.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| FALLBACK_IDENTIFIER.to_string())
}
