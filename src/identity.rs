//! Client identity for rate limiting.
//!
//! The first `X-Forwarded-For` entry wins, otherwise the peer address
//! without its port. Nothing is validated: a client can put anything in the
//! forwarded header, so deployments that care about spoofing must strip or
//! overwrite it at a trusted edge proxy.

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};
use std::net::SocketAddr;

pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Identity used when neither a forwarded header nor a peer address is known
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Derive the identity from a header set and the peer's address.
pub fn resolve(headers: &HeaderMap, remote_addr: Option<&str>) -> String {
    if let Some(first) = headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        // A blank first entry would pool every such client into one bucket;
        // use the peer address instead
        .filter(|first| !first.is_empty())
    {
        return first.to_string();
    }

    match remote_addr.map(strip_port) {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => UNKNOWN_IDENTITY.to_string(),
    }
}

/// Identity of an axum request; the peer address comes from `ConnectInfo`.
pub fn from_request<B>(req: &Request<B>) -> String {
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());
    resolve(req.headers(), remote.as_deref())
}

/// `1.2.3.4:80` -> `1.2.3.4`, `[::1]:80` -> `::1`; anything else unchanged.
pub fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host;
        }
    }

    match addr.rsplit_once(':') {
        Some((host, port))
            if !host.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host
        }
        _ => addr,
    }
}
