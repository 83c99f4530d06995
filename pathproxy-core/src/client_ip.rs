//! Best-effort attribution of the originating client address.
//!
//! The header chain is only trustworthy when a load balancer in front of this
//! process strips or overwrites these headers. Without one, any client can
//! spoof them; the resolver still refuses anything that is not an IP literal.

use std::net::{IpAddr, SocketAddr};

use http::{HeaderMap, HeaderName};
use tracing::debug;

pub static TRUE_CLIENT_IP: HeaderName = HeaderName::from_static("true-client-ip");
pub static X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
pub static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Resolves the client IP for a request.
///
/// Precedence, first valid wins: `True-Client-IP`, `X-Real-IP`, the first
/// entry of `X-Forwarded-For`, then the socket peer with its port stripped.
/// A header holding anything other than an IP literal is skipped.
pub fn resolve_client_ip(headers: &HeaderMap, remote: SocketAddr) -> IpAddr {
    let candidates = [
        single_value(headers, &TRUE_CLIENT_IP),
        single_value(headers, &X_REAL_IP),
        first_forwarded_for(headers),
    ];

    for candidate in candidates.into_iter().flatten() {
        match candidate.parse::<IpAddr>() {
            Ok(ip) => return ip,
            Err(_) => debug!("Ignoring non-IP client address header value {:?}", candidate),
        }
    }

    remote.ip()
}

fn single_value<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn first_forwarded_for(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(&X_FORWARDED_FOR)?.to_str().ok()?;
    value
        .split(',')
        .next()
        .map(str::trim)
        .filter(|first| !first.is_empty())
}
