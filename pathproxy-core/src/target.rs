//! Extraction of the upstream host embedded in a request path.
//!
//! `/proxy/example.com/search?q=x` under the prefix `/proxy/` targets
//! `example.com`, and the upstream sees `/search?q=x`.

use std::fmt;

use http::{Uri, uri::Authority};

use crate::error::DispatchError;

/// Mount point of the dispatcher, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePrefix(String);

impl RoutePrefix {
    pub fn new(prefix: impl Into<String>) -> Result<Self, DispatchError> {
        let prefix = prefix.into();
        if !prefix.starts_with('/') || !prefix.ends_with('/') {
            return Err(DispatchError::InvalidRoutePrefix(prefix));
        }
        Ok(Self(prefix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segment an upstream strips before forwarding: the prefix plus the host.
    pub fn upstream_prefix(&self, host: &str) -> String {
        format!("{}{}", self.0, host)
    }
}

impl Default for RoutePrefix {
    fn default() -> Self {
        Self("/proxy/".to_owned())
    }
}

impl fmt::Display for RoutePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upstream named by a request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    authority: Authority,
}

impl Target {
    /// `host[:port]` exactly as it appeared in the path.
    pub fn host(&self) -> &str {
        self.authority.as_str()
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }
}

/// Request-target of an inbound request, as the client sent it (path and query).
pub fn request_target(uri: &Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}

/// Parses the host out of `request_target`, which must continue past `prefix`.
///
/// The suffix is read as `https://` + `host[/path][?query]`. This is the only
/// place malformed requests are rejected.
pub fn parse_target(request_target: &str, prefix: &RoutePrefix) -> Result<Target, DispatchError> {
    if request_target.len() <= prefix.as_str().len() {
        return Err(DispatchError::NoTargetSpecified);
    }
    let suffix = request_target
        .strip_prefix(prefix.as_str())
        .ok_or_else(|| DispatchError::PrefixMismatch {
            path: request_target.to_owned(),
            prefix: prefix.to_string(),
        })?;

    let candidate = format!("https://{}", suffix);
    let invalid = |reason: String| DispatchError::InvalidTargetUrl {
        target: candidate.clone(),
        reason,
    };

    let uri = candidate
        .parse::<Uri>()
        .map_err(|e| invalid(e.to_string()))?;
    let authority = uri
        .authority()
        .cloned()
        .ok_or_else(|| invalid("missing host".to_owned()))?;

    if authority.host().is_empty() {
        return Err(invalid("missing host".to_owned()));
    }
    // The strip prefix must be a literal prefix of the request path.
    if authority.as_str().contains('@') {
        return Err(invalid("userinfo is not allowed in the target host".to_owned()));
    }

    Ok(Target { authority })
}
