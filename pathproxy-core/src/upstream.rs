use std::fmt;
use std::sync::Arc;

use http::{
    HeaderValue, Request, Response, Uri, Version, header,
    request::Parts,
    uri::{Authority, PathAndQuery, Scheme},
};
use tracing::{debug, info};

use crate::{
    ProxyBody,
    error::DispatchError,
    forward::{Forward, RequestContext},
};

/// A single destination host and the capability that forwards to it.
///
/// `host` and `prefix` never change once the upstream is created.
#[derive(Clone)]
pub struct Upstream {
    authority: Authority,
    /// Route prefix plus host; stripped from every request path.
    prefix: String,
    forwarder: Arc<dyn Forward>,
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream")
            .field("host", &self.host())
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl Upstream {
    pub fn new(prefix: String, authority: Authority, forwarder: Arc<dyn Forward>) -> Self {
        Self {
            authority,
            prefix,
            forwarder,
        }
    }

    pub fn host(&self) -> &str {
        self.authority.as_str()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Points `parts` at this upstream: `https`, authority and `Host` set to
    /// the host, and the upstream prefix removed from the path.
    ///
    /// The query string is carried over untouched.
    pub fn direct(&self, parts: &mut Parts, context: &RequestContext) -> Result<(), DispatchError> {
        let path = parts.uri.path();
        let remaining = path
            .strip_prefix(self.prefix.as_str())
            .ok_or_else(|| DispatchError::RewriteInvariantViolation {
                prefix: self.prefix.clone(),
                path: path.to_owned(),
            })?;

        let remaining = if remaining.is_empty() { "/" } else { remaining };
        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{}?{}", remaining, query),
            None => remaining.to_owned(),
        };
        let path_and_query = PathAndQuery::try_from(path_and_query).map_err(http::Error::from)?;

        parts.uri = Uri::builder()
            .scheme(Scheme::HTTPS)
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()?;
        parts
            .headers
            .insert(header::HOST, HeaderValue::from_str(self.host()).map_err(http::Error::from)?);
        parts.version = Version::HTTP_11;

        info!(
            host = self.host(),
            request_uri = parts.uri.path(),
            client_ip = %context.client_ip,
            user_agent = parts
                .headers
                .get(header::USER_AGENT)
                .and_then(|ua| ua.to_str().ok())
                .unwrap_or(""),
            "access remote address"
        );
        Ok(())
    }

    /// Rewrites the request and hands it to the forwarder.
    pub async fn serve(
        &self,
        request: Request<ProxyBody>,
        context: &RequestContext,
    ) -> Result<Response<ProxyBody>, DispatchError> {
        let (mut parts, body) = request.into_parts();
        self.direct(&mut parts, context)?;

        debug!("Forwarding request to {}", parts.uri);
        self.forwarder
            .forward(Request::from_parts(parts, body), context)
            .await
            .map_err(|source| DispatchError::Upstream {
                host: self.host().to_owned(),
                source,
            })
    }
}
