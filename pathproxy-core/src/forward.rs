//! The capability that carries a rewritten request to its upstream and
//! streams the answer back.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, header};
use http_body_util::BodyExt as _;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::ProxyBody;
use crate::client_ip::X_FORWARDED_FOR;

/// Per-request values resolved by the dispatcher before delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    /// Socket address of the immediate peer.
    pub peer: SocketAddr,
    /// Best-effort originating client, see [`crate::client_ip`].
    pub client_ip: IpAddr,
}

/// Sends an outbound request and returns the upstream response.
///
/// Implementations must not retry: a failure is reported to the caller as is.
pub trait Forward: Send + Sync {
    fn forward(
        &self,
        request: Request<ProxyBody>,
        context: &RequestContext,
    ) -> BoxFuture<'static, anyhow::Result<Response<ProxyBody>>>;
}

/// Connection pool tuning for [`HttpsForwarder`].
#[derive(Debug, Clone)]
pub struct ForwarderOptions {
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl Default for ForwarderOptions {
    fn default() -> Self {
        Self {
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 32,
        }
    }
}

/// HTTPS-only forwarder shared by every upstream.
#[derive(Clone)]
pub struct HttpsForwarder {
    client: Client<HttpsConnector<HttpConnector>, ProxyBody>,
}

impl HttpsForwarder {
    pub fn new(options: &ForwarderOptions) -> anyhow::Result<Self> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()?
            .https_only()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(options.pool_idle_timeout)
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .build(connector);

        debug!("Created https forwarder with {:?}", options);
        Ok(Self { client })
    }
}

impl Forward for HttpsForwarder {
    fn forward(
        &self,
        mut request: Request<ProxyBody>,
        context: &RequestContext,
    ) -> BoxFuture<'static, anyhow::Result<Response<ProxyBody>>> {
        strip_hop_by_hop(request.headers_mut());
        append_forwarded_for(request.headers_mut(), context.peer.ip());

        let client = self.client.clone();
        Box::pin(async move {
            let response = client.request(request).await?;
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            Ok(Response::from_parts(parts, body.boxed()))
        })
    }
}

const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Removes headers that only describe the current connection, including any
/// listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Appends `peer` to the `X-Forwarded-For` chain, collapsing repeated headers.
pub fn append_forwarded_for(headers: &mut HeaderMap, peer: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();

    let chain = if prior.is_empty() {
        peer.to_string()
    } else {
        format!("{}, {}", prior.join(", "), peer)
    };

    if let Ok(value) = HeaderValue::try_from(chain) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}
