//! Request dispatch: target extraction, per-host upstream lookup and delegation.

use std::{convert::Infallible, net::SocketAddr, pin::Pin, sync::Arc};

use http::{HeaderValue, Request, Response, header};
use http_body_util::{BodyExt as _, Full};
use hyper::{
    body::{Bytes, Incoming},
    service::Service as HyperService,
};
use tracing::{debug, error, info, warn};

use crate::{
    ProxyBody,
    cache::HostCache,
    client_ip::resolve_client_ip,
    error::DispatchError,
    forward::{Forward, RequestContext},
    target::{RoutePrefix, Target, parse_target, request_target},
    upstream::Upstream,
};

/// Routes `<prefix><host>/...` requests to a lazily created [`Upstream`] per host.
///
/// The host map is the only shared mutable state. Warm lookups take a read
/// lock; a new host takes the write lock once, and every request for that
/// host is served by the same upstream afterwards.
pub struct Dispatcher {
    route_prefix: RoutePrefix,
    upstreams: HostCache<Upstream>,
    forwarder: Arc<dyn Forward>,
}

impl Dispatcher {
    pub fn new(route_prefix: RoutePrefix, forwarder: Arc<dyn Forward>) -> Self {
        info!("Creating dispatcher mounted at {}", route_prefix);
        Self {
            route_prefix,
            upstreams: HostCache::new(),
            forwarder,
        }
    }

    pub fn route_prefix(&self) -> &RoutePrefix {
        &self.route_prefix
    }

    /// Number of distinct hosts with a cached upstream.
    pub fn upstream_count(&self) -> usize {
        self.upstreams.len()
    }

    /// Returns the upstream serving `target`, creating it on first use.
    pub fn upstream(&self, target: &Target) -> Arc<Upstream> {
        self.upstreams.get_or_create_once(target.host(), || {
            info!("Creating upstream for {}", target.host());
            Upstream::new(
                self.route_prefix.upstream_prefix(target.host()),
                target.authority().clone(),
                Arc::clone(&self.forwarder),
            )
        })
    }

    /// Serves one inbound request. Failures become plain-text error responses.
    pub async fn handle(&self, request: Request<ProxyBody>, peer: SocketAddr) -> Response<ProxyBody> {
        let method = request.method().clone();
        let uri = request.uri().clone();
        debug!("Processing request: {} {} from {}", method, uri, peer);

        match self.dispatch(request, peer).await {
            Ok(response) => response,
            Err(err) => {
                if err.is_client_error() {
                    warn!("Bad request {} {}: {}", method, uri, err);
                } else {
                    error!("Failed to serve {} {}: {}", method, uri, err);
                }
                error_response(&err)
            }
        }
    }

    async fn dispatch(
        &self,
        request: Request<ProxyBody>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, DispatchError> {
        let target = parse_target(request_target(request.uri()), &self.route_prefix)?;
        let upstream = self.upstream(&target);

        let context = RequestContext {
            peer,
            client_ip: resolve_client_ip(request.headers(), peer),
        };
        upstream.serve(request, &context).await
    }
}

fn error_response(err: &DispatchError) -> Response<ProxyBody> {
    let mut response = Response::new(
        Full::new(Bytes::from(err.to_string()))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = err.status();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Per-connection handle handed to hyper; carries the peer address.
#[derive(Clone)]
pub struct DispatchService {
    dispatcher: Arc<Dispatcher>,
    peer: SocketAddr,
}

impl DispatchService {
    pub fn new(dispatcher: Arc<Dispatcher>, peer: SocketAddr) -> Self {
        Self { dispatcher, peer }
    }
}

impl HyperService<Request<Incoming>> for DispatchService {
    type Response = Response<ProxyBody>;

    type Error = Infallible;

    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let dispatcher = Arc::clone(&self.dispatcher);
        let peer = self.peer;
        Box::pin(async move { Ok(dispatcher.handle(req.map(|body| body.boxed()), peer).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::{BoxFuture, join_all};
    use http::{StatusCode, Uri};
    use http_body_util::Empty;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct Seen {
        uri: Uri,
        host: Option<HeaderValue>,
        context: RequestContext,
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Seen>>,
        fail: bool,
    }

    impl Recorder {
        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Forward for Recorder {
        fn forward(
            &self,
            request: Request<ProxyBody>,
            context: &RequestContext,
        ) -> BoxFuture<'static, anyhow::Result<Response<ProxyBody>>> {
            self.seen.lock().unwrap().push(Seen {
                uri: request.uri().clone(),
                host: request.headers().get(header::HOST).cloned(),
                context: *context,
            });
            let fail = self.fail;
            let body = request.uri().to_string();
            Box::pin(async move {
                if fail {
                    anyhow::bail!("tls handshake failed");
                }
                Ok(Response::new(
                    Full::new(Bytes::from(body))
                        .map_err(|never| match never {})
                        .boxed(),
                ))
            })
        }
    }

    fn dispatcher(recorder: &Arc<Recorder>) -> Dispatcher {
        Dispatcher::new(RoutePrefix::default(), recorder.clone())
    }

    fn request(uri: &str) -> Request<ProxyBody> {
        Request::builder()
            .uri(uri)
            .header(header::USER_AGENT, "test-agent")
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .unwrap()
    }

    fn peer() -> SocketAddr {
        "192.168.1.20:40000".parse().unwrap()
    }

    async fn body_text(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_rewrites_and_forwards() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(&recorder);

        let mut req = request("/proxy/example.com/a/b?x=1");
        req.headers_mut()
            .insert("true-client-ip", HeaderValue::from_static("1.2.3.4"));
        req.headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("9.9.9.9, 5.5.5.5"));

        let response = dispatcher.handle(req, peer()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "https://example.com/a/b?x=1");

        let seen = recorder.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].uri.scheme_str(), Some("https"));
        assert_eq!(seen[0].uri.path(), "/a/b");
        assert_eq!(seen[0].uri.query(), Some("x=1"));
        assert_eq!(seen[0].host.as_ref().unwrap(), "example.com");
        assert_eq!(seen[0].context.client_ip, "1.2.3.4".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(seen[0].context.peer, peer());
    }

    #[tokio::test]
    async fn test_client_ip_falls_back_to_peer() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(&recorder);

        dispatcher.handle(request("/proxy/example.com/"), peer()).await;

        assert_eq!(recorder.seen()[0].context.client_ip, peer().ip());
    }

    #[tokio::test]
    async fn test_missing_target_is_bad_request() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(&recorder);

        let response = dispatcher.handle(request("/proxy/"), peer()).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("no target"));
        assert_eq!(dispatcher.upstream_count(), 0);
        assert!(recorder.seen().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_target_is_bad_request() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(&recorder);

        let response = dispatcher.handle(request("/proxy//nohost"), peer()).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(dispatcher.upstream_count(), 0);
    }

    #[tokio::test]
    async fn test_unmounted_path_is_not_found() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(&recorder);

        let response = dispatcher.handle(request("/static/app.js"), peer()).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(recorder.seen().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_is_bad_gateway() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let dispatcher = dispatcher(&recorder);

        let response = dispatcher.handle(request("/proxy/example.com/"), peer()).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_text(response).await.contains("tls handshake failed"));
    }

    #[tokio::test]
    async fn test_same_host_reuses_upstream() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(&recorder);

        dispatcher.handle(request("/proxy/example.com/one"), peer()).await;
        dispatcher.handle(request("/proxy/example.com/two?z=2"), peer()).await;
        assert_eq!(dispatcher.upstream_count(), 1);

        dispatcher.handle(request("/proxy/example.org/"), peer()).await;
        assert_eq!(dispatcher.upstream_count(), 2);

        let target = parse_target("/proxy/example.com/", dispatcher.route_prefix()).unwrap();
        let first = dispatcher.upstream(&target);
        let second = dispatcher.upstream(&target);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.prefix(), "/proxy/example.com");

        let uris: Vec<String> = recorder.seen().iter().map(|s| s.uri.to_string()).collect();
        assert_eq!(
            uris,
            [
                "https://example.com/one",
                "https://example.com/two?z=2",
                "https://example.org/",
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_requests_create_one_upstream() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Arc::new(dispatcher(&recorder));

        let tasks = (0..64).map(|i| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .handle(request(&format!("/proxy/fresh.example/{}", i)), peer())
                    .await
                    .status()
            })
        });

        for status in join_all(tasks).await {
            assert_eq!(status.unwrap(), StatusCode::OK);
        }
        assert_eq!(dispatcher.upstream_count(), 1);
        assert_eq!(recorder.seen().len(), 64);
    }
}
