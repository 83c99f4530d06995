use std::{fs::File, io::BufReader, net::SocketAddr, path::Path, sync::Arc};

use anyhow::{Context as _, Result};
use hyper_util::{
    rt::{TokioExecutor, TokioIo as HyperSocket},
    server::conn::auto::Builder,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, rustls::ServerConfig};
use tracing::{debug, error};

use crate::service::{DispatchService, Dispatcher};

/// HTTP listener that hands every connection to the dispatcher.
///
/// Each accepted connection is served on its own task, HTTP/1.1 or HTTP/2,
/// optionally behind TLS.
pub struct Server {
    /// The TCP listener for accepting incoming connections
    connection: TcpListener,
    dispatcher: Arc<Dispatcher>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl Server {
    /// Binds `addr`. Connections are not accepted until [`Server::accept`] is called.
    pub async fn new(
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Result<Self> {
        let connection = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        debug!(
            "Bound {} ({})",
            addr,
            if tls_acceptor.is_some() { "tls" } else { "plain" }
        );
        Ok(Self {
            connection,
            dispatcher,
            tls_acceptor,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.connection.local_addr()?)
    }

    /// Accepts one connection and spawns a task to serve it.
    pub async fn accept(&self) -> Result<()> {
        let (conn, peer) = self.connection.accept().await?;
        debug!("Accepted connection from {}", peer);

        let service = DispatchService::new(Arc::clone(&self.dispatcher), peer);
        match &self.tls_acceptor {
            Some(acceptor) => Self::serve_tls(acceptor.clone(), service, conn, peer),
            None => Self::serve_plain(service, conn, peer),
        }
        Ok(())
    }

    fn serve_plain(service: DispatchService, conn: TcpStream, peer: SocketAddr) {
        let io = HyperSocket::new(conn);

        tokio::spawn(async move {
            if let Err(e) = Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                error!("Error serving connection from {}: {:?}", peer, e);
            }
        });
    }

    fn serve_tls(acceptor: TlsAcceptor, service: DispatchService, conn: TcpStream, peer: SocketAddr) {
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(conn).await {
                Ok(tls_stream) => tls_stream,
                Err(err) => {
                    error!("failed to perform tls handshake with {}: {err:#}", peer);
                    return;
                }
            };
            let io = HyperSocket::new(tls_stream);
            if let Err(e) = Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                error!("Error serving tls connection from {}: {:?}", peer, e);
            }
        });
    }
}

/// Builds a TLS acceptor from a PEM certificate chain and private key.
pub fn load_tls_acceptor(certificate: &Path, private_key: &Path) -> Result<TlsAcceptor> {
    let mut reader = BufReader::new(
        File::open(certificate)
            .with_context(|| format!("failed to open certificate {}", certificate.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to read certificate {}", certificate.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", certificate.display());
    }

    let mut reader = BufReader::new(
        File::open(private_key)
            .with_context(|| format!("failed to open private key {}", private_key.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("failed to read private key {}", private_key.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", private_key.display()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProxyBody, forward::{Forward, RequestContext}, target::RoutePrefix};
    use futures::future::BoxFuture;
    use http::{Request, Response};
    use http_body_util::{BodyExt as _, Empty};
    use hyper::body::Bytes;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    struct Never;

    impl Forward for Never {
        fn forward(
            &self,
            _: Request<ProxyBody>,
            _: &RequestContext,
        ) -> BoxFuture<'static, anyhow::Result<Response<ProxyBody>>> {
            Box::pin(async {
                Ok(Response::new(
                    Empty::<Bytes>::new().map_err(|never| match never {}).boxed(),
                ))
            })
        }
    }

    #[tokio::test]
    async fn test_missing_target_over_the_wire() {
        let dispatcher = Arc::new(Dispatcher::new(RoutePrefix::default(), Arc::new(Never)));
        let server = Server::new("127.0.0.1:0".parse().unwrap(), dispatcher, None)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                if server.accept().await.is_err() {
                    break;
                }
            }
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /proxy/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        assert!(raw.starts_with("HTTP/1.1 400"), "{raw}");
        assert!(raw.ends_with("no target url provided"), "{raw}");
    }

    #[test]
    fn test_load_tls_acceptor_missing_file() {
        let err = load_tls_acceptor(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("failed to open certificate"));
    }
}
