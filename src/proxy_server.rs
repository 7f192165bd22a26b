//! HTTP and HTTPS listeners
//!
//! Accepts connections, terminates TLS with a certificate chosen per
//! handshake, serves the local routes and hands everything else to the
//! [`HttpForwarder`].

use crate::cert_selector::{CertificateSelector, SniCertificateResolver};
use crate::connection_pool::ConnectionPool;
use crate::domain_cert_cache::DomainCertCache;
use crate::error::BoxError;
use crate::forwarder::{HttpForwarder, ProxyBody};
use crate::proxy_config::ProxyConfig;
use crate::root_ca_store;
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::http::uri::{Authority, Scheme};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Body of the local greeting route.
pub const HELLO_MESSAGE: &str = "Hello from Transparent Proxy!";

const HELLO_PATH: &str = "/api/hello";
const LOCAL_HOST: &str = "localhost";

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Install the process-wide rustls crypto provider. Safe to call repeatedly.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

pub struct ProxyServer {
    config: ProxyConfig,
    cache: Arc<DomainCertCache>,
    forwarder: Arc<HttpForwarder>,
}

impl ProxyServer {
    /// Load or create the root CA and build the cache, pool and forwarder from `config`.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        install_crypto_provider();

        let root = root_ca_store::load_or_create(&config.tls)?;
        let cache = Arc::new(DomainCertCache::new(
            Arc::new(root),
            config.tls.cache_settings()?,
        ));
        let pool = Arc::new(ConnectionPool::new(config.forwarding.pool_settings()?));
        let forwarder = Arc::new(HttpForwarder::new(
            pool,
            config.forwarding.forwarder_settings()?,
        ));

        Ok(Self::from_parts(config, cache, forwarder))
    }

    pub fn from_parts(
        config: ProxyConfig,
        cache: Arc<DomainCertCache>,
        forwarder: Arc<HttpForwarder>,
    ) -> Self {
        Self {
            config,
            cache,
            forwarder,
        }
    }

    pub fn cache(&self) -> &Arc<DomainCertCache> {
        &self.cache
    }

    /// Bind the configured listeners without accepting yet.
    pub async fn bind(self) -> Result<BoundProxy> {
        install_crypto_provider();

        let selector: Arc<dyn CertificateSelector> = self.cache.clone();
        let mut tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniCertificateResolver::new(selector)));
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let https = TcpListener::bind(self.config.listen.https_addr)
            .await
            .with_context(|| format!("Failed to bind HTTPS listener on {}", self.config.listen.https_addr))?;
        tracing::info!("HTTPS listener on {}", https.local_addr()?);

        let http = if self.config.listen.enable_http {
            let listener = TcpListener::bind(self.config.listen.http_addr)
                .await
                .with_context(|| format!("Failed to bind HTTP listener on {}", self.config.listen.http_addr))?;
            tracing::info!("HTTP listener on {}", listener.local_addr()?);
            Some(listener)
        } else {
            None
        };

        Ok(BoundProxy {
            https,
            http,
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            forwarder: self.forwarder,
        })
    }

    /// Bind and serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.bind().await?.run(shutdown).await
    }
}

/// Listeners bound and ready to accept.
pub struct BoundProxy {
    https: TcpListener,
    http: Option<TcpListener>,
    acceptor: TlsAcceptor,
    forwarder: Arc<HttpForwarder>,
}

impl BoundProxy {
    pub fn https_addr(&self) -> io::Result<SocketAddr> {
        self.https.local_addr()
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Cancelling `shutdown` also cancels every in-flight forward.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Proxy shutting down");
                    return Ok(());
                }
                accepted = self.https.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        tracing::debug!("Accepted TLS connection from {}", peer_addr);
                        tokio::spawn(handle_tls_connection(
                            stream,
                            peer_addr,
                            self.acceptor.clone(),
                            self.forwarder.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => tracing::warn!("Failed to accept TLS connection: {}", e),
                },
                accepted = accept_optional(self.http.as_ref()) => match accepted {
                    Ok((stream, peer_addr)) => {
                        tracing::debug!("Accepted HTTP connection from {}", peer_addr);
                        tokio::spawn(serve_connection(
                            stream,
                            peer_addr,
                            Scheme::HTTP,
                            self.forwarder.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => tracing::warn!("Failed to accept HTTP connection: {}", e),
                },
            }
        }
    }
}

async fn accept_optional(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn handle_tls_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    forwarder: Arc<HttpForwarder>,
    shutdown: CancellationToken,
) {
    match acceptor.accept(stream).await {
        Ok(tls_stream) => {
            let server_name = tls_stream.get_ref().1.server_name().map(String::from);
            tracing::debug!(peer = %peer_addr, server_name = ?server_name, "TLS handshake completed");
            serve_connection(tls_stream, peer_addr, Scheme::HTTPS, forwarder, shutdown).await;
        }
        Err(e) => tracing::debug!("TLS handshake with {} failed: {}", peer_addr, e),
    }
}

/// Serve HTTP/1 on one connection. The connection's token is cancelled when
/// this returns, which aborts any forward still streaming on it.
async fn serve_connection<I>(
    io: I,
    peer_addr: SocketAddr,
    scheme: Scheme,
    forwarder: Arc<HttpForwarder>,
    shutdown: CancellationToken,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection_token = shutdown.child_token();
    let _cancel_on_close = connection_token.clone().drop_guard();

    let service = service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(scheme.clone());
        let forwarder = forwarder.clone();
        let cancel = connection_token.clone();
        async move { handle_request(req, forwarder, cancel).await }
    });

    let mut conn: Pin<Box<dyn ServedConnection>> =
        Box::pin(http1::Builder::new().serve_connection(TokioIo::new(io), service));

    let finished = tokio::select! {
        result = conn.as_mut() => Some(result),
        _ = shutdown.cancelled() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        tracing::debug!("Connection from {} ended: {}", peer_addr, e);
    }
}

/// Type-erased hyper connection. Holding the concrete `http1::Connection`
/// across an await makes the spawned future's `Send` check fail on the
/// service's `BoxError` bound (a rustc higher-ranked lifetime limitation).
trait ServedConnection: Future<Output = hyper::Result<()>> + Send {
    fn graceful_shutdown(self: Pin<&mut Self>);
}

impl<I, S, B> ServedConnection for http1::Connection<I, S>
where
    S: hyper::service::HttpService<Incoming, ResBody = B> + Send,
    S::Error: Into<BoxError>,
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send,
    B: hyper::body::Body + 'static,
    B::Error: Into<BoxError>,
    Self: Send,
{
    fn graceful_shutdown(self: Pin<&mut Self>) {
        http1::Connection::graceful_shutdown(self)
    }
}

async fn handle_request(
    req: Request<Incoming>,
    forwarder: Arc<HttpForwarder>,
    cancel: CancellationToken,
) -> Result<Response<ProxyBody>, BoxError> {
    if is_local_hello(&req) {
        return Ok(text_response(StatusCode::OK, HELLO_MESSAGE));
    }

    match forwarder.forward(req, cancel).await {
        Ok(response) => Ok(response),
        Err(e) => match e.status_code() {
            Some(status) => Ok(text_response(status, e.to_string())),
            // Nothing is written back to an aborted connection
            None => Err(Box::new(e)),
        },
    }
}

fn is_local_hello<B>(req: &Request<B>) -> bool {
    if req.method() != Method::GET || req.uri().path() != HELLO_PATH {
        return false;
    }

    let host = req
        .uri()
        .authority()
        .map(|authority| authority.host().to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<Authority>().ok())
                .map(|authority| authority.host().to_string())
        });

    host.is_some_and(|host| host.eq_ignore_ascii_case(LOCAL_HOST))
}
