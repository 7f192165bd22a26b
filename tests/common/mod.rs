//! Common test utilities: a test root CA, a tiny HTTPS upstream, a running
//! proxy and a TLS client that talks to it.

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::UnsyncBoxBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::header::HeaderMap;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector, client::TlsStream};
use tokio_util::sync::CancellationToken;
use transparent_proxy::connection_pool::client_tls_config;
use transparent_proxy::error::BoxError;
use transparent_proxy::proxy_config::ProxyConfig;
use transparent_proxy::proxy_server::install_crypto_provider;
use transparent_proxy::{
    CacheSettings, ConnectStrategy, ConnectionPool, DomainCertCache, ForwarderSettings,
    HttpForwarder, PoolSettings, ProxyServer, RootCertificateAuthority,
};

pub type TestBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full(body: impl Into<Bytes>) -> TestBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

// ---------------------------------------------------------------------------
// TestCa
// ---------------------------------------------------------------------------

pub struct TestCa {
    pub root: Arc<RootCertificateAuthority>,
}

impl TestCa {
    pub fn generate() -> Self {
        install_crypto_provider();
        let root = RootCertificateAuthority::create(
            "Transparent Proxy Test Root",
            Duration::from_secs(24 * 60 * 60),
            2048,
        )
        .expect("Failed to create test root CA");
        Self {
            root: Arc::new(root),
        }
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.root.certificate_der().clone()
    }

    /// Client configuration trusting only this CA.
    pub fn client_tls_config(&self) -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert_der()).unwrap();
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }

    /// Server configuration for `hostname`, signed by this CA.
    pub fn server_tls_config(&self, hostname: &str) -> Arc<ServerConfig> {
        let leaf = self
            .root
            .generate_domain_certificate(hostname, Duration::from_secs(60 * 60), 2048)
            .unwrap();
        let chain = vec![leaf.certificate_der().clone(), self.cert_der()];
        let key = PrivateKeyDer::Pkcs8(leaf.private_key_der().clone_key());
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .unwrap();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }
}

// ---------------------------------------------------------------------------
// TestUpstream
// ---------------------------------------------------------------------------

pub type UpstreamResponse =
    Pin<Box<dyn Future<Output = Result<Response<TestBody>, Infallible>> + Send>>;

pub type UpstreamHandler = Arc<dyn Fn(Request<Incoming>) -> UpstreamResponse + Send + Sync>;

/// An HTTPS origin server on 127.0.0.1 that records the headers it receives.
pub struct TestUpstream {
    pub addr: SocketAddr,
    pub seen_headers: Arc<Mutex<Vec<HeaderMap>>>,
    shutdown: CancellationToken,
}

impl TestUpstream {
    pub async fn start(ca: &TestCa, hostname: &str, handler: UpstreamHandler) -> Self {
        let acceptor = TlsAcceptor::from(ca.server_tls_config(hostname));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen_headers = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let seen = seen_headers.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(_) => continue,
                    },
                };

                let acceptor = acceptor.clone();
                let handler = handler.clone();
                let seen = seen.clone();
                tokio::spawn(async move {
                    let Ok(tls_stream) = acceptor.accept(stream).await else {
                        return;
                    };
                    let service = service_fn(move |req: Request<Incoming>| {
                        seen.lock().unwrap().push(req.headers().clone());
                        handler(req)
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(tls_stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            seen_headers,
            shutdown,
        }
    }

    pub fn last_headers(&self) -> Option<HeaderMap> {
        self.seen_headers.lock().unwrap().last().cloned()
    }
}

impl Drop for TestUpstream {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Responds 200 with `body` as text/plain.
pub fn text_handler(body: &'static str) -> UpstreamHandler {
    Arc::new(move |_req| {
        Box::pin(async move {
            Ok(Response::builder()
                .header("content-type", "text/plain")
                .header("x-upstream", "yes")
                .body(full(body))
                .unwrap())
        })
    })
}

/// A body of unknown length, so hyper frames it with chunked encoding.
pub struct ChunkedBody {
    chunks: VecDeque<Bytes>,
}

impl ChunkedBody {
    pub fn new(data: &[u8], chunk_size: usize) -> Self {
        Self {
            chunks: data.chunks(chunk_size).map(Bytes::copy_from_slice).collect(),
        }
    }
}

impl Body for ChunkedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Poll::Ready(self.chunks.pop_front().map(|chunk| Ok(Frame::data(chunk))))
    }
}

/// Echoes the request body back as a chunked response marked `Connection: keep-alive`.
pub fn echo_handler() -> UpstreamHandler {
    Arc::new(|req: Request<Incoming>| {
        Box::pin(async move {
            let content_type = req.headers().get("content-type").cloned();
            let body = req.into_body().collect().await.unwrap().to_bytes();

            let mut builder = Response::builder()
                .header("connection", "keep-alive")
                .header("x-echoed-bytes", body.len().to_string());
            if let Some(content_type) = content_type {
                builder = builder.header("content-type", content_type);
            }
            Ok(builder
                .body(ChunkedBody::new(&body, 4096).boxed_unsync())
                .unwrap())
        })
    })
}

/// An address nothing listens on.
pub async fn closed_port_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

// ---------------------------------------------------------------------------
// TestProxy
// ---------------------------------------------------------------------------

pub struct TestProxy {
    pub https_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    pub cache: Arc<DomainCertCache>,
    pub shutdown: CancellationToken,
}

impl TestProxy {
    /// Start a proxy on ephemeral ports that resolves the `pinned` host names
    /// to local addresses and trusts the test CA upstream.
    pub async fn start(ca: &TestCa, pinned: HashMap<String, SocketAddr>) -> Self {
        let cache = Arc::new(DomainCertCache::new(
            ca.root.clone(),
            CacheSettings::default(),
        ));
        Self::start_with_cache(ca, pinned, cache).await
    }

    pub async fn start_with_cache(
        ca: &TestCa,
        pinned: HashMap<String, SocketAddr>,
        cache: Arc<DomainCertCache>,
    ) -> Self {
        let forwarder = Arc::new(test_forwarder(ca, pinned));

        let mut config = ProxyConfig::default();
        config.listen.https_addr = "127.0.0.1:0".parse().unwrap();
        config.listen.http_addr = "127.0.0.1:0".parse().unwrap();

        let bound = ProxyServer::from_parts(config, cache.clone(), forwarder)
            .bind()
            .await
            .unwrap();
        let https_addr = bound.https_addr().unwrap();
        let http_addr = bound.http_addr();

        let shutdown = CancellationToken::new();
        tokio::spawn(bound.run(shutdown.clone()));

        Self {
            https_addr,
            http_addr,
            cache,
            shutdown,
        }
    }
}

/// A forwarder that resolves the `pinned` host names to local addresses and
/// trusts the test CA upstream.
pub fn test_forwarder(ca: &TestCa, pinned: HashMap<String, SocketAddr>) -> HttpForwarder {
    let pool = Arc::new(ConnectionPool::new(PoolSettings {
        connect: ConnectStrategy::Pinned(pinned),
        tls: Arc::new(client_tls_config(&[ca.cert_der()]).unwrap()),
        connect_timeout: Some(Duration::from_secs(5)),
    }));
    HttpForwarder::new(pool, ForwarderSettings::default())
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Open a TLS connection to `addr` presenting `server_name` as SNI.
pub async fn connect_tls(
    addr: SocketAddr,
    server_name: &str,
    config: Arc<ClientConfig>,
) -> std::io::Result<TlsStream<TcpStream>> {
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    TlsConnector::from(config).connect(server_name, stream).await
}

pub type ClientSender = hyper::client::conn::http1::SendRequest<Full<Bytes>>;

/// HTTP/1 handshake over an established stream.
pub async fn http1_client<S>(stream: S) -> ClientSender
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    sender
}

/// Send a GET through the proxy's HTTPS listener for `host`.
pub async fn https_get(
    proxy: &TestProxy,
    ca: &TestCa,
    host: &str,
    path: &str,
    headers: &[(&str, &str)],
) -> Response<Incoming> {
    let stream = connect_tls(proxy.https_addr, host, ca.client_tls_config())
        .await
        .unwrap();
    let mut sender = http1_client(stream).await;

    let mut builder = Request::get(path).header("host", host);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    sender
        .send_request(builder.body(Full::new(Bytes::new())).unwrap())
        .await
        .unwrap()
}

/// Send `request` through the proxy's HTTPS listener, presenting `host` as SNI.
pub async fn https_request(
    proxy: &TestProxy,
    ca: &TestCa,
    host: &str,
    request: Request<Full<Bytes>>,
) -> Response<Incoming> {
    let stream = connect_tls(proxy.https_addr, host, ca.client_tls_config())
        .await
        .unwrap();
    let mut sender = http1_client(stream).await;
    sender.send_request(request).await.unwrap()
}

pub async fn body_string(response: Response<Incoming>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub fn pinned(entries: &[(&str, SocketAddr)]) -> HashMap<String, SocketAddr> {
    entries
        .iter()
        .map(|(host, addr)| (host.to_string(), *addr))
        .collect()
}
