//! Upstream connection pool
//!
//! One hyper client per origin base address, created on first use and kept
//! for the life of the process. Each client keeps its own keep-alive
//! connections and reconnects transparently when one dies.

use crate::error::BoxError;
use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use http_body_util::combinators::UnsyncBoxBody;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::dns::Name;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

/// Request body type sent upstream.
pub type UpstreamBody = UnsyncBoxBody<Bytes, BoxError>;

pub type UpstreamClient = Client<HttpsConnector<HttpConnector<UpstreamResolver>>, UpstreamBody>;

/// How upstream host names become socket addresses.
#[derive(Debug, Clone, Default)]
pub enum ConnectStrategy {
    /// The operating system resolver.
    #[default]
    System,
    /// Ask one DNS server directly, bypassing local overrides such as `/etc/hosts`.
    Nameserver(SocketAddr),
    /// Fixed addresses per host name; other names use the system resolver.
    Pinned(HashMap<String, SocketAddr>),
}

/// DNS resolver handed to the HTTP connector.
///
/// Addresses resolved by name carry port 0 so the connector applies the
/// request's port; pinned addresses keep theirs unless the URI names a port.
#[derive(Clone)]
pub enum UpstreamResolver {
    System,
    Nameserver(Arc<TokioAsyncResolver>),
    Pinned(Arc<HashMap<String, SocketAddr>>),
}

impl UpstreamResolver {
    pub fn new(strategy: &ConnectStrategy) -> Self {
        match strategy {
            ConnectStrategy::System => UpstreamResolver::System,
            ConnectStrategy::Nameserver(addr) => {
                let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
                let config = ResolverConfig::from_parts(None, vec![], group);
                UpstreamResolver::Nameserver(Arc::new(TokioAsyncResolver::tokio(
                    config,
                    ResolverOpts::default(),
                )))
            }
            ConnectStrategy::Pinned(hosts) => UpstreamResolver::Pinned(Arc::new(
                hosts
                    .iter()
                    .map(|(host, addr)| (host.to_ascii_lowercase(), *addr))
                    .collect(),
            )),
        }
    }

    async fn resolve(self, host: String) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = match self {
            UpstreamResolver::System => system_lookup(&host).await?,
            UpstreamResolver::Nameserver(resolver) => resolver
                .lookup_ip(host.as_str())
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?
                .iter()
                .map(|ip| SocketAddr::new(ip, 0))
                .collect(),
            UpstreamResolver::Pinned(hosts) => match hosts.get(&host.to_ascii_lowercase()) {
                Some(addr) => vec![*addr],
                None => system_lookup(&host).await?,
            },
        };

        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {host}"),
            ));
        }
        tracing::debug!(host = %host, ?addrs, "Resolved upstream host");
        Ok(addrs)
    }
}

async fn system_lookup(host: &str) -> io::Result<Vec<SocketAddr>> {
    Ok(tokio::net::lookup_host((host, 0)).await?.collect())
}

impl tower_service::Service<Name> for UpstreamResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let resolver = self.clone();
        let host = name.as_str().to_string();
        Box::pin(async move { resolver.resolve(host).await.map(Vec::into_iter) })
    }
}

/// Settings shared by every client the pool creates.
#[derive(Clone)]
pub struct PoolSettings {
    pub connect: ConnectStrategy,
    pub tls: Arc<ClientConfig>,
    pub connect_timeout: Option<Duration>,
}

impl PoolSettings {
    /// Platform trust roots, the system resolver and a 10 second connect timeout.
    pub fn with_native_roots() -> Result<Self> {
        Ok(Self {
            connect: ConnectStrategy::System,
            tls: Arc::new(client_tls_config(&[])?),
            connect_timeout: Some(Duration::from_secs(10)),
        })
    }
}

/// Build an upstream TLS configuration trusting the platform roots plus `extra_roots`.
pub fn client_tls_config(extra_roots: &[CertificateDer<'static>]) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        tracing::warn!("Failed to load a platform root certificate: {}", e);
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!(added, ignored, "Loaded platform root certificates");

    for cert in extra_roots {
        roots
            .add(cert.clone())
            .context("Failed to add extra root certificate")?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Read every certificate from a PEM bundle.
pub fn load_pem_certificates(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path.as_ref()).context("Failed to read PEM bundle")?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse PEM bundle")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {:?}", path.as_ref());
    }
    Ok(certs)
}

/// A client bound to one origin.
#[derive(Clone)]
pub struct PooledClient {
    base_address: Arc<str>,
    client: UpstreamClient,
}

impl PooledClient {
    pub fn base_address(&self) -> &str {
        &self.base_address
    }

    pub fn client(&self) -> &UpstreamClient {
        &self.client
    }
}

/// Concurrent map from base address to [`PooledClient`].
pub struct ConnectionPool {
    settings: PoolSettings,
    resolver: UpstreamResolver,
    clients: DashMap<String, PooledClient>,
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings) -> Self {
        let resolver = UpstreamResolver::new(&settings.connect);
        Self {
            settings,
            resolver,
            clients: DashMap::new(),
        }
    }

    /// Get the client for `base_address`, creating it on first use.
    ///
    /// Keys are compared case-insensitively. Two callers racing on a new key
    /// may both build a client; only the first insert is kept.
    pub fn get_client(&self, base_address: &str) -> PooledClient {
        let key = base_address.to_ascii_lowercase();
        if let Some(client) = self.clients.get(&key) {
            return client.clone();
        }

        let client = self.build_client(&key);
        self.clients.entry(key).or_insert(client).value().clone()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn build_client(&self, base_address: &str) -> PooledClient {
        tracing::debug!(base_address = %base_address, "Creating upstream client");

        let mut http = HttpConnector::new_with_resolver(self.resolver.clone());
        http.enforce_http(false);
        http.set_connect_timeout(self.settings.connect_timeout);

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config((*self.settings.tls).clone())
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        // The legacy client never follows redirects; 3xx responses reach the caller as-is.
        let client = Client::builder(TokioExecutor::new()).build(https);

        PooledClient {
            base_address: Arc::from(base_address),
            client,
        }
    }
}
