//! Transparent proxy library components
//!
//! A TLS-intercepting proxy: a root CA mints short-lived leaf certificates
//! per SNI host name, and decrypted requests are replayed against the real
//! upstream over pooled clients.

pub mod cert_selector;
pub mod certificate_authority;
pub mod connection_pool;
pub mod domain_cert_cache;
pub mod error;
pub mod forwarder;
pub mod jsonl_tracing_layer;
pub mod log_writer;
pub mod proxy_config;
pub mod proxy_server;
pub mod root_ca_store;

// Re-export commonly used types
pub use cert_selector::{CertificateSelector, SniCertificateResolver};
pub use certificate_authority::{DomainCertificate, RootCertificateAuthority};
pub use connection_pool::{ConnectStrategy, ConnectionPool, PoolSettings};
pub use domain_cert_cache::{CacheSettings, DomainCertCache};
pub use error::{CertificateError, ForwardError};
pub use forwarder::{ForwarderSettings, HttpForwarder};
pub use proxy_config::ProxyConfig;
pub use proxy_server::{BoundProxy, ProxyServer};
