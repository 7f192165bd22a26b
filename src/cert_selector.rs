//! Per-handshake certificate selection
//!
//! [`SniCertificateResolver`] plugs a [`CertificateSelector`] into rustls so
//! every handshake is answered with a certificate for the requested server name.

use crate::domain_cert_cache::DomainCertCache;
use crate::error::CertificateError;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::sync::Arc;

/// Picks the certificate presented for a requested server name.
pub trait CertificateSelector: Send + Sync {
    /// `None` when the client sent no SNI.
    fn select_certificate(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<CertifiedKey>, CertificateError>;
}

impl CertificateSelector for DomainCertCache {
    fn select_certificate(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<CertifiedKey>, CertificateError> {
        self.get_certificate(server_name)
            .map(|certificate| certificate.certified_key())
    }
}

/// rustls certificate resolver backed by a [`CertificateSelector`].
///
/// A selection failure aborts the handshake; no fallback certificate is served.
pub struct SniCertificateResolver {
    selector: Arc<dyn CertificateSelector>,
}

impl SniCertificateResolver {
    pub fn new(selector: Arc<dyn CertificateSelector>) -> Self {
        Self { selector }
    }
}

impl fmt::Debug for SniCertificateResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniCertificateResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniCertificateResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();
        match self.selector.select_certificate(server_name) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::error!(
                    server_name = server_name.unwrap_or("<none>"),
                    "Failed to select certificate: {}",
                    e
                );
                None
            }
        }
    }
}
