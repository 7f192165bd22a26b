//! Expiring per-domain certificate cache
//!
//! Maps a domain name to a leaf certificate minted from the loaded root CA.
//! Entries are minted lazily and replaced on the first lookup after expiry;
//! there is no background sweep.

use crate::certificate_authority::{DomainCertificate, RootCertificateAuthority, DEFAULT_KEY_SIZE};
use crate::error::CertificateError;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Tunables for [`DomainCertCache`].
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Used when the handshake carries no server name.
    pub default_domain: String,
    pub lifetime: Duration,
    /// Extra validity on top of `lifetime` for handshakes already holding the certificate.
    pub grace_period: Duration,
    pub key_size: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_domain: "localhost".to_string(),
            lifetime: Duration::from_secs(15 * 60),
            grace_period: Duration::from_secs(5 * 60),
            key_size: DEFAULT_KEY_SIZE,
        }
    }
}

#[derive(Clone)]
struct CacheEntry {
    certificate: Arc<DomainCertificate>,
    expires_at: SystemTime,
}

/// Concurrent, lazily populated cache of domain certificates.
pub struct DomainCertCache {
    root: Arc<RootCertificateAuthority>,
    settings: CacheSettings,
    entries: DashMap<String, CacheEntry>,
}

impl DomainCertCache {
    pub fn new(root: Arc<RootCertificateAuthority>, settings: CacheSettings) -> Self {
        Self {
            root,
            settings,
            entries: DashMap::new(),
        }
    }

    /// Return a valid certificate for `domain`, minting one on miss or expiry.
    ///
    /// `None` resolves to the configured default domain.
    pub fn get_certificate(
        &self,
        domain: Option<&str>,
    ) -> Result<Arc<DomainCertificate>, CertificateError> {
        self.get_certificate_at(domain, SystemTime::now())
    }

    pub(crate) fn get_certificate_at(
        &self,
        domain: Option<&str>,
        now: SystemTime,
    ) -> Result<Arc<DomainCertificate>, CertificateError> {
        let key = self.cache_key(domain);

        if let Some(entry) = self.entries.get(&key) {
            if now < entry.expires_at {
                tracing::debug!(domain = %key, "Using cached certificate");
                return Ok(entry.certificate.clone());
            }
        }

        // Minted without holding a shard lock; a concurrent miss may mint too and
        // the last insert wins.
        tracing::debug!(domain = %key, "Minting certificate");
        let validity = self
            .settings
            .lifetime
            .checked_add(self.settings.grace_period)
            .ok_or_else(|| CertificateError::signing("certificate lifetime out of range"))?;
        let certificate = Arc::new(self.root.generate_domain_certificate(
            &key,
            validity,
            self.settings.key_size,
        )?);

        let expires_at = now
            .checked_add(validity)
            .ok_or_else(|| CertificateError::signing("certificate lifetime out of range"))?;
        self.entries.insert(
            key,
            CacheEntry {
                certificate: certificate.clone(),
                expires_at,
            },
        );

        Ok(certificate)
    }

    /// Expiry of the cached entry for `domain`, if any.
    pub fn expires_at(&self, domain: Option<&str>) -> Option<SystemTime> {
        self.entries
            .get(&self.cache_key(domain))
            .map(|entry| entry.expires_at)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn root(&self) -> &Arc<RootCertificateAuthority> {
        &self.root
    }

    fn cache_key(&self, domain: Option<&str>) -> String {
        let domain = domain
            .map(|d| d.trim().trim_end_matches('.'))
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.settings.default_domain);
        domain.to_ascii_lowercase()
    }
}
