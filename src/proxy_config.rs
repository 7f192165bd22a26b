//! Configuration for the transparent proxy

use crate::certificate_authority::DEFAULT_KEY_SIZE;
use crate::connection_pool::{client_tls_config, load_pem_certificates, ConnectStrategy, PoolSettings};
use crate::domain_cert_cache::CacheSettings;
use crate::forwarder::{
    ForwarderSettings, HeaderFilter, OriginMapping, DEFAULT_EXCLUDED_REQUEST_HEADERS,
    DEFAULT_EXCLUDED_RESPONSE_HEADERS,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub forwarding: ForwardingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_true")]
    pub enable_http: bool,

    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    #[serde(default = "default_https_addr")]
    pub https_addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PKCS#12 archive holding the root CA certificate and key
    #[serde(default = "default_root_ca_path")]
    pub root_ca_path: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_ca_password: Option<String>,

    /// Create and persist a root CA when `root_ca_path` does not exist
    #[serde(default = "default_true")]
    pub generate_ca: bool,

    #[serde(default = "default_ca_subject")]
    pub ca_subject: String,

    #[serde(default = "default_ca_validity_days")]
    pub ca_validity_days: u64,

    #[serde(default = "default_key_size")]
    pub ca_key_size: u32,

    #[serde(default = "default_domain")]
    pub default_domain: String,

    #[serde(default = "default_domain_cert_lifetime_minutes")]
    pub domain_cert_lifetime_minutes: u64,

    #[serde(default = "default_grace_period_minutes")]
    pub grace_period_minutes: u64,

    #[serde(default = "default_key_size")]
    pub domain_key_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    #[serde(default = "default_excluded_request_headers")]
    pub excluded_request_headers: Vec<String>,

    #[serde(default = "default_excluded_response_headers")]
    pub excluded_response_headers: Vec<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// 0 waits for upstream response headers indefinitely
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_host_suffix: Option<String>,

    /// PEM bundle trusted for upstream TLS on top of the platform roots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_root_ca: Option<PathBuf>,

    #[serde(default)]
    pub connect: ConnectConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ConnectConfig {
    #[default]
    System,
    Nameserver {
        address: SocketAddr,
    },
    Pinned {
        hosts: HashMap<String, SocketAddr>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also append every log event to `<dir>/YYYY-MM-DD.jsonl`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonl_dir: Option<PathBuf>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            enable_http: true,
            http_addr: default_http_addr(),
            https_addr: default_https_addr(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            root_ca_path: default_root_ca_path(),
            root_ca_password: None,
            generate_ca: true,
            ca_subject: default_ca_subject(),
            ca_validity_days: default_ca_validity_days(),
            ca_key_size: default_key_size(),
            default_domain: default_domain(),
            domain_cert_lifetime_minutes: default_domain_cert_lifetime_minutes(),
            grace_period_minutes: default_grace_period_minutes(),
            domain_key_size: default_key_size(),
        }
    }
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            excluded_request_headers: default_excluded_request_headers(),
            excluded_response_headers: default_excluded_response_headers(),
            connect_timeout_secs: default_connect_timeout_secs(),
            response_timeout_secs: default_response_timeout_secs(),
            strip_host_suffix: None,
            extra_root_ca: None,
            connect: ConnectConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .context("Failed to read configuration file")?;
        let config: ProxyConfig = toml::from_str(&contents)
            .context("Failed to parse configuration file")?;
        Ok(config)
    }

    /// Load configuration from environment variables or use defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields from `TRANSPARENT_PROXY_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("TRANSPARENT_PROXY_HTTP_ADDR") {
            if let Ok(addr) = addr.parse() {
                self.listen.http_addr = addr;
            }
        }

        if let Ok(addr) = std::env::var("TRANSPARENT_PROXY_HTTPS_ADDR") {
            if let Ok(addr) = addr.parse() {
                self.listen.https_addr = addr;
            }
        }

        if let Ok(path) = std::env::var("TRANSPARENT_PROXY_ROOT_CA") {
            self.tls.root_ca_path = PathBuf::from(path);
        }

        if let Ok(domain) = std::env::var("TRANSPARENT_PROXY_DEFAULT_DOMAIN") {
            self.tls.default_domain = domain;
        }

        if let Ok(dir) = std::env::var("TRANSPARENT_PROXY_LOG_DIR") {
            self.logging.jsonl_dir = Some(PathBuf::from(dir));
        }
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;
        std::fs::write(path.as_ref(), contents)
            .context("Failed to write configuration file")?;
        Ok(())
    }
}

impl TlsConfig {
    pub fn cache_settings(&self) -> Result<CacheSettings> {
        Ok(CacheSettings {
            default_domain: self.default_domain.clone(),
            lifetime: minutes(self.domain_cert_lifetime_minutes, "domain_cert_lifetime_minutes")?,
            grace_period: minutes(self.grace_period_minutes, "grace_period_minutes")?,
            key_size: self.domain_key_size,
        })
    }

    pub fn ca_validity(&self) -> Result<Duration> {
        self.ca_validity_days
            .checked_mul(24 * 60 * 60)
            .map(Duration::from_secs)
            .with_context(|| format!("ca_validity_days = {} is out of range", self.ca_validity_days))
    }
}

fn minutes(value: u64, field: &str) -> Result<Duration> {
    value
        .checked_mul(60)
        .map(Duration::from_secs)
        .with_context(|| format!("{field} = {value} is out of range"))
}

impl ForwardingConfig {
    pub fn forwarder_settings(&self) -> Result<ForwarderSettings> {
        Ok(ForwarderSettings {
            request_filter: HeaderFilter::new(&self.excluded_request_headers)
                .context("Invalid excluded request header")?,
            response_filter: HeaderFilter::new(&self.excluded_response_headers)
                .context("Invalid excluded response header")?,
            response_timeout: match self.response_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            origin_mapping: match &self.strip_host_suffix {
                Some(suffix) if !suffix.is_empty() => OriginMapping::StripSuffix(suffix.clone()),
                _ => OriginMapping::Passthrough,
            },
        })
    }

    pub fn pool_settings(&self) -> Result<PoolSettings> {
        let extra_roots = match &self.extra_root_ca {
            Some(path) => load_pem_certificates(path)
                .with_context(|| format!("Failed to load extra root CA from {:?}", path))?,
            None => Vec::new(),
        };

        Ok(PoolSettings {
            connect: self.connect.strategy(),
            tls: Arc::new(client_tls_config(&extra_roots)?),
            connect_timeout: match self.connect_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        })
    }
}

impl ConnectConfig {
    pub fn strategy(&self) -> ConnectStrategy {
        match self {
            ConnectConfig::System => ConnectStrategy::System,
            ConnectConfig::Nameserver { address } => ConnectStrategy::Nameserver(*address),
            ConnectConfig::Pinned { hosts } => ConnectStrategy::Pinned(hosts.clone()),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 80))
}

fn default_https_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 443))
}

fn default_root_ca_path() -> PathBuf {
    let home = std::env::var("HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".transparent-proxy").join("root-ca.pfx")
}

fn default_ca_subject() -> String {
    "Transparent Proxy Root CA".to_string()
}

fn default_ca_validity_days() -> u64 {
    1000
}

fn default_key_size() -> u32 {
    DEFAULT_KEY_SIZE
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_domain_cert_lifetime_minutes() -> u64 {
    15
}

fn default_grace_period_minutes() -> u64 {
    5
}

fn default_excluded_request_headers() -> Vec<String> {
    DEFAULT_EXCLUDED_REQUEST_HEADERS.iter().map(|h| h.to_string()).collect()
}

fn default_excluded_response_headers() -> Vec<String> {
    DEFAULT_EXCLUDED_RESPONSE_HEADERS.iter().map(|h| h.to_string()).collect()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_response_timeout_secs() -> u64 {
    100
}

fn default_true() -> bool {
    true
}
