//! Transparent Proxy - TLS-intercepting HTTP(S) forwarder
//!
//! Requests reach the proxy because the client resolves upstream host names
//! to it (hosts file or DNS). The proxy answers the TLS handshake with a leaf
//! certificate minted for the requested name and signed by its own root CA,
//! then replays the decrypted request against the real upstream.
//!
//! ## Usage
//!
//! ### Serve (default)
//! ```bash
//! transparent-proxy serve --config proxy.toml
//! # or just
//! transparent-proxy
//! ```
//!
//! ### Create a root CA
//! ```bash
//! transparent-proxy create-ca --subject "My Proxy CA" --output root-ca.pfx --years 3 --pem
//! ```
//!
//! The root CA certificate must be trusted by clients for interception to
//! work without certificate errors.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use transparent_proxy::certificate_authority::{DEFAULT_KEY_SIZE, RootCertificateAuthority};
use transparent_proxy::jsonl_tracing_layer::JsonlTracingLayer;
use transparent_proxy::log_writer::LogWriter;
use transparent_proxy::{ProxyConfig, ProxyServer, root_ca_store};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Parser, Debug)]
#[command(name = "transparent-proxy")]
#[command(about = "TLS-intercepting transparent HTTP(S) proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy (default)
    Serve {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// HTTP listen port (overrides config)
        #[arg(long)]
        http_port: Option<u16>,
        /// HTTPS listen port (overrides config)
        #[arg(long)]
        https_port: Option<u16>,
    },
    /// Create a root CA and write it as a PKCS#12 archive
    CreateCa {
        /// Subject common name
        #[arg(short, long)]
        subject: String,
        /// Output archive path
        #[arg(short, long)]
        output: PathBuf,
        /// Validity in days
        #[arg(long, conflicts_with = "years")]
        days: Option<u64>,
        /// Validity in years
        #[arg(long)]
        years: Option<u64>,
        /// RSA key size in bits
        #[arg(long, default_value_t = DEFAULT_KEY_SIZE)]
        key_size: u32,
        /// Archive password
        #[arg(long)]
        password: Option<String>,
        /// Also write the certificate as PEM next to the archive
        #[arg(long)]
        pem: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::CreateCa {
            subject,
            output,
            days,
            years,
            key_size,
            password,
            pem,
        }) => {
            init_tracing(None)?;
            run_create_ca(&subject, &output, validity(days, years)?, key_size, password.as_deref(), pem)
        }
        Some(Commands::Serve {
            config,
            http_port,
            https_port,
        }) => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(run_proxy_server(config, http_port, https_port)),
        None => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(run_proxy_server(None, None, None)),
    }
}

fn validity(days: Option<u64>, years: Option<u64>) -> Result<Duration> {
    let days = match (days, years) {
        (Some(days), _) => days,
        (None, Some(years)) => years
            .checked_mul(365)
            .with_context(|| format!("--years {years} is out of range"))?,
        (None, None) => 1000,
    };
    days.checked_mul(DAY.as_secs())
        .map(Duration::from_secs)
        .with_context(|| format!("a validity of {days} days is out of range"))
}

fn init_tracing(jsonl_dir: Option<PathBuf>) -> Result<()> {
    let jsonl_layer = match jsonl_dir {
        Some(dir) => {
            let log_writer = LogWriter::new(dir)
                .map_err(|e| anyhow::anyhow!("Failed to create LogWriter: {}", e))?;
            Some(JsonlTracingLayer::new(log_writer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(jsonl_layer)
        .init();

    Ok(())
}

fn run_create_ca(
    subject: &str,
    output: &Path,
    validity: Duration,
    key_size: u32,
    password: Option<&str>,
    pem: bool,
) -> Result<()> {
    let root = RootCertificateAuthority::create(subject, validity, key_size)
        .context("Failed to create root CA")?;
    root_ca_store::save(&root, output, password)?;
    tracing::info!("Root CA written to {:?}", output);

    if pem {
        let pem_path = root_ca_store::save_pem(&root, &root_ca_store::pem_path_for(output))?;
        tracing::info!("Root CA certificate written to {:?}", pem_path);
    }

    Ok(())
}

async fn run_proxy_server(
    config_path: Option<PathBuf>,
    http_port: Option<u16>,
    https_port: Option<u16>,
) -> Result<()> {
    // Load configuration
    let mut config = if let Some(path) = config_path {
        let mut config = ProxyConfig::from_file(path)?;
        config.apply_env();
        config
    } else {
        ProxyConfig::from_env()
    };

    if let Some(port) = http_port {
        config.listen.http_addr.set_port(port);
    }
    if let Some(port) = https_port {
        config.listen.https_addr.set_port(port);
    }

    init_tracing(config.logging.jsonl_dir.clone())?;
    tracing::info!("Starting Transparent Proxy");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C");
        }
        signal_token.cancel();
    });

    let proxy = ProxyServer::new(config)?;
    proxy.run(shutdown).await?;

    Ok(())
}
