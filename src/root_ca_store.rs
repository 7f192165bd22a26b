//! Root CA bootstrap
//!
//! Loads the root certificate authority from its PKCS#12 file, or creates and
//! persists one on first run.

use crate::certificate_authority::RootCertificateAuthority;
use crate::proxy_config::TlsConfig;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Load the configured root CA, creating it first if allowed and missing.
pub fn load_or_create(config: &TlsConfig) -> Result<RootCertificateAuthority> {
    let path = &config.root_ca_path;
    let password = config.root_ca_password.as_deref();

    if path.exists() {
        tracing::info!("Loading root CA from {:?}", path);
        return load(path, password);
    }

    if !config.generate_ca {
        anyhow::bail!(
            "Root CA {:?} does not exist and generation is disabled; create one with `transparent-proxy create-ca`",
            path
        );
    }

    tracing::info!(subject = %config.ca_subject, "Generating new root CA");
    let root = RootCertificateAuthority::create(
        &config.ca_subject,
        config.ca_validity()?,
        config.ca_key_size,
    )
    .context("Failed to create root CA")?;

    save(&root, path, password)?;
    let pem_path = save_pem(&root, &pem_path_for(path))?;

    tracing::info!("Root CA saved to {:?}", path);
    tracing::warn!("Install the root CA certificate to trust HTTPS interception:");
    tracing::warn!("  macOS: sudo security add-trusted-cert -d -r trustRoot -k /Library/Keychains/System.keychain {:?}", pem_path);
    tracing::warn!("  Linux: sudo cp {:?} /usr/local/share/ca-certificates/transparent-proxy.crt && sudo update-ca-certificates", pem_path);

    Ok(root)
}

/// Read a root CA from a PKCS#12 file.
pub fn load(path: &Path, password: Option<&str>) -> Result<RootCertificateAuthority> {
    let archive = fs::read(path).with_context(|| format!("Failed to read root CA {:?}", path))?;
    RootCertificateAuthority::import_from_archive(&archive, password)
        .with_context(|| format!("Failed to import root CA {:?}", path))
}

/// Write the root CA as a PKCS#12 file readable only by the owner.
pub fn save(root: &RootCertificateAuthority, path: &Path, password: Option<&str>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context("Failed to create root CA directory")?;
    }

    let archive = root
        .export_to_archive(password)
        .context("Failed to export root CA")?;
    fs::write(path, archive).context("Failed to write root CA")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("Failed to set root CA permissions")?;
    }

    Ok(())
}

/// Write the certificate alone as PEM, for trust-store installation.
pub fn save_pem(root: &RootCertificateAuthority, path: &Path) -> Result<PathBuf> {
    let pem = root.to_pem().context("Failed to encode root CA as PEM")?;
    fs::write(path, pem).context("Failed to write root CA PEM")?;
    Ok(path.to_path_buf())
}

/// `root-ca.pfx` -> `root-ca.pem`
pub fn pem_path_for(archive_path: &Path) -> PathBuf {
    archive_path.with_extension("pem")
}
