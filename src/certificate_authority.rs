//! Certificate authority engine
//!
//! Creates self-signed root certificate authorities and signs per-domain leaf
//! certificates from them. Everything here is pure: inputs in, certificates out.
//! Persistence lives in [`crate::root_ca_store`].
//!
//! Certificates are assembled as `x509-cert` structures and signed with
//! RSASSA-PSS over SHA-256 (MGF1 SHA-256, 32 byte salt) through OpenSSL.

use crate::error::CertificateError;
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::rsa::{Padding, Rsa};
use openssl::sign::{RsaPssSaltlen, Signer};
use openssl::x509::X509;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::certificate::{Certificate, TbsCertificate, Version};
use x509_cert::der::asn1::{
    Any, BitString, GeneralizedTime, Ia5String, OctetString, SetOfVec, UtcTime,
};
use x509_cert::der::oid::{AssociatedOid, ObjectIdentifier};
use x509_cert::der::{Decode, Encode, Tag};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages,
    SubjectAltName, SubjectKeyIdentifier,
};
use x509_cert::ext::Extension;
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};
use x509_parser::extensions::{GeneralName as ParsedGeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509Certificate};

/// RSA modulus size used when the caller does not ask for another one.
pub const DEFAULT_KEY_SIZE: u32 = 2048;

/// RSA modulus sizes accepted for root and leaf keys.
pub const SUPPORTED_KEY_SIZES: [u32; 3] = [2048, 3072, 4096];

/// Backdating applied to every `notBefore` so fresh certificates survive small clock skew.
pub const VALIDITY_MARGIN: Duration = Duration::from_secs(1);

/// `id-RSASSA-PSS`, the signature algorithm of every certificate minted here.
pub const RSASSA_PSS_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.10");

const COMMON_NAME_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const SERVER_AUTH_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.1");

/// RSASSA-PSS-params: SHA-256, MGF1 with SHA-256, 32 byte salt, default trailer.
const RSASSA_PSS_SHA256_PARAMS: [u8; 54] = [
    0x30, 0x34, //
    0xa0, 0x0f, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, //
    0xa1, 0x1c, 0x30, 0x1a, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x08,
    0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05, 0x00, //
    0xa2, 0x03, 0x02, 0x01, 0x20,
];

/// A root certificate authority together with its private key.
///
/// The key is always present: archives without one are rejected at import,
/// so every value of this type can sign leaves.
pub struct RootCertificateAuthority {
    cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
    key: PKey<Private>,
    subject: Name,
    key_id: Vec<u8>,
}

/// A leaf certificate minted for a single domain name.
pub struct DomainCertificate {
    domain: String,
    cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
    serial: Vec<u8>,
    not_before: SystemTime,
    not_after: SystemTime,
    certified_key: Arc<CertifiedKey>,
}

/// Fields of an X.509 certificate worth looking at in logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub serial: Vec<u8>,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    pub is_ca: bool,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

struct GeneratedKey {
    pkey: PKey<Private>,
    pkcs8: PrivatePkcs8KeyDer<'static>,
    spki: SubjectPublicKeyInfoOwned,
}

impl RootCertificateAuthority {
    /// Create a self-signed root with subject and issuer `CN=<subject_name>`.
    ///
    /// The certificate is valid from one second ago until `now + validity`.
    pub fn create(
        subject_name: &str,
        validity: Duration,
        key_size: u32,
    ) -> Result<Self, CertificateError> {
        let key = generate_rsa_key(key_size)?;
        let subject = common_name(subject_name)?;
        let key_id = key_identifier(&key.spki);

        let extensions = vec![
            extension(
                &BasicConstraints {
                    ca: true,
                    path_len_constraint: None,
                },
                true,
            )?,
            extension(&KeyUsage(KeyUsages::KeyCertSign | KeyUsages::CRLSign), true)?,
            extension(&SubjectKeyIdentifier(octets(&key_id)?), false)?,
        ];

        let tbs = tbs_certificate(
            &random_serial(),
            subject.clone(),
            subject.clone(),
            key.spki,
            validity_window(validity)?,
            extensions,
        )?;
        let cert_der = sign_certificate(tbs, &key.pkey)?;

        tracing::debug!(subject = %subject_name, key_size, "Created root certificate authority");

        Ok(Self {
            cert_der,
            key_der: key.pkcs8,
            key: key.pkey,
            subject,
            key_id,
        })
    }

    /// Sign a fresh leaf certificate for `domain` with a newly generated key.
    pub fn generate_domain_certificate(
        &self,
        domain: &str,
        validity: Duration,
        key_size: u32,
    ) -> Result<DomainCertificate, CertificateError> {
        let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        if domain.is_empty() {
            return Err(CertificateError::InvalidDomain(domain));
        }

        let san = match domain.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => GeneralName::IpAddress(octets(&ip.octets())?),
            Ok(IpAddr::V6(ip)) => GeneralName::IpAddress(octets(&ip.octets())?),
            Err(_) => GeneralName::DnsName(
                Ia5String::new(&domain)
                    .map_err(|_| CertificateError::InvalidDomain(domain.clone()))?,
            ),
        };
        let subject =
            common_name(&domain).map_err(|_| CertificateError::InvalidDomain(domain.clone()))?;

        let key = generate_rsa_key(key_size)?;
        let serial = random_serial();
        let (not_before, not_after) = validity_window(validity)?;

        let extensions = vec![
            extension(&SubjectAltName(vec![san]), false)?,
            extension(&ExtendedKeyUsage(vec![SERVER_AUTH_OID]), false)?,
            extension(
                &KeyUsage(KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment),
                false,
            )?,
            extension(
                &AuthorityKeyIdentifier {
                    key_identifier: Some(octets(&self.key_id)?),
                    authority_cert_issuer: None,
                    authority_cert_serial_number: None,
                },
                false,
            )?,
        ];

        let tbs = tbs_certificate(
            &serial,
            self.subject.clone(),
            subject,
            key.spki,
            (not_before, not_after),
            extensions,
        )?;
        let cert_der = sign_certificate(tbs, &self.key)?;

        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(
            &PrivateKeyDer::Pkcs8(key.pkcs8.clone_key()),
        )
        .map_err(|e| CertificateError::signing(e.to_string()))?;
        let certified_key = Arc::new(CertifiedKey::new(
            vec![cert_der.clone(), self.cert_der.clone()],
            signing_key,
        ));

        Ok(DomainCertificate {
            domain,
            cert_der,
            key_der: key.pkcs8,
            serial,
            not_before,
            not_after,
            certified_key,
        })
    }

    /// Serialize certificate and key into a PKCS#12 archive.
    pub fn export_to_archive(&self, password: Option<&str>) -> Result<Vec<u8>, CertificateError> {
        build_archive("root-ca", &self.cert_der, &self.key_der, password)
    }

    /// Load a root from a PKCS#12 archive produced by [`Self::export_to_archive`]
    /// or any third-party tool.
    pub fn import_from_archive(
        archive: &[u8],
        password: Option<&str>,
    ) -> Result<Self, CertificateError> {
        let parsed = Pkcs12::from_der(archive)
            .and_then(|p12| p12.parse2(password.unwrap_or("")))
            .map_err(|e| CertificateError::archive(e.to_string()))?;

        Self::from_parts(parsed.cert, parsed.pkey)
    }

    fn from_parts(cert: Option<X509>, pkey: Option<PKey<Private>>) -> Result<Self, CertificateError> {
        let cert = cert.ok_or_else(|| CertificateError::archive("archive holds no certificate"))?;
        let pkey = pkey.ok_or(CertificateError::MissingPrivateKey)?;

        let public_key = cert
            .public_key()
            .map_err(|e| CertificateError::archive(e.to_string()))?;
        if !public_key.public_eq(&pkey) {
            return Err(CertificateError::archive(
                "private key does not match certificate",
            ));
        }
        if pkey.rsa().is_err() {
            return Err(CertificateError::archive("root key is not an RSA key"));
        }

        let cert_der = CertificateDer::from(
            cert.to_der()
                .map_err(|e| CertificateError::archive(e.to_string()))?,
        );
        let key_der = PrivatePkcs8KeyDer::from(
            pkey.private_key_to_pkcs8()
                .map_err(|e| CertificateError::archive(e.to_string()))?,
        );

        let (_, view) = X509Certificate::from_der(&cert_der)
            .map_err(|e| CertificateError::archive(e.to_string()))?;
        if !view.is_ca() {
            return Err(CertificateError::archive(
                "certificate is not a certificate authority",
            ));
        }

        let decoded = Certificate::from_der(&cert_der)
            .map_err(|e| CertificateError::archive(e.to_string()))?;
        let key_id = view
            .iter_extensions()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::SubjectKeyIdentifier(kid) => Some(kid.0.to_vec()),
                _ => None,
            })
            .unwrap_or_else(|| key_identifier(&decoded.tbs_certificate.subject_public_key_info));

        Ok(Self {
            cert_der,
            key_der,
            key: pkey,
            subject: decoded.tbs_certificate.subject,
            key_id,
        })
    }

    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// PEM encoding of the certificate alone, for installing into trust stores.
    pub fn to_pem(&self) -> Result<String, CertificateError> {
        let cert = X509::from_der(&self.cert_der)
            .map_err(|e| CertificateError::archive(e.to_string()))?;
        let pem = cert
            .to_pem()
            .map_err(|e| CertificateError::archive(e.to_string()))?;
        String::from_utf8(pem).map_err(|e| CertificateError::archive(e.to_string()))
    }

    pub fn info(&self) -> Result<CertificateInfo, CertificateError> {
        inspect(&self.cert_der)
    }
}

impl fmt::Debug for RootCertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootCertificateAuthority")
            .field("subject", &self.subject.to_string())
            .finish_non_exhaustive()
    }
}

impl DomainCertificate {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn private_key_der(&self) -> &PrivatePkcs8KeyDer<'static> {
        &self.key_der
    }

    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    pub fn not_before(&self) -> SystemTime {
        self.not_before
    }

    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }

    /// Leaf plus issuing root, bound to the leaf's signing key, ready for rustls.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified_key.clone()
    }

    pub fn export_to_archive(&self, password: Option<&str>) -> Result<Vec<u8>, CertificateError> {
        build_archive(&self.domain, &self.cert_der, &self.key_der, password)
    }
}

impl fmt::Debug for DomainCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainCertificate")
            .field("domain", &self.domain)
            .field("serial", &self.serial)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Parse a DER certificate into the fields the proxy cares about.
pub fn inspect(der: &[u8]) -> Result<CertificateInfo, CertificateError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| CertificateError::archive(format!("unparseable certificate: {e}")))?;

    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                ParsedGeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                ParsedGeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        ip_addresses.push(ip);
                    }
                }
                _ => {}
            }
        }
    }

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        serial: cert.raw_serial().to_vec(),
        not_before: system_time_from_unix(cert.validity().not_before.timestamp()),
        not_after: system_time_from_unix(cert.validity().not_after.timestamp()),
        is_ca: cert.is_ca(),
        dns_names,
        ip_addresses,
    })
}

fn generate_rsa_key(bits: u32) -> Result<GeneratedKey, CertificateError> {
    if !SUPPORTED_KEY_SIZES.contains(&bits) {
        return Err(CertificateError::key_generation(format!(
            "unsupported RSA key size {bits}, expected one of {SUPPORTED_KEY_SIZES:?}"
        )));
    }

    let pkey = Rsa::generate(bits)
        .and_then(PKey::from_rsa)
        .map_err(|e| CertificateError::key_generation(e.to_string()))?;
    let pkcs8 = pkey
        .private_key_to_pkcs8()
        .map_err(|e| CertificateError::key_generation(e.to_string()))?;
    let spki_der = pkey
        .public_key_to_der()
        .map_err(|e| CertificateError::key_generation(e.to_string()))?;
    let spki = SubjectPublicKeyInfoOwned::from_der(&spki_der)
        .map_err(|e| CertificateError::key_generation(e.to_string()))?;

    Ok(GeneratedKey {
        pkey,
        pkcs8: PrivatePkcs8KeyDer::from(pkcs8),
        spki,
    })
}

fn tbs_certificate(
    serial: &[u8],
    issuer: Name,
    subject: Name,
    spki: SubjectPublicKeyInfoOwned,
    (not_before, not_after): (SystemTime, SystemTime),
    extensions: Vec<Extension>,
) -> Result<TbsCertificate, CertificateError> {
    Ok(TbsCertificate {
        version: Version::V3,
        serial_number: SerialNumber::new(serial).map_err(der_error)?,
        signature: rsa_pss_sha256()?,
        issuer,
        validity: Validity {
            not_before: asn1_time(not_before)?,
            not_after: asn1_time(not_after)?,
        },
        subject,
        subject_public_key_info: spki,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: Some(extensions),
    })
}

fn sign_certificate(
    tbs: TbsCertificate,
    issuer_key: &PKeyRef<Private>,
) -> Result<CertificateDer<'static>, CertificateError> {
    let tbs_der = tbs.to_der().map_err(der_error)?;
    let signature = sign_pss_sha256(issuer_key, &tbs_der)
        .map_err(|e| CertificateError::signing(e.to_string()))?;

    let certificate = Certificate {
        signature_algorithm: tbs.signature.clone(),
        tbs_certificate: tbs,
        signature: BitString::from_bytes(&signature).map_err(der_error)?,
    };
    certificate
        .to_der()
        .map(CertificateDer::from)
        .map_err(der_error)
}

fn sign_pss_sha256(
    key: &PKeyRef<Private>,
    data: &[u8],
) -> Result<Vec<u8>, openssl::error::ErrorStack> {
    let mut signer = Signer::new(MessageDigest::sha256(), key)?;
    signer.set_rsa_padding(Padding::PKCS1_PSS)?;
    signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
    signer.set_rsa_mgf1_md(MessageDigest::sha256())?;
    signer.sign_oneshot_to_vec(data)
}

fn rsa_pss_sha256() -> Result<AlgorithmIdentifierOwned, CertificateError> {
    Ok(AlgorithmIdentifierOwned {
        oid: RSASSA_PSS_OID,
        parameters: Some(Any::from_der(&RSASSA_PSS_SHA256_PARAMS).map_err(der_error)?),
    })
}

fn extension<E: AssociatedOid + Encode>(
    value: &E,
    critical: bool,
) -> Result<Extension, CertificateError> {
    Ok(Extension {
        extn_id: E::OID,
        critical,
        extn_value: octets(&value.to_der().map_err(der_error)?)?,
    })
}

fn common_name(name: &str) -> Result<Name, CertificateError> {
    let value = Any::new(Tag::Utf8String, name.as_bytes()).map_err(der_error)?;
    let rdn = SetOfVec::try_from(vec![AttributeTypeAndValue {
        oid: COMMON_NAME_OID,
        value,
    }])
    .map_err(der_error)?;
    Ok(RdnSequence(vec![RelativeDistinguishedName(rdn)]))
}

/// SHA-1 over the subject public key bits (RFC 5280 §4.2.1.2, method 1).
fn key_identifier(spki: &SubjectPublicKeyInfoOwned) -> Vec<u8> {
    openssl::sha::sha1(spki.subject_public_key.raw_bytes()).to_vec()
}

fn octets(bytes: &[u8]) -> Result<OctetString, CertificateError> {
    OctetString::new(bytes).map_err(der_error)
}

/// 128 random bits from a v4 UUID; the leading byte is kept in `1..=0x7f` so
/// the DER integer is positive and minimally encoded.
fn random_serial() -> Vec<u8> {
    let mut bytes = uuid::Uuid::new_v4().into_bytes().to_vec();
    bytes[0] = (bytes[0] & 0x7f).max(1);
    bytes
}

fn validity_window(validity: Duration) -> Result<(SystemTime, SystemTime), CertificateError> {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| CertificateError::signing(e.to_string()))?;
    let now = UNIX_EPOCH + Duration::from_secs(since_epoch.as_secs());
    let not_after = now
        .checked_add(Duration::from_secs(validity.as_secs()))
        .ok_or_else(|| CertificateError::signing("validity out of range"))?;
    Ok((now - VALIDITY_MARGIN, not_after))
}

/// UTCTime through 2049, GeneralizedTime afterwards (RFC 5280 §4.1.2.5).
fn asn1_time(at: SystemTime) -> Result<Time, CertificateError> {
    match UtcTime::from_system_time(at) {
        Ok(utc) => Ok(Time::UtcTime(utc)),
        Err(_) => GeneralizedTime::from_system_time(at)
            .map(Time::GeneralTime)
            .map_err(|e| CertificateError::signing(format!("validity out of range: {e}"))),
    }
}

fn der_error(e: x509_cert::der::Error) -> CertificateError {
    CertificateError::signing(e.to_string())
}

fn build_archive(
    name: &str,
    cert_der: &CertificateDer<'_>,
    key_der: &PrivatePkcs8KeyDer<'_>,
    password: Option<&str>,
) -> Result<Vec<u8>, CertificateError> {
    let cert = X509::from_der(cert_der).map_err(|e| CertificateError::archive(e.to_string()))?;
    let pkey = PKey::private_key_from_pkcs8(key_der.secret_pkcs8_der())
        .map_err(|e| CertificateError::archive(e.to_string()))?;

    Pkcs12::builder()
        .name(name)
        .pkey(&pkey)
        .cert(&cert)
        .build2(password.unwrap_or(""))
        .and_then(|p12| p12.to_der())
        .map_err(|e| CertificateError::archive(e.to_string()))
}

fn system_time_from_unix(seconds: i64) -> SystemTime {
    if seconds >= 0 {
        UNIX_EPOCH + Duration::from_secs(seconds as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(seconds.unsigned_abs())
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}
