//! Certificate authority for the quickstart cluster
//!
//! The authority is created once per run under the target's `ca/` directory.
//! Every component role then gets its own key pair: the component side builds
//! a CSR, the authority signs it, and the resulting files land in the
//! authority's output directories:
//!
//! ```text
//! ca/
//!   ca-material/ca-cert.pem
//!   ca-material/ca-key.pem
//!   out-priv/<slug>-priv-key.pem
//!   out-pub/<slug>-pub-key.pem      (server only)
//!   out-cert/<slug>-cert.pem
//! ```
//!
//! Output files are created exclusively and never overwritten. Copying them
//! into the component directories is the distributor's job.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(test)]
use mockall::automock;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use thiserror::Error;
use tracing::{debug, info};
use x509_parser::prelude::*;

use crate::topology::Role;

/// Validity period for the authority certificate
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Validity period for component certificates
pub const CERT_VALIDITY_YEARS: i64 = 1;

/// Organization written into every subject
pub const ORGANIZATION: &str = "Zato quickstart";

/// Common name of the authority certificate
pub const CA_COMMON_NAME: &str = "Zato quickstart CA";

/// Names every component certificate is valid for
pub const COMPONENT_SANS: [&str; 2] = ["localhost", "127.0.0.1"];

const CA_MATERIAL_DIR: &str = "ca-material";
const CA_CERT_FILE: &str = "ca-cert.pem";
const CA_KEY_FILE: &str = "ca-key.pem";
const OUT_PRIV_DIR: &str = "out-priv";
const OUT_PUB_DIR: &str = "out-pub";
const OUT_CERT_DIR: &str = "out-cert";

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// The authority directory already holds material
    #[error("authority directory already contains material: {0}")]
    DirectoryExists(PathBuf),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Validity and subject of a certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// Subject organization
    pub organization: String,
    /// Whether the certificate may sign others
    pub is_ca: bool,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let organization = cert
            .subject()
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok())
            .unwrap_or("")
            .to_string();

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            organization,
            is_ca: cert.is_ca(),
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }

    /// Check if certificate has expired
    pub fn is_expired(&self) -> bool {
        ::time::OffsetDateTime::now_utc().unix_timestamp() >= self.not_after
    }
}

/// Check that `cert_pem` carries a valid signature from the authority in `ca_cert_pem`
pub fn verify_issued(cert_pem: &str, ca_cert_pem: &str) -> Result<bool> {
    let cert_der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let ca_cert_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

    Ok(cert.verify_signature(Some(ca_cert.public_key())).is_ok())
}

/// In-memory authority: key and certificate, both PEM-encoded
#[derive(Clone)]
pub struct CertificateAuthority {
    ca_key_pem: String,
    ca_cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_key_pem", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem: key_pair.serialize_pem(),
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load CA from PEM
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        parse_pem(cert_pem)?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// The CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// The CA private key in PEM format
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Validity and subject of the CA certificate
    pub fn cert_info(&self) -> Result<CertificateInfo> {
        CertificateInfo::from_pem(&self.ca_cert_pem)
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Sign a component CSR and return the certificate in PEM format
    ///
    /// Only the public key is taken from the CSR. Subject, validity and
    /// extensions are set here.
    pub fn sign_csr(&self, csr_pem: &str, role: Role) -> Result<String> {
        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem).map_err(|e| {
            PkiError::ParseError(format!("failed to parse CSR for {}: {}", role, e))
        })?;

        csr_params.params.distinguished_name = distinguished_name(&role.common_name());
        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        csr_params.params.not_before = not_before;
        csr_params.params.not_after = not_after;
        csr_params.params.subject_alt_names = subject_alt_names(&COMPONENT_SANS)?;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let signed = csr_params.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "failed to sign certificate for {}: {}",
                role, e
            ))
        })?;

        Ok(signed.pem())
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

fn subject_alt_names(sans: &[&str]) -> Result<Vec<SanType>> {
    sans.iter()
        .map(|san| {
            if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                Ok(SanType::IpAddress(ip))
            } else {
                Ia5String::try_from(san.to_string())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        PkiError::CertificateGenerationFailed(format!(
                            "invalid DNS name '{}': {}",
                            san, e
                        ))
                    })
            }
        })
        .collect()
}

/// Key pair and CSR generated on the component side
pub struct ComponentCertRequest {
    key_pair: KeyPair,
    csr_pem: String,
}

impl ComponentCertRequest {
    /// Generate a new key pair and CSR for a role
    pub fn new(role: Role) -> Result<Self> {
        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate {} key: {}", role, e))
        })?;

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&role.common_name());

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CSR: {}", e))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to serialize CSR: {}", e))
        })?;

        Ok(Self { key_pair, csr_pem })
    }

    /// The CSR in PEM format
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// The private key in PEM format
    pub fn private_key_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }

    /// The public key in PEM format
    pub fn public_key_pem(&self) -> String {
        self.key_pair.public_key_pem()
    }
}

/// A created authority: its directory, material and loaded key
#[derive(Clone, Debug)]
pub struct AuthorityHandle {
    dir: PathBuf,
    ca: CertificateAuthority,
}

impl AuthorityHandle {
    /// Wrap an authority living under `dir`
    pub fn new(dir: PathBuf, ca: CertificateAuthority) -> Self {
        Self { dir, ca }
    }

    /// Authority root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The in-memory authority
    pub fn authority(&self) -> &CertificateAuthority {
        &self.ca
    }

    /// Path of the authority certificate, shared by all roles as the chain
    pub fn chain_path(&self) -> PathBuf {
        self.dir.join(CA_MATERIAL_DIR).join(CA_CERT_FILE)
    }

    /// Path of the authority private key
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(CA_MATERIAL_DIR).join(CA_KEY_FILE)
    }

    fn private_key_path(&self, role: Role) -> PathBuf {
        self.dir
            .join(OUT_PRIV_DIR)
            .join(format!("{}-priv-key.pem", role.slug()))
    }

    fn public_key_path(&self, role: Role) -> PathBuf {
        self.dir
            .join(OUT_PUB_DIR)
            .join(format!("{}-pub-key.pem", role.slug()))
    }

    fn certificate_path(&self, role: Role) -> PathBuf {
        self.dir
            .join(OUT_CERT_DIR)
            .join(format!("{}-cert.pem", role.slug()))
    }
}

/// Key and certificate files issued to one role
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentIdentity {
    /// Role the identity belongs to
    pub role: Role,
    /// Private key path
    pub private_key: PathBuf,
    /// Public key path, server only
    pub public_key: Option<PathBuf>,
    /// Certificate path
    pub certificate: PathBuf,
}

/// Everything the authority issued during one run
#[derive(Clone, Debug, Default)]
pub struct CryptoArtifactSet {
    chain: PathBuf,
    identities: BTreeMap<Role, ComponentIdentity>,
}

impl CryptoArtifactSet {
    /// Start an empty set around the shared chain certificate
    pub fn new(chain: PathBuf) -> Self {
        Self {
            chain,
            identities: BTreeMap::new(),
        }
    }

    /// Authority certificate shared by all roles
    pub fn chain(&self) -> &Path {
        &self.chain
    }

    /// Record a role's identity
    pub fn insert(&mut self, identity: ComponentIdentity) {
        self.identities.insert(identity.role, identity);
    }

    /// Identity issued to `role`, if any
    pub fn get(&self, role: Role) -> Option<&ComponentIdentity> {
        self.identities.get(&role)
    }

    /// Number of issued identities
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Whether nothing was issued yet
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// Creates the authority and issues component identities
///
/// The seam the orchestrator calls through, so tests can substitute failures.
#[cfg_attr(test, automock)]
pub trait IdentityAuthority: Send + Sync {
    /// Create the root material under an existing, empty `dir`
    fn create_authority(&self, dir: &Path) -> Result<AuthorityHandle>;

    /// Issue a key pair and signed certificate for `role`
    fn issue_component_identity(
        &self,
        authority: &AuthorityHandle,
        role: Role,
    ) -> Result<ComponentIdentity>;
}

/// [`IdentityAuthority`] backed by `rcgen`
#[derive(Clone, Copy, Debug, Default)]
pub struct RcgenAuthority;

impl IdentityAuthority for RcgenAuthority {
    fn create_authority(&self, dir: &Path) -> Result<AuthorityHandle> {
        if fs::read_dir(dir)?.next().is_some() {
            return Err(PkiError::DirectoryExists(dir.to_path_buf()));
        }

        let ca = CertificateAuthority::new(CA_COMMON_NAME)?;
        let handle = AuthorityHandle::new(dir.to_path_buf(), ca);

        fs::create_dir(dir.join(CA_MATERIAL_DIR))?;
        for out in [OUT_PRIV_DIR, OUT_PUB_DIR, OUT_CERT_DIR] {
            fs::create_dir(dir.join(out))?;
        }
        write_new(&handle.key_path(), handle.authority().ca_key_pem(), true)?;
        write_new(&handle.chain_path(), handle.authority().ca_cert_pem(), false)?;

        info!(dir = %dir.display(), "Certificate authority created");
        Ok(handle)
    }

    fn issue_component_identity(
        &self,
        authority: &AuthorityHandle,
        role: Role,
    ) -> Result<ComponentIdentity> {
        let request = ComponentCertRequest::new(role)?;
        let cert_pem = authority.authority().sign_csr(request.csr_pem(), role)?;

        let private_key = authority.private_key_path(role);
        let certificate = authority.certificate_path(role);
        write_new(&private_key, &request.private_key_pem(), true)?;
        write_new(&certificate, &cert_pem, false)?;

        let public_key = if role.needs_public_key() {
            let path = authority.public_key_path(role);
            write_new(&path, &request.public_key_pem(), false)?;
            Some(path)
        } else {
            None
        };

        debug!(role = %role, cert = %certificate.display(), "Issued component identity");
        Ok(ComponentIdentity {
            role,
            private_key,
            public_key,
            certificate,
        })
    }
}

/// Write `content` to a file that must not exist yet
fn write_new(path: &Path, content: &str, private: bool) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(if private { 0o600 } else { 0o644 });
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    Ok(())
}
