//! Certificate bootstrap for machine and apiserver TLS
//!
//! One CA per workstation lives in `<home>/certs/` and signs the client
//! pair plus a per-machine server certificate. Generation happens exactly
//! once across parallel operations: the fast path short-circuits when every
//! file exists and validates, the slow path holds the cross-process
//! `machine_client.lock` and re-checks before generating. Every file is
//! written via tmp + fsync + rename so no partial PEM is ever observable.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use x509_parser::prelude::*;

use crate::lock::FileLock;
use crate::{Error, Result};

/// How long cert bootstrap waits for the cross-process lock.
const CERT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS dial timeout for [`validate_certificate`].
const VALIDATE_DIAL_TIMEOUT: Duration = Duration::from_secs(40);

/// Organization name stamped into every generated certificate.
const ORG_NAME: &str = "system:masters";

/// Paths of the certificate set for one machine.
#[derive(Debug, Clone)]
pub struct AuthOptions {
    /// Directory holding the shared CA and client pair.
    pub certs_dir: PathBuf,
    /// Machine name, used to derive per-machine server cert paths.
    pub machine_name: String,
}

impl AuthOptions {
    /// Auth options rooted at a certs directory for one machine.
    pub fn new(certs_dir: impl Into<PathBuf>, machine_name: impl Into<String>) -> AuthOptions {
        AuthOptions {
            certs_dir: certs_dir.into(),
            machine_name: machine_name.into(),
        }
    }

    /// CA certificate path.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.certs_dir.join("ca.pem")
    }

    /// CA private key path.
    pub fn ca_key_path(&self) -> PathBuf {
        self.certs_dir.join("ca-key.pem")
    }

    /// Client certificate path.
    pub fn client_cert_path(&self) -> PathBuf {
        self.certs_dir.join("cert.pem")
    }

    /// Client private key path.
    pub fn client_key_path(&self) -> PathBuf {
        self.certs_dir.join("key.pem")
    }

    /// Per-machine server certificate path.
    pub fn server_cert_path(&self) -> PathBuf {
        self.certs_dir.join(format!("{}-server.pem", self.machine_name))
    }

    /// Per-machine server key path.
    pub fn server_key_path(&self) -> PathBuf {
        self.certs_dir.join(format!("{}-server-key.pem", self.machine_name))
    }
}

/// Generate (or verify) the CA, client and server certificates.
///
/// Idempotent: when the full set exists and validates against the CA (and
/// the server cert covers `machine_ip`), nothing is written. Otherwise the
/// cross-process lock is taken (≤5 s), existence is re-checked, and only
/// the missing or stale pieces are generated.
pub async fn bootstrap(auth: &AuthOptions, lock_path: &Path, machine_ip: IpAddr) -> Result<()> {
    if validate_set(auth, machine_ip).await.unwrap_or(false) {
        debug!(dir = %auth.certs_dir.display(), "certificates already valid");
        return Ok(());
    }

    let _lock = FileLock::acquire(lock_path, CERT_LOCK_TIMEOUT)
        .await
        .map_err(|e| Error::cert_bootstrap(format!("acquiring lock: {}", e)))?;

    // Another process may have finished while we waited for the lock.
    if validate_set(auth, machine_ip).await.unwrap_or(false) {
        return Ok(());
    }

    tokio::fs::create_dir_all(&auth.certs_dir).await?;

    let (ca_cert_pem, ca_key) = ensure_ca(auth).await?;
    let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, ca_key)
        .map_err(|e| Error::cert_bootstrap(format!("loading CA as issuer: {}", e)))?;

    ensure_client_pair(auth, &issuer).await?;
    ensure_server_pair(auth, &issuer, machine_ip).await?;

    info!(dir = %auth.certs_dir.display(), "certificates bootstrapped");
    Ok(())
}

/// Load the CA pair, generating it when absent or unparseable.
async fn ensure_ca(auth: &AuthOptions) -> Result<(String, KeyPair)> {
    if let (Ok(cert_pem), Ok(key_pem)) = (
        tokio::fs::read_to_string(auth.ca_cert_path()).await,
        tokio::fs::read_to_string(auth.ca_key_path()).await,
    ) {
        if let Ok(key) = KeyPair::from_pem(&key_pem) {
            if parse_cert_pem(&cert_pem).is_ok() {
                return Ok((cert_pem, key));
            }
        }
    }

    debug!("generating CA");
    let key = KeyPair::generate()
        .map_err(|e| Error::cert_bootstrap(format!("generating CA key: {}", e)))?;

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name("minikubeCA");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    set_validity(&mut params);

    let cert = params
        .self_signed(&key)
        .map_err(|e| Error::cert_bootstrap(format!("creating CA cert: {}", e)))?;
    let cert_pem = cert.pem();

    write_pem_atomic(&auth.ca_cert_path(), cert_pem.as_bytes()).await?;
    write_pem_atomic(&auth.ca_key_path(), key.serialize_pem().as_bytes()).await?;
    Ok((cert_pem, key))
}

async fn ensure_client_pair(auth: &AuthOptions, issuer: &Issuer<'_, KeyPair>) -> Result<()> {
    if client_pair_valid(auth).await {
        return Ok(());
    }

    debug!("generating client certificate");
    let key = KeyPair::generate()
        .map_err(|e| Error::cert_bootstrap(format!("generating client key: {}", e)))?;

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name("minikube-user");
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    set_validity(&mut params);

    let cert = params
        .signed_by(&key, issuer)
        .map_err(|e| Error::cert_bootstrap(format!("signing client cert: {}", e)))?;

    write_pem_atomic(&auth.client_cert_path(), cert.pem().as_bytes()).await?;
    write_pem_atomic(&auth.client_key_path(), key.serialize_pem().as_bytes()).await?;
    Ok(())
}

async fn ensure_server_pair(
    auth: &AuthOptions,
    issuer: &Issuer<'_, KeyPair>,
    machine_ip: IpAddr,
) -> Result<()> {
    if server_pair_valid(auth, machine_ip).await {
        return Ok(());
    }

    debug!(ip = %machine_ip, "generating server certificate");
    let key = KeyPair::generate()
        .map_err(|e| Error::cert_bootstrap(format!("generating server key: {}", e)))?;

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(&auth.machine_name);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.subject_alt_names = vec![
        SanType::IpAddress(machine_ip),
        SanType::IpAddress(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
        SanType::DnsName(Ia5String::try_from("localhost").expect("valid DNS name")),
    ];
    set_validity(&mut params);

    let cert = params
        .signed_by(&key, issuer)
        .map_err(|e| Error::cert_bootstrap(format!("signing server cert: {}", e)))?;

    write_pem_atomic(&auth.server_cert_path(), cert.pem().as_bytes()).await?;
    write_pem_atomic(&auth.server_key_path(), key.serialize_pem().as_bytes()).await?;
    Ok(())
}

/// Whether the full set exists and is self-consistent.
async fn validate_set(auth: &AuthOptions, machine_ip: IpAddr) -> Result<bool> {
    for path in [auth.ca_cert_path(), auth.ca_key_path()] {
        if !path.exists() {
            return Ok(false);
        }
    }
    let ca_pem = tokio::fs::read_to_string(auth.ca_cert_path()).await?;
    if parse_cert_pem(&ca_pem).is_err() {
        return Ok(false);
    }
    Ok(client_pair_valid(auth).await && server_pair_valid(auth, machine_ip).await)
}

async fn client_pair_valid(auth: &AuthOptions) -> bool {
    signed_by_ca(auth, &auth.client_cert_path(), &auth.client_key_path())
        .await
        .unwrap_or(false)
}

async fn server_pair_valid(auth: &AuthOptions, machine_ip: IpAddr) -> bool {
    if !signed_by_ca(auth, &auth.server_cert_path(), &auth.server_key_path())
        .await
        .unwrap_or(false)
    {
        return false;
    }
    // A server cert that doesn't cover the machine IP is stale (the
    // machine got a new address) and must be re-issued.
    match cert_covers_ip(&auth.server_cert_path(), machine_ip).await {
        Ok(covered) => covered,
        Err(_) => false,
    }
}

/// Verify `cert_path` parses and its signature chains to the CA.
async fn signed_by_ca(auth: &AuthOptions, cert_path: &Path, key_path: &Path) -> Result<bool> {
    if !cert_path.exists() || !key_path.exists() {
        return Ok(false);
    }
    let cert_pem = tokio::fs::read_to_string(cert_path).await?;
    let ca_pem = tokio::fs::read_to_string(auth.ca_cert_path()).await?;

    let cert_der = parse_pem_der(&cert_pem)?;
    let ca_der = parse_pem_der(&ca_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| Error::cert_bootstrap(format!("parsing {}: {}", cert_path.display(), e)))?;
    let (_, ca) = X509Certificate::from_der(&ca_der)
        .map_err(|e| Error::cert_bootstrap(format!("parsing CA: {}", e)))?;

    Ok(cert.verify_signature(Some(ca.public_key())).is_ok())
}

async fn cert_covers_ip(cert_path: &Path, ip: IpAddr) -> Result<bool> {
    let cert_pem = tokio::fs::read_to_string(cert_path).await?;
    let der = parse_pem_der(&cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| Error::cert_bootstrap(format!("parsing server cert: {}", e)))?;

    let wanted = match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::IPAddress(bytes) = name {
                    if *bytes == wanted.as_slice() {
                        return Ok(true);
                    }
                }
            }
        }
    }
    Ok(false)
}

/// TLS-dial `addr` with the generated CA and client pair; true when the
/// handshake succeeds within the 40 s dial timeout.
pub async fn validate_certificate(addr: &str, auth: &AuthOptions) -> bool {
    let parts = async {
        let ca = tokio::fs::read(auth.ca_cert_path()).await.ok()?;
        let mut identity = tokio::fs::read(auth.client_cert_path()).await.ok()?;
        let key = tokio::fs::read(auth.client_key_path()).await.ok()?;
        identity.extend_from_slice(&key);
        Some((ca, identity))
    }
    .await;

    let Some((ca, identity)) = parts else {
        return false;
    };
    let Ok(ca) = reqwest::Certificate::from_pem(&ca) else {
        return false;
    };
    let Ok(identity) = reqwest::Identity::from_pem(&identity) else {
        return false;
    };

    let Ok(client) = reqwest::Client::builder()
        .add_root_certificate(ca)
        .identity(identity)
        .connect_timeout(VALIDATE_DIAL_TIMEOUT)
        .build()
    else {
        return false;
    };

    client.get(format!("https://{}/", addr)).send().await.is_ok()
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(DnType::OrganizationName, DnValue::Utf8String(ORG_NAME.to_string()));
    dn
}

/// 10-year validity window for all generated certificates.
fn set_validity(params: &mut CertificateParams) {
    params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    params.not_after = rcgen::date_time_ymd(2034, 1, 1);
}

fn parse_pem_der(pem_data: &str) -> Result<Vec<u8>> {
    let obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| Error::cert_bootstrap(format!("parsing PEM: {}", e)))?;
    Ok(obj.contents().to_vec())
}

fn parse_cert_pem(pem_data: &str) -> Result<()> {
    let der = parse_pem_der(pem_data)?;
    X509Certificate::from_der(&der)
        .map(|_| ())
        .map_err(|e| Error::cert_bootstrap(format!("parsing certificate: {}", e)))
}

/// Write PEM bytes via tmp + fsync + rename; no partial file survives a
/// crash.
async fn write_pem_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("pem.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
