//! Trust fabric: the appliance-local certificate authority
//!
//! Issues the material used for mutual TLS between fleet agents and the
//! appliance. Layout under the CA directory:
//!
//! ```text
//! ca.key              root private key (0600)
//! ca.crt              root certificate (0644)
//! ca.json             root identity (serial, subject, validity)
//! index.json          every serial ever issued, with revocation flags
//! agents/<host>/      cert.pem, key.pem, ca.pem, meta.json
//! server/             server.crt, server.key, server.json
//! ```
//!
//! The root is generated exactly once. Loading an existing directory
//! reproduces the same serial and subject; a partially present root is an
//! error rather than a reason to regenerate.

use crate::error::{Result, WardenError};
use chrono::{DateTime, Duration, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Root validity
pub const CA_VALIDITY_DAYS: i64 = 3650;

/// Agent and server certificate validity
pub const LEAF_VALIDITY_DAYS: i64 = 365;

const CA_SUBJECT: &str = "Warden Appliance Local CA";
const CA_KEY_FILE: &str = "ca.key";
const CA_CERT_FILE: &str = "ca.crt";
const CA_META_FILE: &str = "ca.json";
const INDEX_FILE: &str = "index.json";

/// Persisted root identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaMetadata {
    pub subject: String,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertKind {
    Agent,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    subject: String,
    kind: CertKind,
    not_after: DateTime<Utc>,
    #[serde(default)]
    revoked: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CertIndex {
    entries: BTreeMap<String, IndexEntry>,
}

/// Issued leaf certificate with its key and the CA chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub subject: String,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub cert_pem: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub key_pem: String,
    pub ca_pem: String,
    /// Hostname for agent certs, IP for the server cert
    pub san: String,
}

impl IssuedCertificate {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }
}

/// Sidecar metadata written next to cached PEM files
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeafMeta {
    subject: String,
    serial: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    san: String,
}

struct Root {
    key: KeyPair,
    cert: Certificate,
    pem: String,
    meta: CaMetadata,
}

/// Appliance-local CA
pub struct TrustFabric {
    dir: PathBuf,
    root: Option<Root>,
    index: Mutex<CertIndex>,
}

impl TrustFabric {
    /// Open the CA directory, loading the root if it already exists
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let root = if root_files_present(&dir)? {
            Some(load_root(&dir)?)
        } else {
            None
        };
        let index = load_index(&dir)?;

        Ok(Self {
            dir,
            root,
            index: Mutex::new(index),
        })
    }

    /// Load-only open; a missing root is an error
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let fabric = Self::new(&dir)?;
        if !fabric.is_initialized() {
            return Err(WardenError::CaNotInitialized(dir.display().to_string()));
        }
        Ok(fabric)
    }

    /// Open and make sure the root exists
    pub fn init(dir: impl Into<PathBuf>) -> Result<Self> {
        let mut fabric = Self::new(dir)?;
        fabric.initialize()?;
        Ok(fabric)
    }

    /// Generate the root if absent; loading an existing root is a no-op
    pub fn initialize(&mut self) -> Result<&CaMetadata> {
        if self.root.is_none() {
            fs::create_dir_all(&self.dir)?;
            let root = generate_root(&self.dir)?;
            info!(
                "Generated local CA root serial={} valid until {}",
                root.meta.serial, root.meta.not_after
            );
            self.root = Some(root);
        }
        Ok(&self.root_ref()?.meta)
    }

    pub fn is_initialized(&self) -> bool {
        self.root.is_some()
    }

    pub fn ca_metadata(&self) -> Result<&CaMetadata> {
        Ok(&self.root_ref()?.meta)
    }

    pub fn ca_pem(&self) -> Result<&str> {
        Ok(&self.root_ref()?.pem)
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.dir.join(CA_CERT_FILE)
    }

    pub fn server_dir(&self) -> PathBuf {
        self.dir.join("server")
    }

    /// Client certificate for `agent-<hostname>`
    ///
    /// Returns the cached certificate unless it has expired or was revoked.
    pub fn issue_agent_certificate(&self, hostname: &str) -> Result<IssuedCertificate> {
        let root = self.root_ref()?;
        validate_hostname(hostname)?;

        let agent_dir = self.dir.join("agents").join(hostname);
        if let Some(cached) = read_cached_leaf(&agent_dir, "cert.pem", "key.pem")? {
            if cached.is_valid_at(Utc::now()) && !self.is_revoked(&cached.serial) {
                debug!("Reusing agent certificate for {} ({})", hostname, cached.serial);
                return Ok(cached);
            }
            info!("Re-issuing agent certificate for {} (expired or revoked)", hostname);
        }

        let subject = format!("agent-{}", hostname);
        let mut params = leaf_params(&subject)?;
        params.subject_alt_names = vec![SanType::DnsName(hostname.try_into()?)];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let issued = self.sign_leaf(root, params, &subject, hostname, CertKind::Agent)?;
        write_leaf(&agent_dir, "cert.pem", "key.pem", &issued)?;
        write_public(&agent_dir.join("ca.pem"), &root.pem)?;

        info!("Issued agent certificate {} serial={}", subject, issued.serial);
        Ok(issued)
    }

    /// Server certificate for the appliance's own endpoint
    ///
    /// Cached and reused while valid and bound to the same IP.
    pub fn server_certificate(&self, ip: IpAddr) -> Result<IssuedCertificate> {
        let root = self.root_ref()?;
        let server_dir = self.server_dir();

        if let Some(cached) = read_cached_leaf(&server_dir, "server.crt", "server.key")? {
            if cached.san == ip.to_string() && cached.is_valid_at(Utc::now()) {
                debug!("Reusing server certificate for {}", ip);
                return Ok(cached);
            }
            info!("Regenerating server certificate (expired or IP changed to {})", ip);
        }

        let subject = "warden-appliance".to_string();
        let mut params = leaf_params(&subject)?;
        params.subject_alt_names = vec![SanType::IpAddress(ip)];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let issued = self.sign_leaf(root, params, &subject, &ip.to_string(), CertKind::Server)?;
        write_leaf(&server_dir, "server.crt", "server.key", &issued)?;

        info!("Issued server certificate for {} serial={}", ip, issued.serial);
        Ok(issued)
    }

    /// Revoke the agent's current certificate so the next request re-issues
    pub fn revoke_agent(&self, hostname: &str) -> Result<Option<String>> {
        validate_hostname(hostname)?;
        let agent_dir = self.dir.join("agents").join(hostname);
        let Some(cached) = read_cached_leaf(&agent_dir, "cert.pem", "key.pem")? else {
            return Ok(None);
        };

        let mut index = self.lock_index();
        if let Some(entry) = index.entries.get_mut(&cached.serial) {
            entry.revoked = true;
        }
        save_index(&self.dir, &index)?;
        warn!("Revoked agent certificate {} serial={}", cached.subject, cached.serial);
        Ok(Some(cached.serial))
    }

    pub fn is_revoked(&self, serial: &str) -> bool {
        self.lock_index()
            .entries
            .get(serial)
            .map(|e| e.revoked)
            .unwrap_or(false)
    }

    /// Number of serials ever issued by this CA
    pub fn issued_count(&self) -> usize {
        self.lock_index().entries.len()
    }

    fn root_ref(&self) -> Result<&Root> {
        self.root
            .as_ref()
            .ok_or_else(|| WardenError::CaNotInitialized(self.dir.display().to_string()))
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, CertIndex> {
        // Index writes never panic mid-update, so a poisoned lock still holds consistent data
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sign_leaf(
        &self,
        root: &Root,
        mut params: CertificateParams,
        subject: &str,
        san: &str,
        kind: CertKind,
    ) -> Result<IssuedCertificate> {
        let mut index = self.lock_index();
        let serial = unique_serial(&index);
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let not_before = to_chrono(params.not_before)?;
        let not_after = to_chrono(params.not_after)?;

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &root.cert, &root.key)?;
        let serial_hex = hex::encode(serial);

        index.entries.insert(
            serial_hex.clone(),
            IndexEntry {
                subject: subject.to_string(),
                kind,
                not_after,
                revoked: false,
            },
        );
        save_index(&self.dir, &index)?;

        Ok(IssuedCertificate {
            subject: subject.to_string(),
            serial: serial_hex,
            not_before,
            not_after,
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            ca_pem: root.pem.clone(),
            san: san.to_string(),
        })
    }
}

// ============================================================================
// Root generation and loading
// ============================================================================

fn root_files_present(dir: &Path) -> Result<bool> {
    let present: Vec<bool> = [CA_KEY_FILE, CA_CERT_FILE, CA_META_FILE]
        .iter()
        .map(|f| dir.join(f).exists())
        .collect();

    if present.iter().all(|p| *p) {
        Ok(true)
    } else if present.iter().any(|p| *p) {
        Err(WardenError::Certificate(format!(
            "incomplete CA material in {} (refusing to regenerate)",
            dir.display()
        )))
    } else {
        Ok(false)
    }
}

fn root_params(meta: &CaMetadata) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, meta.subject.clone());
    dn.push(DnType::OrganizationName, "Warden");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let serial = hex::decode(&meta.serial)
        .map_err(|e| WardenError::Certificate(format!("bad CA serial: {}", e)))?;
    params.serial_number = Some(SerialNumber::from_slice(&serial));
    params.not_before = to_offset(meta.not_before)?;
    params.not_after = to_offset(meta.not_after)?;
    Ok(params)
}

fn generate_root(dir: &Path) -> Result<Root> {
    let now = Utc::now();
    let meta = CaMetadata {
        subject: CA_SUBJECT.to_string(),
        serial: hex::encode(random_serial()),
        not_before: truncate_secs(now),
        not_after: truncate_secs(now + Duration::days(CA_VALIDITY_DAYS)),
    };

    let key = KeyPair::generate()?;
    let cert = root_params(&meta)?.self_signed(&key)?;
    let pem = cert.pem();

    write_private(&dir.join(CA_KEY_FILE), &key.serialize_pem())?;
    write_public(&dir.join(CA_CERT_FILE), &pem)?;
    write_public(&dir.join(CA_META_FILE), &serde_json::to_string_pretty(&meta)?)?;

    Ok(Root { key, cert, pem, meta })
}

fn load_root(dir: &Path) -> Result<Root> {
    let key_pem = fs::read_to_string(dir.join(CA_KEY_FILE))?;
    let pem = fs::read_to_string(dir.join(CA_CERT_FILE))?;
    let meta: CaMetadata = serde_json::from_str(&fs::read_to_string(dir.join(CA_META_FILE))?)?;

    let key = KeyPair::from_pem(&key_pem)?;
    // Issuer handle rebuilt from the persisted identity; ca.crt stays the distributed root
    let cert = root_params(&meta)?.self_signed(&key)?;

    info!("Loaded local CA root serial={}", meta.serial);
    Ok(Root { key, cert, pem, meta })
}

fn leaf_params(subject: &str) -> Result<CertificateParams> {
    let now = Utc::now();
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject);
    dn.push(DnType::OrganizationName, "Warden");
    params.distinguished_name = dn;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.not_before = to_offset(truncate_secs(now))?;
    params.not_after = to_offset(truncate_secs(now + Duration::days(LEAF_VALIDITY_DAYS)))?;
    Ok(params)
}

// ============================================================================
// Serials
// ============================================================================

fn random_serial() -> [u8; 16] {
    let mut serial: [u8; 16] = rand::random();
    // Positive INTEGER, never zero
    serial[0] &= 0x7f;
    serial[0] |= 0x01;
    serial
}

fn unique_serial(index: &CertIndex) -> [u8; 16] {
    loop {
        let serial = random_serial();
        if !index.entries.contains_key(&hex::encode(serial)) {
            return serial;
        }
    }
}

// ============================================================================
// Persistence helpers
// ============================================================================

fn load_index(dir: &Path) -> Result<CertIndex> {
    let path = dir.join(INDEX_FILE);
    if !path.exists() {
        return Ok(CertIndex::default());
    }
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

fn save_index(dir: &Path, index: &CertIndex) -> Result<()> {
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!("{}.tmp", INDEX_FILE));
    fs::write(&tmp, serde_json::to_string_pretty(index)?)?;
    fs::rename(tmp, dir.join(INDEX_FILE))?;
    Ok(())
}

fn read_cached_leaf(dir: &Path, cert_file: &str, key_file: &str) -> Result<Option<IssuedCertificate>> {
    let meta_path = dir.join("meta.json");
    let cert_path = dir.join(cert_file);
    let key_path = dir.join(key_file);
    if !meta_path.exists() || !cert_path.exists() || !key_path.exists() {
        return Ok(None);
    }

    let meta: LeafMeta = serde_json::from_str(&fs::read_to_string(meta_path)?)?;
    let ca_path = dir.join("ca.pem");
    let ca_pem = if ca_path.exists() {
        fs::read_to_string(ca_path)?
    } else {
        fs::read_to_string(dir.parent().unwrap_or(dir).join(CA_CERT_FILE)).unwrap_or_default()
    };

    Ok(Some(IssuedCertificate {
        subject: meta.subject,
        serial: meta.serial,
        not_before: meta.not_before,
        not_after: meta.not_after,
        cert_pem: fs::read_to_string(cert_path)?,
        key_pem: fs::read_to_string(key_path)?,
        ca_pem,
        san: meta.san,
    }))
}

fn write_leaf(dir: &Path, cert_file: &str, key_file: &str, issued: &IssuedCertificate) -> Result<()> {
    fs::create_dir_all(dir)?;
    let meta = LeafMeta {
        subject: issued.subject.clone(),
        serial: issued.serial.clone(),
        not_before: issued.not_before,
        not_after: issued.not_after,
        san: issued.san.clone(),
    };
    write_private(&dir.join(key_file), &issued.key_pem)?;
    write_public(&dir.join(cert_file), &issued.cert_pem)?;
    write_public(&dir.join("meta.json"), &serde_json::to_string_pretty(&meta)?)?;
    Ok(())
}

fn write_private(path: &Path, contents: &str) -> Result<()> {
    write_owner_only(path, contents.as_bytes())
}

/// Secret material is never readable by others, not even mid-write
pub(crate) fn write_owner_only(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| WardenError::Certificate(format!("bad key path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", name));
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    // A stale temp file keeps its old mode
    set_mode(&tmp, 0o600)?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn write_public(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)?;
    set_mode(path, 0o644)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

fn validate_hostname(hostname: &str) -> Result<()> {
    let valid = !hostname.is_empty()
        && hostname.len() <= 253
        && !hostname.starts_with('.')
        && !hostname.contains("..")
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(WardenError::Certificate(format!("invalid hostname: {:?}", hostname)))
    }
}

// ============================================================================
// chrono <-> time
// ============================================================================

fn truncate_secs(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(dt.timestamp(), 0).unwrap_or(dt)
}

fn to_offset(dt: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| WardenError::Certificate(format!("timestamp out of range: {}", e)))
}

fn to_chrono(dt: time::OffsetDateTime) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(dt.unix_timestamp(), 0)
        .ok_or_else(|| WardenError::Certificate("timestamp out of range".to_string()))
}
