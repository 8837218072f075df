//! Bundle signing capability
//!
//! Two implementations behind one trait: ed25519 (primary) and a BLAKE3
//! keyed MAC for appliances provisioned without an asymmetric key. The
//! signature always covers the bundle's 32-byte canonical digest.
//!
//! Key files hold hex in JSON and are written 0600.

use crate::canonical::sha256_hex;
use crate::error::{Result, WardenError};
use crate::trust::write_owner_only;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignerKind {
    #[default]
    Ed25519,
    Blake3Mac,
}

impl SignerKind {
    pub fn algorithm(self) -> &'static str {
        match self {
            SignerKind::Ed25519 => "ed25519",
            SignerKind::Blake3Mac => "blake3-mac",
        }
    }
}

pub trait BundleSigner: Send + Sync {
    fn kind(&self) -> SignerKind;

    /// Short public identifier of the key
    fn key_id(&self) -> String;

    /// Hex signature over the digest
    fn sign(&self, digest: &[u8; 32]) -> String;

    fn verify(&self, digest: &[u8; 32], signature_hex: &str) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    algorithm: String,
    secret_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public_key: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
}

fn decode_signature(signature_hex: &str) -> Result<Vec<u8>> {
    hex::decode(signature_hex).map_err(|e| WardenError::Signature(format!("signature not hex: {}", e)))
}

fn read_secret(path: &Path, kind: SignerKind) -> Result<Option<[u8; 32]>> {
    if !path.exists() {
        return Ok(None);
    }
    let file: KeyFile = serde_json::from_str(&fs::read_to_string(path)?)?;
    if file.algorithm != kind.algorithm() {
        return Err(WardenError::Signature(format!(
            "{} holds a {} key, expected {}",
            path.display(),
            file.algorithm,
            kind.algorithm()
        )));
    }
    let bytes = hex::decode(&file.secret_key)
        .map_err(|e| WardenError::Signature(format!("key not hex: {}", e)))?;
    let secret: [u8; 32] = bytes
        .try_into()
        .map_err(|_| WardenError::Signature("key must be 32 bytes".to_string()))?;
    Ok(Some(secret))
}

fn write_secret(path: &Path, kind: SignerKind, secret: &[u8; 32], public_key: Option<String>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = KeyFile {
        algorithm: kind.algorithm().to_string(),
        secret_key: hex::encode(secret),
        public_key,
        created_at: chrono::Utc::now(),
    };
    write_owner_only(path, serde_json::to_string_pretty(&file)?.as_bytes())
}

// ============================================================================
// ed25519
// ============================================================================

pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut OsRng))
    }

    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if let Some(secret) = read_secret(path, SignerKind::Ed25519)? {
            return Ok(Self::new(SigningKey::from_bytes(&secret)));
        }
        let signer = Self::generate();
        write_secret(
            path,
            SignerKind::Ed25519,
            &signer.key.to_bytes(),
            Some(hex::encode(signer.verifying_key().to_bytes())),
        )?;
        info!("Generated evidence signing key {} at {}", signer.key_id(), path.display());
        Ok(signer)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl BundleSigner for Ed25519Signer {
    fn kind(&self) -> SignerKind {
        SignerKind::Ed25519
    }

    fn key_id(&self) -> String {
        sha256_hex(self.verifying_key().as_bytes())[..16].to_string()
    }

    fn sign(&self, digest: &[u8; 32]) -> String {
        hex::encode(self.key.sign(digest).to_bytes())
    }

    fn verify(&self, digest: &[u8; 32], signature_hex: &str) -> Result<()> {
        let signature = Signature::from_slice(&decode_signature(signature_hex)?)
            .map_err(|e| WardenError::Signature(format!("malformed signature: {}", e)))?;
        self.verifying_key()
            .verify(digest, &signature)
            .map_err(|_| WardenError::Signature("ed25519 signature does not verify".to_string()))
    }
}

// ============================================================================
// BLAKE3 keyed MAC
// ============================================================================

pub struct Blake3MacSigner {
    key: [u8; 32],
}

impl Blake3MacSigner {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if let Some(secret) = read_secret(path, SignerKind::Blake3Mac)? {
            return Ok(Self::new(secret));
        }
        let signer = Self::generate();
        write_secret(path, SignerKind::Blake3Mac, &signer.key, None)?;
        info!("Generated evidence MAC key {} at {}", signer.key_id(), path.display());
        Ok(signer)
    }
}

impl BundleSigner for Blake3MacSigner {
    fn kind(&self) -> SignerKind {
        SignerKind::Blake3Mac
    }

    fn key_id(&self) -> String {
        // Derived, so the id reveals nothing about the key
        hex::encode(&blake3::derive_key("warden evidence mac key id", &self.key)[..8])
    }

    fn sign(&self, digest: &[u8; 32]) -> String {
        blake3::keyed_hash(&self.key, digest).to_hex().to_string()
    }

    fn verify(&self, digest: &[u8; 32], signature_hex: &str) -> Result<()> {
        let bytes: [u8; 32] = decode_signature(signature_hex)?
            .try_into()
            .map_err(|_| WardenError::Signature("MAC must be 32 bytes".to_string()))?;
        // blake3::Hash equality is constant-time
        if blake3::keyed_hash(&self.key, digest) == blake3::Hash::from(bytes) {
            Ok(())
        } else {
            Err(WardenError::Signature("MAC does not verify".to_string()))
        }
    }
}

/// Signer chosen at startup
pub fn load_signer(kind: SignerKind, key_path: &Path) -> Result<Arc<dyn BundleSigner>> {
    Ok(match kind {
        SignerKind::Ed25519 => Arc::new(Ed25519Signer::load_or_generate(key_path)?),
        SignerKind::Blake3Mac => Arc::new(Blake3MacSigner::load_or_generate(key_path)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn digest() -> [u8; 32] {
        crate::canonical::sha256(b"bundle")
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let signer = Ed25519Signer::generate();
        let sig = signer.sign(&digest());
        assert!(signer.verify(&digest(), &sig).is_ok());

        let other = crate::canonical::sha256(b"tampered");
        assert!(matches!(signer.verify(&other, &sig), Err(WardenError::Signature(_))));
    }

    #[test]
    fn test_blake3_mac_sign_verify() {
        let signer = Blake3MacSigner::generate();
        let sig = signer.sign(&digest());
        assert_eq!(sig.len(), 64);
        assert!(signer.verify(&digest(), &sig).is_ok());
        assert!(Blake3MacSigner::generate().verify(&digest(), &sig).is_err());
    }

    #[test]
    fn test_key_is_persisted_and_reloaded() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("keys/evidence.json");
        let first = Ed25519Signer::load_or_generate(&path).unwrap();
        let second = Ed25519Signer::load_or_generate(&path).unwrap();
        assert_eq!(first.key_id(), second.key_id());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn test_wrong_key_kind_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("evidence.json");
        Blake3MacSigner::load_or_generate(&path).unwrap();
        assert!(Ed25519Signer::load_or_generate(&path).is_err());
    }

    #[test]
    fn test_signer_kind_serde() {
        let kind: SignerKind = serde_json::from_str("\"blake3-mac\"").unwrap();
        assert_eq!(kind, SignerKind::Blake3Mac);
        assert_eq!(kind.algorithm(), "blake3-mac");
    }
}
