//! Signed compliance baseline
//!
//! The baseline is pushed from central and cached locally as
//! `{ "baseline": {...}, "signature": "<hex>" }`. The detector refuses to run
//! against a baseline whose ed25519 signature does not verify.

use crate::canonical::canonical_json;
use crate::error::{Result, WardenError};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointBaseline {
    /// Service unit that must be running
    pub service: String,
    /// Binary whose hash identifies the approved agent build
    pub binary_path: String,
    /// Accepted SHA-256 hashes (hex) of the binary
    pub allowed_hashes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub version: u32,
    pub max_patch_age_days: i64,
    pub endpoint_protection: EndpointBaseline,
    pub backup_max_age_hours: i64,
    pub log_services: Vec<String>,
    /// SHA-256 of the normalized firewall ruleset
    pub firewall_ruleset_hash: String,
    pub encrypted_volumes: Vec<String>,
    /// check_name -> compliance control id
    #[serde(default)]
    pub controls: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedBaseline {
    pub baseline: Baseline,
    pub signature: String,
}

impl SignedBaseline {
    pub fn sign(baseline: Baseline, key: &SigningKey) -> Result<Self> {
        let message = canonical_json(&baseline)?;
        let signature = key.sign(&message);
        Ok(Self {
            baseline,
            signature: hex::encode(signature.to_bytes()),
        })
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        let message = canonical_json(&self.baseline)?;
        let bytes = hex::decode(&self.signature)
            .map_err(|e| WardenError::Baseline(format!("signature not hex: {}", e)))?;
        let signature = Signature::from_slice(&bytes)
            .map_err(|e| WardenError::Baseline(format!("malformed signature: {}", e)))?;
        key.verify(&message, &signature)
            .map_err(|_| WardenError::Baseline("baseline signature does not verify".to_string()))
    }

    /// Load from disk and verify; only a verified baseline is returned
    pub fn load_verified(path: &Path, key: &VerifyingKey) -> Result<Baseline> {
        let contents = fs::read_to_string(path)
            .map_err(|e| WardenError::Baseline(format!("cannot read {}: {}", path.display(), e)))?;
        let signed: SignedBaseline = serde_json::from_str(&contents)?;
        signed.verify(key)?;
        info!(
            "Loaded signed baseline v{} from {}",
            signed.baseline.version,
            path.display()
        );
        Ok(signed.baseline)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Parse a hex-encoded ed25519 public key
pub fn verifying_key_from_hex(hex_key: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| WardenError::Baseline(format!("public key not hex: {}", e)))?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| WardenError::Baseline("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&array)
        .map_err(|e| WardenError::Baseline(format!("invalid public key: {}", e)))
}

#[cfg(test)]
pub(crate) fn sample_baseline() -> Baseline {
    Baseline {
        version: 3,
        max_patch_age_days: 30,
        endpoint_protection: EndpointBaseline {
            service: "clamav-daemon".to_string(),
            binary_path: "/usr/sbin/clamd".to_string(),
            allowed_hashes: vec!["aa11".to_string()],
        },
        backup_max_age_hours: 24,
        log_services: vec!["rsyslog".to_string(), "auditd".to_string()],
        firewall_ruleset_hash: crate::canonical::sha256_hex(b"table inet filter"),
        encrypted_volumes: vec!["luks-root".to_string()],
        controls: BTreeMap::from([("backup".to_string(), "164.308(a)(7)".to_string())]),
    }
}
