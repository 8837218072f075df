//! Per-client hash chain of signed evidence bundles
//!
//! Layout: `<evidence_dir>/<client_id>/<chain_index:010>.json`, written once
//! with `create_new` and left read-only. Each client has its own tail
//! pointer behind its own async mutex, so appends for different clients run
//! in parallel while appends for one client are strictly ordered.

use super::anchor::{verify_ots_proof, Anchor};
use super::bundle::{bundle_file_name, EvidenceBundle, EvidenceDraft};
use super::signer::BundleSigner;
use crate::error::{Result, WardenError};
use crate::timesync::{NtpVerification, TimeVerifier};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TamperKind {
    /// A chain index has no file
    MissingLink,
    /// File cannot be read or parsed
    Unreadable,
    /// Stored index disagrees with the file position
    IndexMismatch,
    /// `prev_hash` does not match the previous bundle's hash
    BrokenLink,
    /// Recomputed digest differs from the stored one
    HashMismatch,
    BadSignature,
    /// Anchor proof present but does not replay against the digest
    AnchorInvalid,
    /// Central refused the bundle outright
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TamperAlert {
    pub client_id: String,
    pub chain_index: u64,
    pub file: String,
    pub kind: TamperKind,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainVerification {
    pub client_id: String,
    pub bundles_checked: u64,
    pub head_hash: Option<String>,
    pub alerts: Vec<TamperAlert>,
}

impl ChainVerification {
    pub fn is_intact(&self) -> bool {
        self.alerts.is_empty()
    }
}

#[derive(Debug, Default)]
struct Tail {
    loaded: bool,
    next_index: u64,
    prev_hash: Option<String>,
}

pub struct EvidenceChain {
    dir: PathBuf,
    site_id: String,
    signer: Arc<dyn BundleSigner>,
    time: Option<Arc<TimeVerifier>>,
    anchor: Option<Arc<dyn Anchor>>,
    tails: RwLock<HashMap<String, Arc<Mutex<Tail>>>>,
}

impl EvidenceChain {
    pub fn new(dir: impl Into<PathBuf>, site_id: impl Into<String>, signer: Arc<dyn BundleSigner>) -> Self {
        Self {
            dir: dir.into(),
            site_id: site_id.into(),
            signer,
            time: None,
            anchor: None,
            tails: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_time_verifier(mut self, verifier: Arc<TimeVerifier>) -> Self {
        self.time = Some(verifier);
        self
    }

    pub fn with_anchor(mut self, anchor: Arc<dyn Anchor>) -> Self {
        self.anchor = Some(anchor);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn client_dir(&self, client_id: &str) -> PathBuf {
        self.dir.join(client_id)
    }

    fn tail(&self, client_id: &str) -> Arc<Mutex<Tail>> {
        if let Some(tail) = self
            .tails
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(client_id)
        {
            return Arc::clone(tail);
        }
        let mut tails = self.tails.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(tails.entry(client_id.to_string()).or_default())
    }

    /// Seal a draft into the next link of the client's chain
    pub async fn append(&self, client_id: &str, draft: EvidenceDraft) -> Result<EvidenceBundle> {
        validate_client_id(client_id)?;
        let tail = self.tail(client_id);
        let mut tail = tail.lock().await;

        if !tail.loaded {
            let (next_index, prev_hash) = self.recover_tail(client_id).await?;
            tail.next_index = next_index;
            tail.prev_hash = prev_hash;
            tail.loaded = true;
        }

        let time_verification = match &self.time {
            Some(verifier) => verifier.verify().await,
            None => NtpVerification::unavailable("no time verifier configured"),
        };
        if !time_verification.verified {
            warn!(
                "Sealing evidence for {} without verified time: {}",
                client_id,
                time_verification.error.as_deref().unwrap_or("skew")
            );
        }

        let mut bundle = EvidenceBundle {
            bundle_id: uuid::Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            site_id: self.site_id.clone(),
            host_id: draft.host_id,
            chain_index: tail.next_index,
            prev_hash: tail.prev_hash.clone(),
            created_at: Utc::now(),
            incident: draft.incident,
            runbook: draft.runbook,
            execution: draft.execution,
            outputs: draft.outputs,
            time_verification,
            signature_algorithm: self.signer.kind().algorithm().to_string(),
            signer_key_id: self.signer.key_id(),
            evidence_bundle_hash: String::new(),
            signature: String::new(),
            ots_proof: None,
        };

        let digest = bundle.digest_bytes()?;
        bundle.evidence_bundle_hash = hex::encode(digest);
        bundle.signature = self.signer.sign(&digest);

        if let Some(anchor) = &self.anchor {
            match anchor.anchor(&digest).await {
                Ok(proof) => bundle.ots_proof = Some(proof),
                Err(e) => warn!(
                    "Anchoring {}#{} failed, persisting unanchored: {}",
                    client_id, bundle.chain_index, e
                ),
            }
        }

        self.persist(&bundle).await?;
        tail.next_index += 1;
        tail.prev_hash = Some(bundle.evidence_bundle_hash.clone());

        info!(
            "Sealed evidence {}#{} ({}) hash={}",
            client_id,
            bundle.chain_index,
            bundle.incident.check_name,
            &bundle.evidence_bundle_hash[..16]
        );
        Ok(bundle)
    }

    async fn persist(&self, bundle: &EvidenceBundle) -> Result<()> {
        let dir = self.client_dir(&bundle.client_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(bundle.file_name());

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o444);

        let mut file = options.open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                WardenError::Chain(format!("{} already exists; refusing to overwrite", path.display()))
            } else {
                WardenError::Io(e)
            }
        })?;
        file.write_all(&serde_json::to_vec_pretty(bundle)?).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Next index and head hash from what is on disk
    async fn recover_tail(&self, client_id: &str) -> Result<(u64, Option<String>)> {
        let indices = list_indices(&self.client_dir(client_id)).await?;
        let Some(&last) = indices.last() else {
            return Ok((0, None));
        };
        let head = self.load(client_id, last).await?;
        let recomputed = head.compute_hash()?;
        if recomputed != head.evidence_bundle_hash {
            return Err(WardenError::Chain(format!(
                "head of {} (index {}) does not hash to its stored digest; run verification",
                client_id, last
            )));
        }
        debug!("Recovered {} tail at index {}", client_id, last);
        Ok((last + 1, Some(head.evidence_bundle_hash)))
    }

    pub async fn load(&self, client_id: &str, chain_index: u64) -> Result<EvidenceBundle> {
        validate_client_id(client_id)?;
        let path = self.client_dir(client_id).join(bundle_file_name(chain_index));
        let bytes = tokio::fs::read(&path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Chain indices on disk for a client, ascending
    pub async fn indices(&self, client_id: &str) -> Result<Vec<u64>> {
        validate_client_id(client_id)?;
        list_indices(&self.client_dir(client_id)).await
    }

    /// All bundles for a client in chain order
    pub async fn list(&self, client_id: &str) -> Result<Vec<EvidenceBundle>> {
        validate_client_id(client_id)?;
        let mut bundles = Vec::new();
        for index in list_indices(&self.client_dir(client_id)).await? {
            bundles.push(self.load(client_id, index).await?);
        }
        Ok(bundles)
    }

    pub async fn clients(&self) -> Result<Vec<String>> {
        let mut clients = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(clients),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    clients.push(name.to_string());
                }
            }
        }
        clients.sort();
        Ok(clients)
    }

    /// Digest, signature and anchor checks for one bundle
    pub fn verify_bundle(&self, bundle: &EvidenceBundle) -> Vec<(TamperKind, String)> {
        let mut faults = Vec::new();
        match (bundle.chain_index, &bundle.prev_hash) {
            (0, Some(hash)) => faults.push((TamperKind::BrokenLink, format!("genesis link carries prev_hash {}", hash))),
            (i, None) if i > 0 => faults.push((TamperKind::BrokenLink, "prev_hash is null past genesis".to_string())),
            _ => {}
        }

        let digest = match bundle.digest_bytes() {
            Ok(d) => d,
            Err(e) => return vec![(TamperKind::Unreadable, e.to_string())],
        };
        if hex::encode(digest) != bundle.evidence_bundle_hash {
            faults.push((
                TamperKind::HashMismatch,
                format!("stored {} recomputed {}", bundle.evidence_bundle_hash, hex::encode(digest)),
            ));
        }

        let stored_digest: Option<[u8; 32]> = hex::decode(&bundle.evidence_bundle_hash)
            .ok()
            .and_then(|b| b.try_into().ok());
        if bundle.signature_algorithm != self.signer.kind().algorithm() {
            faults.push((
                TamperKind::BadSignature,
                format!("signed with {}, verifier is {}", bundle.signature_algorithm, self.signer.kind().algorithm()),
            ));
        } else if let Err(e) = self.signer.verify(&stored_digest.unwrap_or(digest), &bundle.signature) {
            faults.push((TamperKind::BadSignature, e.to_string()));
        }

        if let Some(ots) = &bundle.ots_proof {
            let replay = BASE64
                .decode(&ots.proof)
                .map_err(|e| WardenError::Anchor(format!("proof not base64: {}", e)))
                .and_then(|proof| verify_ots_proof(&proof, &digest));
            if let Err(e) = replay {
                faults.push((TamperKind::AnchorInvalid, e.to_string()));
            }
        }
        faults
    }

    /// Walk a client's chain; integrity faults come back as alerts, files stay
    pub async fn verify_chain(&self, client_id: &str) -> Result<ChainVerification> {
        validate_client_id(client_id)?;
        let dir = self.client_dir(client_id);
        let indices = list_indices(&dir).await?;

        let mut alerts = Vec::new();
        let mut prev_hash: Option<String> = None;
        let mut checked = 0;
        let mut alert = |chain_index: u64, kind: TamperKind, detail: String| {
            let file = dir.join(bundle_file_name(chain_index)).display().to_string();
            error!("TAMPER {} {:?} at {}: {}", client_id, kind, file, detail);
            alerts.push(TamperAlert {
                client_id: client_id.to_string(),
                chain_index,
                file,
                kind,
                detail,
                detected_at: Utc::now(),
            });
        };

        let mut expected = 0u64;
        for index in indices {
            while expected < index {
                alert(expected, TamperKind::MissingLink, "no bundle file".to_string());
                expected += 1;
            }
            expected = index + 1;
            checked += 1;

            let bundle = match self.load(client_id, index).await {
                Ok(b) => b,
                Err(e) => {
                    alert(index, TamperKind::Unreadable, e.to_string());
                    continue;
                }
            };
            if bundle.chain_index != index {
                alert(index, TamperKind::IndexMismatch, format!("file claims index {}", bundle.chain_index));
            }
            // A null link past genesis is reported by verify_bundle
            if (index == 0 || bundle.prev_hash.is_some()) && bundle.prev_hash != prev_hash {
                let found = bundle.prev_hash.as_deref().unwrap_or("null");
                let wanted = prev_hash.as_deref().unwrap_or("null");
                alert(index, TamperKind::BrokenLink, format!("prev_hash {} expected {}", found, wanted));
            }
            for (kind, detail) in self.verify_bundle(&bundle) {
                alert(index, kind, detail);
            }
            prev_hash = Some(bundle.evidence_bundle_hash);
        }

        let head_hash = prev_hash;
        Ok(ChainVerification {
            client_id: client_id.to_string(),
            bundles_checked: checked,
            head_hash,
            alerts,
        })
    }
}

/// Chain indices present in a client directory, ascending
async fn list_indices(dir: &Path) -> Result<Vec<u64>> {
    let mut indices = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(indices),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(".json") {
            if stem.len() == 10 {
                if let Ok(index) = stem.parse::<u64>() {
                    indices.push(index);
                }
            }
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

/// Client ids become directory names
pub fn validate_client_id(client_id: &str) -> Result<()> {
    let ok = !client_id.is_empty()
        && client_id.len() <= 128
        && !client_id.starts_with('.')
        && client_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(WardenError::Chain(format!("invalid client id {:?}", client_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::anchor::testing::{DownAnchor, StaticAnchor};
    use super::super::bundle::testing::draft;
    use super::super::signer::{Blake3MacSigner, Ed25519Signer};
    use super::*;
    use tempfile::TempDir;

    fn chain(temp: &TempDir) -> EvidenceChain {
        EvidenceChain::new(temp.path(), "site-1", Arc::new(Ed25519Signer::generate()))
    }

    fn make_writable(path: &Path) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_chain_links_and_verifies() {
        let temp = TempDir::new().unwrap();
        let chain = chain(&temp);
        let first = chain.append("clinic-a", draft("logging")).await.unwrap();
        let second = chain.append("clinic-a", draft("firewall")).await.unwrap();

        assert_eq!(first.chain_index, 0);
        assert_eq!(first.prev_hash, None);
        assert_eq!(second.chain_index, 1);
        assert_eq!(second.prev_hash.as_deref(), Some(first.evidence_bundle_hash.as_str()));
        assert_eq!(second.evidence_bundle_hash, second.compute_hash().unwrap());

        let report = chain.verify_chain("clinic-a").await.unwrap();
        assert!(report.is_intact(), "{:?}", report.alerts);
        assert_eq!(report.bundles_checked, 2);
        assert_eq!(report.head_hash.as_deref(), Some(second.evidence_bundle_hash.as_str()));
    }

    #[tokio::test]
    async fn test_prev_hash_null_only_at_genesis() {
        let temp = TempDir::new().unwrap();
        let chain = chain(&temp);
        let first = chain.append("clinic-a", draft("logging")).await.unwrap();
        let second = chain.append("clinic-a", draft("firewall")).await.unwrap();

        let stored: serde_json::Value =
            serde_json::from_slice(&std::fs::read(chain.client_dir("clinic-a").join(first.file_name())).unwrap())
                .unwrap();
        assert!(stored["prev_hash"].is_null());

        let mut unlinked = second.clone();
        unlinked.prev_hash = None;
        let kinds: Vec<_> = chain.verify_bundle(&unlinked).into_iter().map(|(k, _)| k).collect();
        assert!(kinds.contains(&TamperKind::BrokenLink));

        let mut rooted = first.clone();
        rooted.prev_hash = Some(second.evidence_bundle_hash.clone());
        let kinds: Vec<_> = chain.verify_bundle(&rooted).into_iter().map(|(k, _)| k).collect();
        assert!(kinds.contains(&TamperKind::BrokenLink));
        assert!(chain.verify_bundle(&first).is_empty());
    }

    #[tokio::test]
    async fn test_files_are_write_once_and_read_only() {
        let temp = TempDir::new().unwrap();
        let chain = chain(&temp);
        let bundle = chain.append("clinic-a", draft("backup")).await.unwrap();
        let path = temp.path().join("clinic-a").join("0000000000.json");
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o444);
        }

        let err = chain.persist(&bundle).await.unwrap_err();
        assert!(matches!(err, WardenError::Chain(_)));
    }

    #[tokio::test]
    async fn test_mutation_is_detected_and_file_kept() {
        let temp = TempDir::new().unwrap();
        let chain = chain(&temp);
        for check in ["logging", "firewall", "backup"] {
            chain.append("clinic-a", draft(check)).await.unwrap();
        }

        let path = temp.path().join("clinic-a").join("0000000001.json");
        let mut bundle: EvidenceBundle = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        bundle.execution.success = false;
        make_writable(&path);
        std::fs::write(&path, serde_json::to_vec_pretty(&bundle).unwrap()).unwrap();

        let report = chain.verify_chain("clinic-a").await.unwrap();
        let kinds: Vec<(u64, TamperKind)> = report.alerts.iter().map(|a| (a.chain_index, a.kind)).collect();
        assert!(kinds.contains(&(1, TamperKind::HashMismatch)));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_rehashed_mutation_breaks_signature_and_link() {
        let temp = TempDir::new().unwrap();
        let chain = chain(&temp);
        chain.append("clinic-a", draft("logging")).await.unwrap();
        chain.append("clinic-a", draft("firewall")).await.unwrap();

        let path = temp.path().join("clinic-a").join("0000000000.json");
        let mut bundle: EvidenceBundle = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        bundle.incident.actual = "active".to_string();
        bundle.evidence_bundle_hash = bundle.compute_hash().unwrap();
        make_writable(&path);
        std::fs::write(&path, serde_json::to_vec_pretty(&bundle).unwrap()).unwrap();

        let report = chain.verify_chain("clinic-a").await.unwrap();
        let kinds: Vec<(u64, TamperKind)> = report.alerts.iter().map(|a| (a.chain_index, a.kind)).collect();
        assert!(kinds.contains(&(0, TamperKind::BadSignature)));
        assert!(kinds.contains(&(1, TamperKind::BrokenLink)));
    }

    #[tokio::test]
    async fn test_missing_link_reported() {
        let temp = TempDir::new().unwrap();
        let chain = chain(&temp);
        for check in ["logging", "firewall", "backup"] {
            chain.append("clinic-a", draft(check)).await.unwrap();
        }
        std::fs::remove_file(temp.path().join("clinic-a").join("0000000001.json")).unwrap();

        let report = chain.verify_chain("clinic-a").await.unwrap();
        assert!(report
            .alerts
            .iter()
            .any(|a| a.chain_index == 1 && a.kind == TamperKind::MissingLink));
    }

    #[tokio::test]
    async fn test_tail_recovers_after_restart() {
        let temp = TempDir::new().unwrap();
        let signer = Arc::new(Blake3MacSigner::generate());
        let head = {
            let chain = EvidenceChain::new(temp.path(), "site-1", signer.clone());
            chain.append("clinic-a", draft("logging")).await.unwrap();
            chain.append("clinic-a", draft("backup")).await.unwrap()
        };

        let restarted = EvidenceChain::new(temp.path(), "site-1", signer);
        let next = restarted.append("clinic-a", draft("firewall")).await.unwrap();
        assert_eq!(next.chain_index, 2);
        assert_eq!(next.prev_hash.as_deref(), Some(head.evidence_bundle_hash.as_str()));
        assert!(restarted.verify_chain("clinic-a").await.unwrap().is_intact());
    }

    #[tokio::test]
    async fn test_concurrent_appends_stay_ordered() {
        let temp = TempDir::new().unwrap();
        let chain = Arc::new(chain(&temp));
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let chain = Arc::clone(&chain);
                let client = if i % 2 == 0 { "clinic-a" } else { "clinic-b" };
                tokio::spawn(async move { chain.append(client, draft("logging")).await.unwrap() })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        for client in ["clinic-a", "clinic-b"] {
            let report = chain.verify_chain(client).await.unwrap();
            assert!(report.is_intact());
            assert_eq!(report.bundles_checked, 5);
        }
        assert_eq!(chain.clients().await.unwrap(), vec!["clinic-a", "clinic-b"]);
    }

    #[tokio::test]
    async fn test_anchor_attached_and_replayed() {
        let temp = TempDir::new().unwrap();
        let chain = chain(&temp).with_anchor(Arc::new(StaticAnchor));
        let bundle = chain.append("clinic-a", draft("logging")).await.unwrap();
        assert!(bundle.ots_proof.is_some());
        assert!(chain.verify_bundle(&bundle).is_empty());
    }

    #[tokio::test]
    async fn test_anchor_failure_does_not_block_persistence() {
        let temp = TempDir::new().unwrap();
        let chain = chain(&temp).with_anchor(Arc::new(DownAnchor));
        let bundle = chain.append("clinic-a", draft("logging")).await.unwrap();
        assert!(bundle.ots_proof.is_none());
        assert_eq!(chain.list("clinic-a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_time_verification_stamped() {
        let temp = TempDir::new().unwrap();
        let bundle = chain(&temp).append("clinic-a", draft("logging")).await.unwrap();
        assert!(!bundle.time_verification.verified);
        assert!(bundle.time_verification.error.is_some());
    }

    #[test]
    fn test_client_id_validation() {
        assert!(validate_client_id("clinic-a_01").is_ok());
        assert!(validate_client_id("../etc").is_err());
        assert!(validate_client_id("").is_err());
        assert!(validate_client_id("a/b").is_err());
    }
}
