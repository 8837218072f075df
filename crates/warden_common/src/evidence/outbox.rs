//! Store-and-forward spool for evidence uploads
//!
//! Sealed bundles are copied into `<spool_dir>/<client_id>/` and removed
//! only after central acknowledges them. A flush sends each client's queue
//! in `chain_index` order; a transient failure holds back the rest of that
//! client's queue so central never sees a gap, and the next flush waits out
//! an exponential backoff. Entries that can never be delivered (unreadable
//! spool files, outright refusals from central) are renamed aside with a
//! `.quarantine` suffix and reported as tamper alerts.
//!
//! `acknowledged.json` keeps the highest index central accepted per client;
//! [`EvidenceOutbox::reconcile`] uses it to respool sealed bundles that never
//! made it into the spool.

use super::bundle::{bundle_file_name, EvidenceBundle};
use super::chain::{validate_client_id, EvidenceChain, TamperAlert, TamperKind};
use crate::error::{Result, WardenError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const DEFAULT_BACKOFF_BASE_SECS: i64 = 5;
pub const DEFAULT_BACKOFF_MAX_SECS: i64 = 900;

const ACK_FILE: &str = "acknowledged.json";
const QUARANTINE_SUFFIX: &str = ".quarantine";

#[async_trait]
pub trait EvidenceUploader: Send + Sync {
    async fn upload(&self, bundle: &EvidenceBundle) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub uploaded: usize,
    pub pending: usize,
    /// Skipped because the backoff has not elapsed
    pub deferred: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Entries moved aside during this flush
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quarantined: Vec<TamperAlert>,
}

#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    next_attempt: Option<DateTime<Utc>>,
}

pub struct EvidenceOutbox {
    dir: PathBuf,
    base: Duration,
    max: Duration,
    backoff: Mutex<Backoff>,
    flush_lock: tokio::sync::Mutex<()>,
    write_lock: tokio::sync::Mutex<()>,
}

impl EvidenceOutbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            base: Duration::seconds(DEFAULT_BACKOFF_BASE_SECS),
            max: Duration::seconds(DEFAULT_BACKOFF_MAX_SECS),
            backoff: Mutex::new(Backoff::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base = base;
        self.max = max;
        self
    }

    /// Durably queue a sealed bundle; re-enqueueing is a no-op
    pub async fn enqueue(&self, bundle: &EvidenceBundle) -> Result<()> {
        validate_client_id(&bundle.client_id)?;
        let _guard = self.write_lock.lock().await;
        let dir = self.dir.join(&bundle.client_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(bundle.file_name());
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }

        // Write then rename so a crash never leaves a partial spool entry
        let tmp = dir.join(format!(".{}.tmp", bundle.file_name()));
        tokio::fs::write(&tmp, serde_json::to_vec(bundle)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Spooled {}#{}", bundle.client_id, bundle.chain_index);
        Ok(())
    }

    /// Spool every sealed bundle that is neither queued, quarantined nor
    /// acknowledged; returns how many were added
    pub async fn reconcile(&self, chain: &EvidenceChain) -> Result<usize> {
        let acked = self.acknowledged().await?;
        let mut respooled = 0;
        for client_id in chain.clients().await? {
            let floor = acked.get(&client_id).copied();
            let client_dir = self.dir.join(&client_id);
            let spooled: HashSet<u64> = spooled_indices(&client_dir).await?.into_iter().collect();
            for index in chain.indices(&client_id).await? {
                if floor.is_some_and(|f| index <= f) || spooled.contains(&index) {
                    continue;
                }
                if tokio::fs::try_exists(quarantine_path(&client_dir.join(bundle_file_name(index)))).await? {
                    continue;
                }
                let bundle = chain.load(&client_id, index).await?;
                self.enqueue(&bundle).await?;
                respooled += 1;
            }
        }
        if respooled > 0 {
            warn!("Respooled {} sealed bundles missing from the outbox", respooled);
        }
        Ok(respooled)
    }

    /// Highest index central has accepted, per client
    pub async fn acknowledged(&self) -> Result<BTreeMap<String, u64>> {
        match tokio::fs::read(self.dir.join(ACK_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn acknowledge(&self, client_id: &str, index: u64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut acked = self.acknowledged().await?;
        let entry = acked.entry(client_id.to_string()).or_insert(index);
        *entry = (*entry).max(index);
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(format!(".{}.tmp", ACK_FILE));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&acked)?).await?;
        tokio::fs::rename(&tmp, self.dir.join(ACK_FILE)).await?;
        Ok(())
    }

    /// Spooled entries in upload order
    pub async fn pending(&self) -> Result<Vec<(String, u64)>> {
        let mut out = Vec::new();
        let mut clients = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(client) = clients.next_entry().await? {
            if !client.file_type().await?.is_dir() {
                continue;
            }
            let Some(client_id) = client.file_name().to_str().map(str::to_string) else {
                continue;
            };
            for index in spooled_indices(&client.path()).await? {
                out.push((client_id.clone(), index));
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn next_attempt(&self) -> Option<DateTime<Utc>> {
        self.backoff.lock().unwrap_or_else(|e| e.into_inner()).next_attempt
    }

    pub async fn flush(&self, uploader: &dyn EvidenceUploader) -> Result<FlushReport> {
        self.flush_at(uploader, Utc::now()).await
    }

    pub async fn flush_at(&self, uploader: &dyn EvidenceUploader, now: DateTime<Utc>) -> Result<FlushReport> {
        let _guard = self.flush_lock.lock().await;

        let queue = self.pending().await?;
        if let Some(next) = self.next_attempt() {
            if now < next {
                return Ok(FlushReport {
                    pending: queue.len(),
                    deferred: true,
                    ..Default::default()
                });
            }
        }

        let mut report = FlushReport::default();
        let mut held: HashSet<&str> = HashSet::new();
        for (client_id, index) in &queue {
            if held.contains(client_id.as_str()) {
                report.pending += 1;
                continue;
            }
            let path = self.dir.join(client_id).join(bundle_file_name(*index));
            let outcome = match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<EvidenceBundle>(&bytes) {
                    Ok(bundle) => uploader.upload(&bundle).await.map_err(|e| (TamperKind::Rejected, e)),
                    Err(e) => Err((TamperKind::Unreadable, WardenError::from(e))),
                },
                Err(e) => Err((TamperKind::Unreadable, WardenError::from(e))),
            };

            match outcome {
                Ok(()) => {
                    // Record before removal so reconcile never resends it
                    self.acknowledge(client_id, *index).await?;
                    tokio::fs::remove_file(&path).await?;
                    report.uploaded += 1;
                }
                Err((kind, e)) if e.is_permanent() => {
                    report.quarantined.push(self.quarantine(client_id, *index, &path, kind, &e).await?);
                }
                Err((_, e)) => {
                    warn!("Upload of {}#{} failed ({}); holding the rest of {}", client_id, index, e, client_id);
                    held.insert(client_id.as_str());
                    report.pending += 1;
                    report.error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        if report.error.is_some() {
            let delay = self.record_failure(now);
            warn!("{} bundles held, retry in {}s", report.pending, delay.num_seconds());
        } else {
            *self.backoff.lock().unwrap_or_else(|e| e.into_inner()) = Backoff::default();
        }
        if report.uploaded > 0 {
            info!("Uploaded {} evidence bundles", report.uploaded);
        }
        Ok(report)
    }

    /// Move an undeliverable entry aside; the file is kept for the operator
    async fn quarantine(
        &self,
        client_id: &str,
        index: u64,
        path: &Path,
        kind: TamperKind,
        cause: &WardenError,
    ) -> Result<TamperAlert> {
        let target = quarantine_path(path);
        tokio::fs::rename(path, &target).await?;
        error!(
            "TAMPER {} {:?} at spool entry {}: {}; moved to {}",
            client_id,
            kind,
            index,
            cause,
            target.display()
        );
        Ok(TamperAlert {
            client_id: client_id.to_string(),
            chain_index: index,
            file: target.display().to_string(),
            kind,
            detail: cause.to_string(),
            detected_at: Utc::now(),
        })
    }

    fn record_failure(&self, now: DateTime<Utc>) -> Duration {
        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        let delay = backoff_delay(self.base, self.max, backoff.failures);
        backoff.failures = backoff.failures.saturating_add(1);
        backoff.next_attempt = Some(now + delay);
        delay
    }
}

fn quarantine_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(QUARANTINE_SUFFIX);
    PathBuf::from(name)
}

/// `base * 2^failures`, capped at `max`
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 1i64.checked_shl(failures.min(32)).unwrap_or(i64::MAX);
    base.num_milliseconds()
        .checked_mul(factor)
        .map(Duration::milliseconds)
        .unwrap_or(max)
        .min(max)
}

async fn spooled_indices(dir: &Path) -> Result<Vec<u64>> {
    let mut indices = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(indices),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with('.') {
            continue;
        }
        if let Some(index) = name.strip_suffix(".json").and_then(|s| s.parse::<u64>().ok()) {
            indices.push(index);
        }
    }
    indices.sort_unstable();
    Ok(indices)
}
