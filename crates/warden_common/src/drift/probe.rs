//! Host observation surface
//!
//! Read-only access to the state the checks compare against the baseline.
//! Every method either returns what it saw or an observation fault; none of
//! them change anything on the host.

use crate::canonical::sha256_hex;
use crate::error::{Result, WardenError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Endpoint protection observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointState {
    pub running: bool,
    /// SHA-256 of the agent binary; None when the binary is missing
    pub binary_hash: Option<String>,
}

#[async_trait]
pub trait HostProbe: Send + Sync {
    fn host_id(&self) -> &str;

    /// Time of the most recent successful package update
    async fn last_patch_time(&self) -> Result<Option<DateTime<Utc>>>;

    async fn endpoint_protection(&self, service: &str, binary: &Path) -> Result<EndpointState>;

    /// Completion time of the most recent backup
    async fn last_backup_time(&self) -> Result<Option<DateTime<Utc>>>;

    async fn service_active(&self, name: &str) -> Result<bool>;

    /// Raw firewall ruleset text
    async fn firewall_ruleset(&self) -> Result<String>;

    /// Names of volumes currently backed by an encryption layer
    async fn encrypted_volumes(&self) -> Result<Vec<String>>;
}

/// Probe for the machine the daemon runs on
pub struct LocalProbe {
    host_id: String,
    patch_stamps: Vec<PathBuf>,
    backup_stamp: PathBuf,
    command_timeout: Duration,
}

impl LocalProbe {
    pub fn new(host_id: impl Into<String>, backup_stamp: impl Into<PathBuf>) -> Self {
        Self {
            host_id: host_id.into(),
            patch_stamps: vec![
                PathBuf::from("/var/lib/apt/periodic/upgrade-stamp"),
                PathBuf::from("/var/lib/apt/periodic/update-success-stamp"),
                PathBuf::from("/var/lib/dnf/history.sqlite"),
                PathBuf::from("/var/log/dnf.rpm.log"),
            ],
            backup_stamp: backup_stamp.into(),
            command_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_patch_stamps(mut self, stamps: Vec<PathBuf>) -> Self {
        self.patch_stamps = stamps;
        self
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<std::process::Output> {
        debug!("probe: {} {}", program, args.join(" "));
        let output = tokio::time::timeout(
            self.command_timeout,
            Command::new(program).args(args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| WardenError::Observation(format!("{} timed out", program)))?
        .map_err(|e| WardenError::Observation(format!("cannot run {}: {}", program, e)))?;
        Ok(output)
    }
}

async fn modified_time(path: &Path) -> Option<DateTime<Utc>> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    meta.modified().ok().map(DateTime::<Utc>::from)
}

#[async_trait]
impl HostProbe for LocalProbe {
    fn host_id(&self) -> &str {
        &self.host_id
    }

    async fn last_patch_time(&self) -> Result<Option<DateTime<Utc>>> {
        let mut latest: Option<DateTime<Utc>> = None;
        for stamp in &self.patch_stamps {
            if let Some(t) = modified_time(stamp).await {
                latest = Some(latest.map_or(t, |l| l.max(t)));
            }
        }
        Ok(latest)
    }

    async fn endpoint_protection(&self, service: &str, binary: &Path) -> Result<EndpointState> {
        let running = self.service_active(service).await?;
        let binary_hash = match tokio::fs::read(binary).await {
            Ok(bytes) => Some(sha256_hex(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(WardenError::Observation(format!(
                    "cannot read {}: {}",
                    binary.display(),
                    e
                )))
            }
        };
        Ok(EndpointState { running, binary_hash })
    }

    async fn last_backup_time(&self) -> Result<Option<DateTime<Utc>>> {
        match tokio::fs::read_to_string(&self.backup_stamp).await {
            // Backup jobs write an RFC 3339 completion time; fall back to mtime
            Ok(contents) => match DateTime::parse_from_rfc3339(contents.trim()) {
                Ok(t) => Ok(Some(t.with_timezone(&Utc))),
                Err(_) => Ok(modified_time(&self.backup_stamp).await),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(WardenError::Observation(format!(
                "cannot read backup stamp {}: {}",
                self.backup_stamp.display(),
                e
            ))),
        }
    }

    async fn service_active(&self, name: &str) -> Result<bool> {
        // `systemctl is-active` exits non-zero for inactive units; that is an answer, not a fault
        let output = self.run("systemctl", &["is-active", name]).await?;
        let state = String::from_utf8_lossy(&output.stdout);
        Ok(state.trim() == "active")
    }

    async fn firewall_ruleset(&self) -> Result<String> {
        if let Ok(output) = self.run("nft", &["list", "ruleset"]).await {
            if output.status.success() {
                return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
            }
        }
        let output = self.run("iptables-save", &[]).await?;
        if !output.status.success() {
            return Err(WardenError::Observation(format!(
                "iptables-save failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn encrypted_volumes(&self) -> Result<Vec<String>> {
        let output = self.run("lsblk", &["-rno", "NAME,TYPE"]).await?;
        if !output.status.success() {
            return Err(WardenError::Observation("lsblk failed".to_string()));
        }
        Ok(parse_lsblk_crypt(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Names of `crypt` devices in `lsblk -rno NAME,TYPE` output
pub fn parse_lsblk_crypt(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            (parts.next()? == "crypt").then(|| name.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_lsblk_crypt() {
        let out = "sda disk\nsda1 part\nluks-root crypt\nsdb disk\nluks-data crypt\n";
        assert_eq!(parse_lsblk_crypt(out), vec!["luks-root", "luks-data"]);
        assert!(parse_lsblk_crypt("").is_empty());
    }

    #[tokio::test]
    async fn test_backup_stamp_rfc3339() {
        let temp = TempDir::new().unwrap();
        let stamp = temp.path().join("backup.stamp");
        std::fs::write(&stamp, "2026-10-01T02:00:00Z\n").unwrap();

        let probe = LocalProbe::new("host", &stamp);
        let t = probe.last_backup_time().await.unwrap().unwrap();
        assert_eq!(t.to_rfc3339(), "2026-10-01T02:00:00+00:00");
    }

    #[tokio::test]
    async fn test_missing_backup_stamp_is_none() {
        let temp = TempDir::new().unwrap();
        let probe = LocalProbe::new("host", temp.path().join("absent"));
        assert!(probe.last_backup_time().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_patch_time_uses_latest_stamp() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        std::fs::write(&a, "").unwrap();
        let probe = LocalProbe::new("host", temp.path().join("b"))
            .with_patch_stamps(vec![a, temp.path().join("missing")]);
        assert!(probe.last_patch_time().await.unwrap().is_some());
    }
}
