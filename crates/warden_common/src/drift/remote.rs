//! Probe for managed Linux hosts over the remediation transport
//!
//! Issues the same read-only observations as [`LocalProbe`](super::LocalProbe)
//! as shell one-liners through a [`RemoteExecutor`].

use super::probe::{parse_lsblk_crypt, EndpointState, HostProbe};
use crate::error::{Result, WardenError};
use crate::healing::transport::{run_bounded, RemoteExecutor, Target};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const MISSING: &str = "MISSING";

pub struct RemoteProbe {
    target: Target,
    executor: Arc<dyn RemoteExecutor>,
    patch_stamps: Vec<PathBuf>,
    backup_stamp: PathBuf,
    timeout: Duration,
}

impl RemoteProbe {
    pub fn new(target: Target, executor: Arc<dyn RemoteExecutor>, backup_stamp: impl Into<PathBuf>) -> Self {
        Self {
            target,
            executor,
            patch_stamps: vec![
                PathBuf::from("/var/lib/apt/periodic/upgrade-stamp"),
                PathBuf::from("/var/lib/apt/periodic/update-success-stamp"),
                PathBuf::from("/var/log/dnf.rpm.log"),
            ],
            backup_stamp: backup_stamp.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, script: &str) -> Result<String> {
        run_bounded(self.executor.clone(), &self.target, script, self.timeout)
            .await
            .map(|out| out.stdout)
            .map_err(|e| WardenError::Observation(format!("{}: {}", self.target.hostname, e)))
    }
}

/// Single-quote for POSIX sh
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn epoch(secs: &str) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs.trim().parse().ok()?, 0).single()
}

#[async_trait]
impl HostProbe for RemoteProbe {
    fn host_id(&self) -> &str {
        &self.target.hostname
    }

    async fn last_patch_time(&self) -> Result<Option<DateTime<Utc>>> {
        let stamps: Vec<String> = self
            .patch_stamps
            .iter()
            .map(|p| shell_quote(&p.to_string_lossy()))
            .collect();
        let script = format!(
            "for f in {}; do stat -c %Y \"$f\" 2>/dev/null; done; true",
            stamps.join(" ")
        );
        Ok(self.run(&script).await?.lines().filter_map(epoch).max())
    }

    async fn endpoint_protection(&self, service: &str, binary: &Path) -> Result<EndpointState> {
        let running = self.service_active(service).await?;
        let bin = shell_quote(&binary.to_string_lossy());
        let out = self
            .run(&format!(
                "if [ -e {bin} ]; then sha256sum {bin} | cut -d' ' -f1; else echo {MISSING}; fi"
            ))
            .await?;
        let hash = out.trim();
        Ok(EndpointState {
            running,
            binary_hash: (hash != MISSING && !hash.is_empty()).then(|| hash.to_string()),
        })
    }

    async fn last_backup_time(&self) -> Result<Option<DateTime<Utc>>> {
        let stamp = shell_quote(&self.backup_stamp.to_string_lossy());
        let out = self
            .run(&format!(
                "if [ -e {stamp} ]; then head -n1 {stamp}; echo; stat -c %Y {stamp}; else echo {MISSING}; fi"
            ))
            .await?;
        let mut lines = out.lines().map(str::trim).filter(|l| !l.is_empty());
        let Some(first) = lines.next() else {
            return Ok(None);
        };
        if first == MISSING {
            return Ok(None);
        }
        if let Ok(t) = DateTime::parse_from_rfc3339(first) {
            return Ok(Some(t.with_timezone(&Utc)));
        }
        Ok(lines.last().and_then(epoch).or_else(|| epoch(first)))
    }

    async fn service_active(&self, name: &str) -> Result<bool> {
        let out = self
            .run(&format!("systemctl is-active {} || true", shell_quote(name)))
            .await?;
        Ok(out.trim() == "active")
    }

    async fn firewall_ruleset(&self) -> Result<String> {
        self.run("nft list ruleset 2>/dev/null || iptables-save").await
    }

    async fn encrypted_volumes(&self) -> Result<Vec<String>> {
        Ok(parse_lsblk_crypt(&self.run("lsblk -rno NAME,TYPE").await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healing::transport::{ExecOutput, ExecResult, TargetOs};
    use crate::types::{ExecError, ExecErrorKind};

    /// Answers by substring match on the script
    struct CannedExecutor(Vec<(&'static str, &'static str)>);

    #[async_trait]
    impl RemoteExecutor for CannedExecutor {
        fn name(&self) -> &'static str {
            "canned"
        }

        async fn execute(&self, _target: &Target, script: &str) -> ExecResult {
            self.0
                .iter()
                .find(|(needle, _)| script.contains(needle))
                .map(|(_, stdout)| ExecOutput {
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                    exit_code: 0,
                    duration_ms: 1,
                })
                .ok_or_else(|| ExecError::new(ExecErrorKind::Transport, "connection refused"))
        }
    }

    fn probe(answers: Vec<(&'static str, &'static str)>) -> RemoteProbe {
        let target = Target {
            hostname: "db01".to_string(),
            address: "10.0.0.5".to_string(),
            os: TargetOs::Linux,
            username: "warden".to_string(),
            port: None,
            credential: None,
            local: false,
        };
        RemoteProbe::new(target, Arc::new(CannedExecutor(answers)), "/var/lib/backup/last")
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/etc/x"), "'/etc/x'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_remote_observations() {
        let p = probe(vec![
            ("stat -c %Y \"$f\"", "1700000000\n1700000500\n"),
            ("is-active", "inactive\n"),
            ("lsblk", "sda disk\ncryptdata crypt\n"),
            ("head -n1", "2026-10-01T02:00:00Z\n\n1759284000\n"),
        ]);
        assert_eq!(p.host_id(), "db01");
        assert_eq!(p.last_patch_time().await.unwrap(), epoch("1700000500"));
        assert!(!p.service_active("auditd").await.unwrap());
        assert_eq!(p.encrypted_volumes().await.unwrap(), vec!["cryptdata"]);
        assert_eq!(
            p.last_backup_time().await.unwrap().unwrap().to_rfc3339(),
            "2026-10-01T02:00:00+00:00"
        );
    }

    #[tokio::test]
    async fn test_missing_backup_and_binary() {
        let p = probe(vec![("head -n1", "MISSING\n"), ("sha256sum", "MISSING\n"), ("is-active", "active\n")]);
        assert!(p.last_backup_time().await.unwrap().is_none());
        let state = p
            .endpoint_protection("clamav-daemon", Path::new("/usr/sbin/clamd"))
            .await
            .unwrap();
        assert!(state.running);
        assert!(state.binary_hash.is_none());
    }

    #[tokio::test]
    async fn test_transport_failure_is_observation_fault() {
        let p = probe(vec![]);
        let err = p.firewall_ruleset().await.unwrap_err();
        assert!(matches!(err, WardenError::Observation(_)));
    }
}
