//! Configuration management for wardend.
//!
//! Loads settings from /etc/warden/config.toml or uses defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use warden_common::drift::CheckKind;
use warden_common::evidence::anchor::DEFAULT_CALENDARS;
use warden_common::evidence::SignerKind;
use warden_common::healing::{MaintenanceWindow, Target};
use warden_common::learning::{AgentOperatingConfig, PromotionPolicy};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/warden/config.toml";

/// Default config file path for fallback
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/warden/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Evidence chains are kept per client
    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_site_id")]
    pub site_id: String,

    /// Host id used for drift detected on the appliance itself
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Pushed to agents; also the daemon's filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_client_id() -> String {
    "default".to_string()
}

fn default_site_id() -> String {
    "site-local".to_string()
}

fn default_hostname() -> String {
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "appliance".to_string())
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            site_id: default_site_id(),
            hostname: default_hostname(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_evidence_dir")]
    pub evidence_dir: PathBuf,

    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,

    #[serde(default = "default_ca_dir")]
    pub ca_dir: PathBuf,

    /// Signed baseline document
    #[serde(default = "default_baseline")]
    pub baseline: PathBuf,

    /// Hex ed25519 key the baseline must be signed with
    #[serde(default)]
    pub baseline_public_key: String,

    #[serde(default = "default_signer_key")]
    pub signer_key: PathBuf,

    /// Written by backup jobs on completion
    #[serde(default = "default_backup_stamp")]
    pub backup_stamp: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/warden")
}

fn default_evidence_dir() -> PathBuf {
    PathBuf::from("/var/lib/warden/evidence")
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("/var/lib/warden/outbox")
}

fn default_ca_dir() -> PathBuf {
    PathBuf::from("/var/lib/warden/ca")
}

fn default_baseline() -> PathBuf {
    PathBuf::from("/etc/warden/baseline.json")
}

fn default_signer_key() -> PathBuf {
    PathBuf::from("/var/lib/warden/keys/evidence-signer.json")
}

fn default_backup_stamp() -> PathBuf {
    PathBuf::from("/var/lib/warden/backup.stamp")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            evidence_dir: default_evidence_dir(),
            spool_dir: default_spool_dir(),
            ca_dir: default_ca_dir(),
            baseline: default_baseline(),
            baseline_public_key: String::new(),
            signer_key: default_signer_key(),
            backup_stamp: default_backup_stamp(),
        }
    }
}

impl PathsConfig {
    pub fn patterns(&self) -> PathBuf {
        self.state_dir.join("patterns.json")
    }

    pub fn rules(&self) -> PathBuf {
        self.state_dir.join("rules.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Upper bound of the random delay added to each cycle
    #[serde(default = "default_jitter")]
    pub jitter_secs: u64,

    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    #[serde(default = "default_enabled_checks")]
    pub enabled_checks: Vec<String>,
}

fn default_check_interval() -> u64 {
    300
}

fn default_jitter() -> u64 {
    30
}

fn default_cooldown() -> u64 {
    600
}

fn default_enabled_checks() -> Vec<String> {
    CheckKind::ALL.iter().map(|c| c.name().to_string()).collect()
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            jitter_secs: default_jitter(),
            cooldown_secs: default_cooldown(),
            enabled_checks: default_enabled_checks(),
        }
    }
}

impl DetectionConfig {
    /// Known checks in configured order; unknown names are skipped
    pub fn checks(&self) -> Vec<CheckKind> {
        self.enabled_checks
            .iter()
            .filter_map(|name| match name.parse::<CheckKind>() {
                Ok(kind) => Some(kind),
                Err(e) => {
                    warn!("Ignoring enabled check: {}", e);
                    None
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// `HH:MM-HH:MM` in UTC; may wrap past midnight
    #[serde(default = "default_window")]
    pub maintenance_window: String,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub winrm_tls: bool,
}

fn default_true() -> bool {
    true
}

fn default_window() -> String {
    MaintenanceWindow::always().to_string()
}

fn default_command_timeout() -> u64 {
    300
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            maintenance_window: default_window(),
            command_timeout_secs: default_command_timeout(),
            winrm_tls: true,
        }
    }
}

impl HealingConfig {
    pub fn window(&self) -> Result<MaintenanceWindow> {
        self.maintenance_window
            .parse::<MaintenanceWindow>()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Invalid healing.maintenance_window")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimesyncConfig {
    #[serde(default = "default_ntp_servers")]
    pub servers: Vec<String>,

    #[serde(default = "default_ntp_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_min_sources")]
    pub min_sources: usize,

    #[serde(default = "default_max_skew")]
    pub max_skew_ms: f64,
}

fn default_ntp_servers() -> Vec<String> {
    ["time.cloudflare.com", "time.google.com", "pool.ntp.org"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_ntp_timeout() -> u64 {
    2000
}

fn default_min_sources() -> usize {
    warden_common::timesync::DEFAULT_MIN_SOURCES
}

fn default_max_skew() -> f64 {
    warden_common::timesync::DEFAULT_MAX_SKEW_MS
}

impl Default for TimesyncConfig {
    fn default() -> Self {
        Self {
            servers: default_ntp_servers(),
            timeout_ms: default_ntp_timeout(),
            min_sources: default_min_sources(),
            max_skew_ms: default_max_skew(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceConfig {
    #[serde(default)]
    pub signer: SignerKind,

    #[serde(default = "default_true")]
    pub anchor_enabled: bool,

    #[serde(default = "default_calendars")]
    pub calendars: Vec<String>,

    #[serde(default = "default_anchor_timeout")]
    pub anchor_timeout_secs: u64,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Pushed to agents with the rule sync
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: i64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: i64,
}

fn default_calendars() -> Vec<String> {
    DEFAULT_CALENDARS.iter().map(|s| s.to_string()).collect()
}

fn default_anchor_timeout() -> u64 {
    10
}

fn default_flush_interval() -> u64 {
    60
}

fn default_batch_size() -> usize {
    50
}

fn default_backoff_base() -> i64 {
    warden_common::evidence::outbox::DEFAULT_BACKOFF_BASE_SECS
}

fn default_backoff_max() -> i64 {
    warden_common::evidence::outbox::DEFAULT_BACKOFF_MAX_SECS
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            signer: SignerKind::default(),
            anchor_enabled: true,
            calendars: default_calendars(),
            anchor_timeout_secs: default_anchor_timeout(),
            flush_interval_secs: default_flush_interval(),
            batch_size: default_batch_size(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,

    #[serde(default = "default_threshold")]
    pub threshold: f64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_min_samples() -> u64 {
    warden_common::learning::stats::DEFAULT_MIN_SAMPLES
}

fn default_threshold() -> f64 {
    warden_common::learning::stats::DEFAULT_THRESHOLD
}

fn default_sweep_interval() -> u64 {
    3600
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            min_samples: default_min_samples(),
            threshold: default_threshold(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl LearningConfig {
    pub fn policy(&self) -> PromotionPolicy {
        PromotionPolicy {
            min_samples: self.min_samples,
            threshold: self.threshold,
            ..PromotionPolicy::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralConfig {
    /// Unset runs the appliance standalone
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_central_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_rule_sync_interval")]
    pub rule_sync_interval_secs: u64,
}

fn default_retry_count() -> u32 {
    3
}

fn default_central_timeout() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_rule_sync_interval() -> u64 {
    3600
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            retry_count: default_retry_count(),
            timeout_secs: default_central_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            rule_sync_interval_secs: default_rule_sync_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// IP placed in the server certificate SAN; required for mTLS
    #[serde(default)]
    pub server_ip: Option<IpAddr>,

    #[serde(default = "default_true")]
    pub tls: bool,
}

fn default_bind() -> String {
    "0.0.0.0:8443".to_string()
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            server_ip: None,
            tls: true,
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub site: SiteConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub healing: HealingConfig,

    /// Managed hosts reachable for detection and remediation
    #[serde(default)]
    pub hosts: Vec<Target>,

    #[serde(default)]
    pub timesync: TimesyncConfig,

    #[serde(default)]
    pub evidence: EvidenceConfig,

    #[serde(default)]
    pub learning: LearningConfig,

    #[serde(default)]
    pub central: CentralConfig,

    #[serde(default)]
    pub listen: ListenConfig,
}

impl WardenConfig {
    /// Load config from the standard locations, falling back to defaults
    pub fn load() -> Self {
        Self::load_from_path(Path::new(CONFIG_PATH))
            .or_else(|_| Self::load_from_path(Path::new(DEFAULT_CONFIG_PATH)))
            .unwrap_or_else(|e| {
                warn!("Config not found, using defaults: {}", e);
                WardenConfig::default()
            })
    }

    /// Load config from specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let config: WardenConfig =
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Operating parameters served to agents on rule sync
    pub fn agent_config(&self) -> AgentOperatingConfig {
        let (start, end) = self
            .healing
            .maintenance_window
            .split_once('-')
            .map(|(s, e)| (s.trim().to_string(), e.trim().to_string()))
            .unwrap_or_default();
        AgentOperatingConfig {
            check_interval_seconds: self.detection.check_interval_secs,
            heartbeat_interval_seconds: self.central.heartbeat_interval_secs,
            rule_sync_interval_seconds: self.central.rule_sync_interval_secs,
            retry_count: self.central.retry_count,
            evidence_batch_size: self.evidence.batch_size,
            log_level: self.site.log_level.clone(),
            enabled_checks: self.detection.enabled_checks.clone(),
            cooldown_seconds: self.detection.cooldown_secs,
            maintenance_window_start: start,
            maintenance_window_end: end,
            healing_enabled: self.healing.enabled,
        }
    }

    /// Remediation targets: the appliance itself, then configured hosts
    pub fn targets(&self) -> Vec<Target> {
        let mut targets = vec![Target::local(&self.site.hostname)];
        targets.extend(
            self.hosts
                .iter()
                .filter(|t| t.hostname != self.site.hostname)
                .cloned(),
        );
        targets
    }
}
