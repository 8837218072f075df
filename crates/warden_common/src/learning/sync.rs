//! Rule sync payload served to agents

use super::catalog::{L1Rule, RuleCatalog};
use crate::canonical::{canonical_json, sha256_hex};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operating parameters pushed alongside the rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOperatingConfig {
    pub check_interval_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub rule_sync_interval_seconds: u64,
    pub retry_count: u32,
    pub evidence_batch_size: usize,
    pub log_level: String,
    pub enabled_checks: Vec<String>,
    pub cooldown_seconds: u64,
    pub maintenance_window_start: String,
    pub maintenance_window_end: String,
    pub healing_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSyncResponse {
    pub server_time: DateTime<Utc>,
    pub site_id: String,
    pub catalog_version: u64,
    pub rules: Vec<L1Rule>,
    pub rules_hash: String,
    pub config: AgentOperatingConfig,
}

impl RuleSyncResponse {
    pub fn build(catalog: &RuleCatalog, site_id: &str, config: AgentOperatingConfig) -> Result<Self> {
        let rules = catalog.active_rules();
        Ok(Self {
            server_time: Utc::now(),
            site_id: site_id.to_string(),
            catalog_version: catalog.version(),
            rules_hash: rules_hash(&rules)?,
            rules,
            config,
        })
    }
}

/// First 16 hex chars of SHA-256 over the canonical rule list
pub fn rules_hash(rules: &[L1Rule]) -> Result<String> {
    let canonical = canonical_json(&rules)?;
    let mut digest = sha256_hex(&canonical);
    digest.truncate(16);
    Ok(digest)
}
