//! Versioned L1 rule catalog
//!
//! Promotion and demotion are the only mutators. Every mutation bumps the
//! catalog version and the rule's own version, then persists.

use super::stats::{save_json, PatternStats, PromotionCandidate};
use crate::error::{Result, WardenError};
use crate::healing::{L1Match, L1Rules, RemediationAction};
use crate::types::{DriftResult, RemediationResult, ResolutionLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Active,
    Deprecated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L1Rule {
    pub id: String,
    pub name: String,
    /// Check name the rule answers
    pub incident_type: String,
    pub runbook_id: String,
    /// Equality conditions on `status`, `host_id` or any drift detail key
    #[serde(default)]
    pub match_conditions: BTreeMap<String, Value>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub compliance_tags: Vec<String>,
    pub version: u32,
    pub status: RuleStatus,
    /// Pattern key the rule was learned from
    pub promoted_from: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub sample_size: u64,
    pub updated_at: DateTime<Utc>,
}

impl L1Rule {
    pub fn rule_id(pattern_key: &str) -> String {
        format!("L1-AUTO-{}", pattern_key.replace([':', '_'], "-").to_uppercase())
    }

    /// Draft rule for a pattern that qualified for promotion
    pub fn proposed(stats: &PatternStats, confidence: f64) -> Self {
        let mut match_conditions = BTreeMap::new();
        match_conditions.insert("status".to_string(), Value::String("fail".to_string()));
        Self {
            id: Self::rule_id(&stats.pattern_key),
            name: format!("Auto-promoted: {} via {}", stats.check_name, stats.action_taken),
            incident_type: stats.check_name.clone(),
            runbook_id: stats.runbook_id.clone(),
            match_conditions,
            parameters: BTreeMap::new(),
            compliance_tags: compliance_tags(&stats.check_name),
            version: 1,
            status: RuleStatus::Active,
            promoted_from: stats.pattern_key.clone(),
            confidence,
            sample_size: stats.attempts,
            updated_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }

    pub fn matches(&self, drift: &DriftResult) -> bool {
        if !self.is_active() || self.incident_type != drift.check_name {
            return false;
        }
        self.match_conditions.iter().all(|(key, expected)| match key.as_str() {
            "status" => expected.as_str() == Some(drift.status.to_string().as_str()),
            "host_id" => expected.as_str() == Some(drift.host_id.as_str()),
            other => drift.details.get(other) == Some(expected),
        })
    }
}

/// HIPAA safeguard citations attached to promoted rules
fn compliance_tags(check_name: &str) -> Vec<String> {
    let tags: &[&str] = match check_name {
        "patching" => &["164.308(a)(1)(ii)(B)", "164.308(a)(5)(ii)(B)"],
        "endpoint_protection" => &["164.308(a)(5)(ii)(B)"],
        "backup" => &["164.308(a)(7)(ii)(A)"],
        "logging" => &["164.312(b)"],
        "firewall" => &["164.312(e)(1)"],
        "encryption" => &["164.312(a)(2)(iv)"],
        _ => &[],
    };
    tags.iter().map(|t| t.to_string()).collect()
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CatalogFile {
    version: u64,
    rules: BTreeMap<String, L1Rule>,
}

pub struct RuleCatalog {
    path: PathBuf,
    state: RwLock<CatalogFile>,
}

impl RuleCatalog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> u64 {
        self.read().version
    }

    pub fn get(&self, id: &str) -> Option<L1Rule> {
        self.read().rules.get(id).cloned()
    }

    pub fn active_rules(&self) -> Vec<L1Rule> {
        self.read().rules.values().filter(|r| r.is_active()).cloned().collect()
    }

    pub fn has_active(&self, pattern_key: &str) -> bool {
        self.read()
            .rules
            .values()
            .any(|r| r.is_active() && r.promoted_from == pattern_key)
    }

    /// Activate the candidate's rule, reviving a deprecated one at a new version
    pub fn promote(&self, candidate: &PromotionCandidate) -> Result<L1Rule> {
        let proposed = &candidate.proposed_rule;
        if RemediationAction::from_runbook_id(&proposed.runbook_id).is_none() {
            return Err(WardenError::Registry(format!(
                "rule {} references unknown runbook {}",
                proposed.id, proposed.runbook_id
            )));
        }

        let mut state = self.write();
        let mut rule = proposed.clone();
        rule.status = RuleStatus::Active;
        rule.confidence = candidate.confidence;
        rule.sample_size = candidate.sample_size;
        rule.updated_at = Utc::now();
        match state.rules.get(&rule.id) {
            Some(existing) if existing.is_active() => {
                return Err(WardenError::Registry(format!("rule {} is already active", rule.id)));
            }
            Some(existing) => rule.version = existing.version + 1,
            None => rule.version = 1,
        }

        state.version += 1;
        state.rules.insert(rule.id.clone(), rule.clone());
        save_json(&self.path, &*state)?;
        info!(
            "Promoted {} to L1 rule {} v{} (confidence {:.3}, n={})",
            rule.promoted_from, rule.id, rule.version, rule.confidence, rule.sample_size
        );
        Ok(rule)
    }

    /// Demote the promoted rule behind an L1 run that had to roll back
    pub fn observe(&self, result: &RemediationResult) -> Result<Option<L1Rule>> {
        if result.resolution_level != ResolutionLevel::L1 || !result.rolled_back {
            return Ok(None);
        }
        let key = result.pattern_key();
        let mut state = self.write();
        let Some(rule) = state
            .rules
            .values_mut()
            .find(|r| r.is_active() && r.promoted_from == key)
        else {
            return Ok(None);
        };

        rule.status = RuleStatus::Deprecated;
        rule.version += 1;
        rule.updated_at = Utc::now();
        let demoted = rule.clone();
        state.version += 1;
        save_json(&self.path, &*state)?;
        warn!(
            "Demoted L1 rule {} to v{} after rollback in {}",
            demoted.id, demoted.version, result.incident_id
        );
        Ok(Some(demoted))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CatalogFile> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CatalogFile> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl L1Rules for RuleCatalog {
    fn match_rule(&self, drift: &DriftResult) -> Option<L1Match> {
        let state = self.read();
        state.rules.values().filter(|r| r.matches(drift)).find_map(|rule| {
            let action = RemediationAction::from_runbook_id(&rule.runbook_id)?;
            Some(L1Match {
                rule_id: rule.id.clone(),
                action,
                parameters: rule.parameters.clone(),
            })
        })
    }
}
