//! Per-pattern outcome statistics and promotion candidates

use super::catalog::{L1Rule, RuleCatalog};
use crate::error::Result;
use crate::types::RemediationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// One-sided 80% z-score
pub const PROMOTION_Z: f64 = 0.8416;
pub const DEFAULT_MIN_SAMPLES: u64 = 5;
pub const DEFAULT_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternStats {
    pub pattern_key: String,
    pub check_name: String,
    pub action_taken: String,
    pub runbook_id: String,
    pub attempts: u64,
    pub successes: u64,
    pub rollbacks: u64,
    pub total_resolution_ms: u64,
    pub last_seen: DateTime<Utc>,
}

impl PatternStats {
    pub fn confidence(&self, z: f64) -> f64 {
        wilson_lower_bound(self.successes, self.attempts, z)
    }

    pub fn mean_resolution_ms(&self) -> u64 {
        self.total_resolution_ms.checked_div(self.attempts).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PromotionPolicy {
    pub min_samples: u64,
    pub threshold: f64,
    pub z: f64,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            min_samples: DEFAULT_MIN_SAMPLES,
            threshold: DEFAULT_THRESHOLD,
            z: PROMOTION_Z,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionCandidate {
    pub pattern_key: String,
    pub confidence: f64,
    pub sample_size: u64,
    pub proposed_rule: L1Rule,
}

/// Lower bound of the Wilson score interval for a success proportion
pub fn wilson_lower_bound(successes: u64, n: u64, z: f64) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    let p = successes as f64 / n;
    let z2 = z * z;
    let centre = p + z2 / (2.0 * n);
    let margin = z * ((p * (1.0 - p) + z2 / (4.0 * n)) / n).sqrt();
    ((centre - margin) / (1.0 + z2 / n)).max(0.0)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    patterns: BTreeMap<String, PatternStats>,
}

/// Persisted pattern statistics, keyed `check_name:action`
pub struct PatternStore {
    path: PathBuf,
    state: Mutex<StoreFile>,
}

impl PatternStore {
    /// Load from disk or start empty
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fold one remediation outcome into its pattern and persist
    pub fn record(&self, result: &RemediationResult) -> Result<Option<PatternStats>> {
        if !result.executed() {
            debug!("{} did not execute; not counted", result.incident_id);
            return Ok(None);
        }
        let key = result.pattern_key();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let stats = state.patterns.entry(key.clone()).or_insert_with(|| PatternStats {
            pattern_key: key.clone(),
            check_name: result.check_name.clone(),
            action_taken: result.action_taken.clone(),
            runbook_id: result.runbook_id.clone(),
            attempts: 0,
            successes: 0,
            rollbacks: 0,
            total_resolution_ms: 0,
            last_seen: result.finished_at,
        });
        stats.attempts += 1;
        if result.success {
            stats.successes += 1;
        }
        if result.rolled_back {
            stats.rollbacks += 1;
        }
        stats.total_resolution_ms = stats.total_resolution_ms.saturating_add(result.resolution_time_ms);
        stats.last_seen = stats.last_seen.max(result.finished_at);
        let snapshot = stats.clone();

        save_json(&self.path, &*state)?;
        debug!(
            "Pattern {}: {}/{} successes, {} rollbacks",
            key, snapshot.successes, snapshot.attempts, snapshot.rollbacks
        );
        Ok(Some(snapshot))
    }

    pub fn get(&self, pattern_key: &str) -> Option<PatternStats> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .patterns
            .get(pattern_key)
            .cloned()
    }

    pub fn all(&self) -> Vec<PatternStats> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .patterns
            .values()
            .cloned()
            .collect()
    }

    /// Patterns eligible for L1 promotion
    ///
    /// Requires enough samples, zero rollbacks, confidence at or above the
    /// threshold, and no active rule for the pattern already.
    pub fn candidates(&self, policy: &PromotionPolicy, catalog: &RuleCatalog) -> Vec<PromotionCandidate> {
        let mut out = Vec::new();
        for stats in self.all() {
            if stats.attempts < policy.min_samples || stats.rollbacks > 0 {
                continue;
            }
            let confidence = stats.confidence(policy.z);
            if confidence < policy.threshold {
                continue;
            }
            if catalog.has_active(&stats.pattern_key) {
                continue;
            }
            info!(
                "Promotion candidate {} (confidence {:.3} over {} samples)",
                stats.pattern_key, confidence, stats.attempts
            );
            out.push(PromotionCandidate {
                pattern_key: stats.pattern_key.clone(),
                confidence,
                sample_size: stats.attempts,
                proposed_rule: L1Rule::proposed(&stats, confidence),
            });
        }
        out
    }
}

/// Write via a temp file and rename
pub(crate) fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::outcome;
    use super::*;
    use crate::types::{ExecError, ExecErrorKind, ResolutionLevel};
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> (PatternStore, RuleCatalog) {
        (
            PatternStore::open(temp.path().join("patterns.json")).unwrap(),
            RuleCatalog::open(temp.path().join("rules.json")).unwrap(),
        )
    }

    #[test]
    fn test_wilson_bound_values() {
        assert_eq!(wilson_lower_bound(0, 0, PROMOTION_Z), 0.0);
        // 5/5 reduces to 1 / (1 + z²/5)
        let expected = 1.0 / (1.0 + PROMOTION_Z * PROMOTION_Z / 5.0);
        assert_relative_eq!(wilson_lower_bound(5, 5, PROMOTION_Z), expected, epsilon = 1e-12);
        assert!(wilson_lower_bound(5, 5, PROMOTION_Z) >= DEFAULT_THRESHOLD);
        assert!(wilson_lower_bound(4, 5, PROMOTION_Z) < DEFAULT_THRESHOLD);
        assert!(wilson_lower_bound(4, 4, PROMOTION_Z) < wilson_lower_bound(5, 5, PROMOTION_Z));
    }

    #[test]
    fn test_five_clean_successes_promote() {
        let temp = TempDir::new().unwrap();
        let (store, catalog) = store(&temp);
        for i in 0..5 {
            assert!(store.candidates(&PromotionPolicy::default(), &catalog).is_empty(), "early at {}", i);
            store
                .record(&outcome("logging", "restart_log_service", true, false, ResolutionLevel::L2))
                .unwrap();
        }
        let candidates = store.candidates(&PromotionPolicy::default(), &catalog);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].pattern_key, "logging:restart_log_service");
        assert_eq!(candidates[0].sample_size, 5);
        assert!(candidates[0].confidence >= 0.85);
    }

    #[test]
    fn test_any_rollback_blocks_promotion() {
        let temp = TempDir::new().unwrap();
        let (store, catalog) = store(&temp);
        store
            .record(&outcome("firewall", "restore_firewall_baseline", false, true, ResolutionLevel::L2))
            .unwrap();
        for _ in 0..50 {
            store
                .record(&outcome("firewall", "restore_firewall_baseline", true, false, ResolutionLevel::L2))
                .unwrap();
        }
        assert!(store.candidates(&PromotionPolicy::default(), &catalog).is_empty());
    }

    #[test]
    fn test_existing_active_rule_suppresses_candidate() {
        let temp = TempDir::new().unwrap();
        let (store, catalog) = store(&temp);
        for _ in 0..5 {
            store
                .record(&outcome("logging", "restart_log_service", true, false, ResolutionLevel::L2))
                .unwrap();
        }
        let candidate = store.candidates(&PromotionPolicy::default(), &catalog).remove(0);
        catalog.promote(&candidate).unwrap();
        assert!(store.candidates(&PromotionPolicy::default(), &catalog).is_empty());
    }

    #[test]
    fn test_stats_persist_across_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let (store, _) = store(&temp);
            store
                .record(&outcome("backup", "run_backup", true, false, ResolutionLevel::L2))
                .unwrap();
            store
                .record(&outcome("backup", "run_backup", false, false, ResolutionLevel::L2))
                .unwrap();
        }
        let (store, _) = store(&temp);
        let stats = store.get("backup:run_backup").unwrap();
        assert_eq!((stats.attempts, stats.successes, stats.rollbacks), (2, 1, 0));
        assert_eq!(stats.mean_resolution_ms(), 100);
    }

    #[test]
    fn test_unplanned_results_not_recorded() {
        let temp = TempDir::new().unwrap();
        let (store, _) = store(&temp);
        let recorded = store
            .record(&outcome("logging", "", false, false, ResolutionLevel::L2))
            .unwrap();
        assert!(recorded.is_none());
        assert!(store.all().is_empty());
    }

    #[test]
    fn test_runs_stopped_before_execute_not_recorded() {
        let temp = TempDir::new().unwrap();
        let (store, _) = store(&temp);
        let mut skipped = outcome("backup", "run_backup", false, false, ResolutionLevel::L2);
        skipped.error = Some(ExecError::new(ExecErrorKind::OutsideMaintenanceWindow, "12:00 is outside 02:00-04:00"));
        assert!(store.record(&skipped).unwrap().is_none());

        let mut failed = outcome("backup", "run_backup", false, false, ResolutionLevel::L2);
        failed.error = Some(ExecError::non_zero(2, "disk full"));
        assert_eq!(store.record(&failed).unwrap().unwrap().attempts, 1);
    }
}
