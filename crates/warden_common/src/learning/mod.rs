//! Self-learning: L2 outcomes become L1 rules
//!
//! Every remediation result feeds [`PatternStore`]. Patterns with enough
//! clean successes are promoted into the [`RuleCatalog`]; an L1 rule whose
//! run has to roll back is demoted again.

pub mod catalog;
pub mod stats;
pub mod sync;

pub use catalog::{L1Rule, RuleCatalog, RuleStatus};
pub use stats::{wilson_lower_bound, PatternStats, PatternStore, PromotionCandidate, PromotionPolicy};
pub use sync::{rules_hash, AgentOperatingConfig, RuleSyncResponse};

use crate::error::Result;
use crate::types::RemediationResult;
use std::sync::Arc;
use tracing::warn;

/// Pattern statistics plus the catalog they promote into
#[derive(Clone)]
pub struct LearningLoop {
    store: Arc<PatternStore>,
    catalog: Arc<RuleCatalog>,
    policy: PromotionPolicy,
}

impl LearningLoop {
    pub fn new(store: Arc<PatternStore>, catalog: Arc<RuleCatalog>, policy: PromotionPolicy) -> Self {
        Self { store, catalog, policy }
    }

    pub fn store(&self) -> &Arc<PatternStore> {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<RuleCatalog> {
        &self.catalog
    }

    /// Record an outcome and demote its rule if an L1 run rolled back
    pub fn observe(&self, result: &RemediationResult) -> Result<Option<L1Rule>> {
        self.store.record(result)?;
        self.catalog.observe(result)
    }

    /// Promote every qualifying pattern; one bad candidate does not stop the rest
    pub fn sweep(&self) -> Vec<L1Rule> {
        let mut promoted = Vec::new();
        for candidate in self.store.candidates(&self.policy, &self.catalog) {
            match self.catalog.promote(&candidate) {
                Ok(rule) => promoted.push(rule),
                Err(e) => warn!("Promotion of {} failed: {}", candidate.pattern_key, e),
            }
        }
        promoted
    }
}

#[cfg(test)]
mod tests {
    use super::stats::testing::outcome;
    use super::*;
    use crate::types::ResolutionLevel;
    use tempfile::TempDir;

    #[test]
    fn test_sweep_promotes_then_rollback_demotes() {
        let temp = TempDir::new().unwrap();
        let learning = LearningLoop::new(
            Arc::new(PatternStore::open(temp.path().join("patterns.json")).unwrap()),
            Arc::new(RuleCatalog::open(temp.path().join("rules.json")).unwrap()),
            PromotionPolicy::default(),
        );
        for _ in 0..4 {
            learning
                .observe(&outcome("logging", "restart_log_service", true, false, ResolutionLevel::L2))
                .unwrap();
        }
        assert!(learning.sweep().is_empty());
        learning
            .observe(&outcome("logging", "restart_log_service", true, false, ResolutionLevel::L2))
            .unwrap();
        let promoted = learning.sweep();
        assert_eq!(promoted.len(), 1);
        assert!(learning.sweep().is_empty());

        let demoted = learning
            .observe(&outcome("logging", "restart_log_service", false, true, ResolutionLevel::L1))
            .unwrap()
            .unwrap();
        assert_eq!(demoted.id, promoted[0].id);
        assert_eq!(demoted.status, RuleStatus::Deprecated);
        assert!(learning.sweep().is_empty());
    }

    #[tokio::test]
    async fn test_closed_window_does_not_dilute_promotion() {
        use crate::healing::testing::ScriptedExecutor;
        use crate::healing::{ActionRegistry, CatalogPlanner, ExecutorSet, HealRequest, HealingEngine, Target};
        use crate::types::{DriftResult, DriftStatus};
        use chrono::{TimeZone, Utc};

        let temp = TempDir::new().unwrap();
        let learning = LearningLoop::new(
            Arc::new(PatternStore::open(temp.path().join("patterns.json")).unwrap()),
            Arc::new(RuleCatalog::open(temp.path().join("rules.json")).unwrap()),
            PromotionPolicy::default(),
        );
        let executor = Arc::new(ScriptedExecutor::default());
        let engine = HealingEngine::new(
            Arc::new(ActionRegistry::builtin().unwrap()),
            ExecutorSet::uniform(executor.clone()),
        )
        .with_l2(Arc::new(CatalogPlanner))
        .with_window("02:00-04:00".parse().unwrap());

        for (i, hour) in [2, 2, 3, 3, 3, 12].into_iter().enumerate() {
            let host = format!("web{:02}", i);
            let drift = DriftResult::new("logging", DriftStatus::Fail, "active", "inactive").with_host(&host);
            let at = Utc.with_ymd_and_hms(2026, 5, 4, hour, 10, 0).unwrap();
            let outcome = engine.heal_at(&HealRequest::new(drift, Target::local(&host)), at).await;
            learning.observe(&outcome.result).unwrap();
        }

        // Two commands per heal inside the window, none at noon
        assert_eq!(executor.calls().len(), 10);
        let stats = learning.store().get("logging:restart_log_service").unwrap();
        assert_eq!((stats.attempts, stats.successes), (5, 5));
        assert_eq!(learning.sweep().len(), 1);
    }
}
