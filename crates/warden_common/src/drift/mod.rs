//! Drift detection against a signed baseline
//!
//! Purely observational. A benign mismatch is a `Fail`/`Warn` result; only
//! an inability to read local state becomes an `ObservationFault`, which the
//! pipeline treats as indeterminate rather than failing.

pub mod baseline;
pub mod checks;
pub mod probe;
pub mod remote;

pub use baseline::{verifying_key_from_hex, Baseline, EndpointBaseline, SignedBaseline};
pub use checks::{normalized_ruleset_hash, CheckKind, CHECK_SET_VERSION};
pub use probe::{EndpointState, HostProbe, LocalProbe};
pub use remote::RemoteProbe;

use crate::types::{DriftResult, ObservationFault};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One evaluation cycle's output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub host_id: String,
    pub check_set_version: u32,
    pub baseline_version: u32,
    pub evaluated_at: DateTime<Utc>,
    pub results: Vec<DriftResult>,
    pub faults: Vec<ObservationFault>,
}

impl DriftReport {
    pub fn failures(&self) -> impl Iterator<Item = &DriftResult> {
        self.results.iter().filter(|r| r.is_fail())
    }
}

pub struct DriftDetector {
    baseline: Baseline,
    enabled: Vec<CheckKind>,
}

impl DriftDetector {
    pub fn new(baseline: Baseline) -> Self {
        Self {
            baseline,
            enabled: CheckKind::ALL.to_vec(),
        }
    }

    pub fn with_enabled(mut self, enabled: Vec<CheckKind>) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    pub fn enabled_checks(&self) -> &[CheckKind] {
        &self.enabled
    }

    pub async fn evaluate(&self, probe: &dyn HostProbe) -> DriftReport {
        self.evaluate_at(probe, Utc::now()).await
    }

    pub async fn evaluate_at(&self, probe: &dyn HostProbe, now: DateTime<Utc>) -> DriftReport {
        let mut results = Vec::with_capacity(self.enabled.len());
        let mut faults = Vec::new();

        for kind in &self.enabled {
            match checks::run_check(*kind, &self.baseline, probe, now).await {
                Ok(result) => {
                    debug!("{} on {}: {}", kind, probe.host_id(), result.status);
                    results.push(result);
                }
                Err(fault) => {
                    warn!("{} on {} indeterminate: {}", kind, probe.host_id(), fault.reason);
                    faults.push(fault);
                }
            }
        }

        let report = DriftReport {
            host_id: probe.host_id().to_string(),
            check_set_version: CHECK_SET_VERSION,
            baseline_version: self.baseline.version,
            evaluated_at: now,
            results,
            faults,
        };
        info!(
            "Drift evaluation on {}: {} checks, {} failing, {} indeterminate",
            report.host_id,
            report.results.len(),
            report.failures().count(),
            report.faults.len()
        );
        report
    }
}
