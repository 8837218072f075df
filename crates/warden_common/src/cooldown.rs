//! Flap suppression for repeatedly failing checks
//!
//! Keyed per host and check. A failing check proceeds to healing only if it
//! has never been reported or its last report is older than the window; the
//! report time is then restamped. Passes never clear an entry, so
//! fail → pass → fail inside the window heals once.
//!
//! The state lives in this owned object (not a process global) so each
//! scheduler and each test gets its own instance.

use crate::types::{DriftResult, DriftStatus};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Default cooldown window
pub const DEFAULT_COOLDOWN_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Proceed to healing and incident reporting
    Heal,
    /// Reported too recently; no healing, no incident
    Suppressed { remaining_secs: i64 },
    /// Not a failure; state untouched
    NotFailing,
    /// No healing subsystem configured; state untouched
    NoHealer,
}

pub struct CooldownGate {
    window: Duration,
    last_report: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Default for CooldownGate {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_COOLDOWN_SECS))
    }
}

impl CooldownGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_report: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn key(result: &DriftResult) -> String {
        if result.host_id.is_empty() {
            result.check_name.clone()
        } else {
            format!("{}:{}", result.host_id, result.check_name)
        }
    }

    pub fn evaluate(&self, result: &DriftResult, healer_available: bool) -> GateDecision {
        self.evaluate_at(result, healer_available, Utc::now())
    }

    /// Atomic check-and-set for the result's key
    pub fn evaluate_at(
        &self,
        result: &DriftResult,
        healer_available: bool,
        now: DateTime<Utc>,
    ) -> GateDecision {
        if !healer_available {
            return GateDecision::NoHealer;
        }
        if result.status != DriftStatus::Fail {
            return GateDecision::NotFailing;
        }

        let key = Self::key(result);
        // The map is only ever inserted into, so a poisoned guard is still consistent
        let mut reports = self.last_report.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(last) = reports.get(&key) {
            let age = now - *last;
            if age <= self.window {
                let remaining_secs = (self.window - age).num_seconds();
                debug!("Suppressing {} ({}s of cooldown left)", key, remaining_secs);
                return GateDecision::Suppressed { remaining_secs };
            }
        }

        reports.insert(key, now);
        GateDecision::Heal
    }

    pub fn last_report(&self, key: &str) -> Option<DateTime<Utc>> {
        self.last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
    }
}
