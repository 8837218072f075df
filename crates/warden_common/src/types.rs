//! Core value types passed between Warden components
//!
//! Every cross-component hand-off is one of these immutable values:
//! detector → gate → healer → evidence → learning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Drift
// ============================================================================

/// Outcome of one compliance check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    Pass,
    Fail,
    Warn,
}

impl fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftStatus::Pass => write!(f, "pass"),
            DriftStatus::Fail => write!(f, "fail"),
            DriftStatus::Warn => write!(f, "warn"),
        }
    }
}

/// One check's result for one evaluation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftResult {
    pub check_name: String,
    pub status: DriftStatus,
    pub expected: String,
    pub actual: String,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
    pub detected_at: DateTime<Utc>,
    /// Host the check ran against (local hostname or remote agent hostname)
    pub host_id: String,
    /// Compliance control this check maps to (e.g. "164.312(b)")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_id: Option<String>,
}

impl DriftResult {
    pub fn new(
        check_name: impl Into<String>,
        status: DriftStatus,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self {
            check_name: check_name.into(),
            status,
            expected: expected.into(),
            actual: actual.into(),
            details: BTreeMap::new(),
            detected_at: Utc::now(),
            host_id: String::new(),
            control_id: None,
        }
    }

    pub fn with_host(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = host_id.into();
        self
    }

    pub fn with_detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    pub fn with_control(mut self, control_id: impl Into<String>) -> Self {
        self.control_id = Some(control_id.into());
        self
    }

    pub fn at(mut self, detected_at: DateTime<Utc>) -> Self {
        self.detected_at = detected_at;
        self
    }

    pub fn is_fail(&self) -> bool {
        self.status == DriftStatus::Fail
    }
}

/// A check that could not observe local state
///
/// Indeterminate, never a compliance failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationFault {
    pub check_name: String,
    pub reason: String,
    pub observed_at: DateTime<Utc>,
}

// ============================================================================
// Remediation
// ============================================================================

/// L1 = deterministic local rule, L2 = centrally-assisted selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionLevel {
    L1,
    L2,
}

impl fmt::Display for ResolutionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionLevel::L1 => write!(f, "L1"),
            ResolutionLevel::L2 => write!(f, "L2"),
        }
    }
}

/// Healing state machine positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealingState {
    Pending,
    MaintenanceCheck,
    PreHealth,
    Execute,
    PostHealth,
    Rollback,
    Success,
    SuccessRolledBack,
    Failed,
}

impl HealingState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HealingState::Success | HealingState::SuccessRolledBack | HealingState::Failed
        )
    }
}

/// Why a command did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecErrorKind {
    Timeout,
    NonZeroExit,
    Transport,
    OutsideMaintenanceWindow,
    PreHealthFailed,
    PostHealthFailed,
    NoPlan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecError {
    pub kind: ExecErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ExecErrorKind {
    /// The run stopped before the remediation command was sent
    pub fn before_execute(self) -> bool {
        matches!(
            self,
            Self::OutsideMaintenanceWindow | Self::PreHealthFailed | Self::NoPlan
        )
    }
}

impl ExecError {
    pub fn new(kind: ExecErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn non_zero(exit_code: i32, stderr: &str) -> Self {
        Self {
            kind: ExecErrorKind::NonZeroExit,
            message: stderr.trim().to_string(),
            exit_code: Some(exit_code),
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{:?} (exit {}): {}", self.kind, code, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// One ordered step recorded during a healing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    pub step: u32,
    pub state: HealingState,
    pub description: String,
    pub success: bool,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Exactly one per healing invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationResult {
    pub incident_id: String,
    pub check_name: String,
    pub host_id: String,
    pub action_taken: String,
    pub runbook_id: String,
    pub success: bool,
    pub resolution_level: ResolutionLevel,
    pub resolution_time_ms: u64,
    pub terminal_state: HealingState,
    pub rolled_back: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecError>,
    pub steps: Vec<ActionStep>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RemediationResult {
    /// Key used by the learning system
    pub fn pattern_key(&self) -> String {
        pattern_key(&self.check_name, &self.action_taken)
    }

    /// Whether the remediation command actually ran
    pub fn executed(&self) -> bool {
        !self.action_taken.is_empty()
            && !self.error.as_ref().is_some_and(|e| e.kind.before_execute())
    }
}

/// Canonical `check:action` key
pub fn pattern_key(check_name: &str, action: &str) -> String {
    format!("{}:{}", check_name, action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drift_status_serializes_lowercase() {
        let json = serde_json::to_string(&DriftStatus::Warn).unwrap();
        assert_eq!(json, "\"warn\"");
    }

    #[test]
    fn test_before_execute_kinds() {
        assert!(ExecErrorKind::OutsideMaintenanceWindow.before_execute());
        assert!(ExecErrorKind::PreHealthFailed.before_execute());
        assert!(ExecErrorKind::NoPlan.before_execute());
        assert!(!ExecErrorKind::PostHealthFailed.before_execute());
        assert!(!ExecErrorKind::Timeout.before_execute());
    }

    #[test]
    fn test_terminal_states() {
        assert!(HealingState::Success.is_terminal());
        assert!(HealingState::SuccessRolledBack.is_terminal());
        assert!(HealingState::Failed.is_terminal());
        assert!(!HealingState::Execute.is_terminal());
        assert!(!HealingState::Rollback.is_terminal());
    }

    #[test]
    fn test_exec_error_display_includes_exit_code() {
        let err = ExecError::non_zero(3, "permission denied\n");
        assert_eq!(err.to_string(), "NonZeroExit (exit 3): permission denied");
    }

    #[test]
    fn test_pattern_key() {
        assert_eq!(pattern_key("firewall", "restore_firewall_baseline"), "firewall:restore_firewall_baseline");
    }
}
