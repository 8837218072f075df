//! The evidence bundle record and its canonical digest

use crate::canonical::{canonical_json_without, sha256_hex};
use crate::error::Result;
use crate::healing::{Runbook, CATALOG_VERSION};
use crate::timesync::NtpVerification;
use crate::types::{
    ActionStep, DriftResult, DriftStatus, ExecError, HealingState, RemediationResult,
    ResolutionLevel,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fields outside the signed digest
pub const UNHASHED_FIELDS: [&str; 3] = ["evidence_bundle_hash", "signature", "ots_proof"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub incident_id: String,
    pub check_name: String,
    pub status: DriftStatus,
    pub expected: String,
    pub actual: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_id: Option<String>,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunbookRecord {
    pub runbook_id: String,
    pub action: String,
    pub catalog_version: u32,
    /// SHA-256 of the executed script text; empty when nothing ran
    pub script_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub resolution_level: ResolutionLevel,
    pub terminal_state: HealingState,
    pub success: bool,
    pub rolled_back: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resolution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecError>,
    pub steps: Vec<ActionStep>,
}

/// OpenTimestamps anchor attached after hashing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtsProof {
    pub calendar_url: String,
    /// base64 of the `.ots` detached timestamp file
    pub proof: String,
    pub submitted_at: DateTime<Utc>,
}

/// Everything about one incident that the chain builder does not assign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceDraft {
    pub host_id: String,
    pub incident: IncidentRecord,
    pub runbook: RunbookRecord,
    pub execution: ExecutionRecord,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

impl EvidenceDraft {
    pub fn from_remediation(drift: &DriftResult, result: &RemediationResult, runbook: Option<&Runbook>) -> Self {
        let mut outputs = BTreeMap::new();
        for step in &result.steps {
            if let Some(output) = &step.output {
                outputs.insert(format!("step_{:02}", step.step), output.clone());
            }
        }

        Self {
            host_id: result.host_id.clone(),
            incident: IncidentRecord {
                incident_id: result.incident_id.clone(),
                check_name: drift.check_name.clone(),
                status: drift.status,
                expected: drift.expected.clone(),
                actual: drift.actual.clone(),
                control_id: drift.control_id.clone(),
                detected_at: drift.detected_at,
                details: drift.details.clone(),
            },
            runbook: RunbookRecord {
                runbook_id: result.runbook_id.clone(),
                action: result.action_taken.clone(),
                catalog_version: CATALOG_VERSION,
                script_hash: runbook
                    .map(|rb| sha256_hex(rb.execute.as_bytes()))
                    .unwrap_or_default(),
            },
            execution: ExecutionRecord {
                resolution_level: result.resolution_level,
                terminal_state: result.terminal_state,
                success: result.success,
                rolled_back: result.rolled_back,
                started_at: result.started_at,
                finished_at: result.finished_at,
                resolution_time_ms: result.resolution_time_ms,
                error: result.error.clone(),
                steps: result.steps.clone(),
            },
            outputs,
        }
    }
}

/// One persisted, signed link of a client's evidence chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub bundle_id: String,
    pub client_id: String,
    pub site_id: String,
    pub host_id: String,
    pub chain_index: u64,
    /// Hash of the previous link; `null` only at index 0
    pub prev_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub incident: IncidentRecord,
    pub runbook: RunbookRecord,
    pub execution: ExecutionRecord,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    pub time_verification: NtpVerification,
    /// `ed25519` or `blake3-mac`
    pub signature_algorithm: String,
    pub signer_key_id: String,
    pub evidence_bundle_hash: String,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ots_proof: Option<OtsProof>,
}

impl EvidenceBundle {
    /// Canonical bytes covered by the digest
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical_json_without(self, &UNHASHED_FIELDS)
    }

    /// SHA-256 hex of the canonical form
    pub fn compute_hash(&self) -> Result<String> {
        Ok(sha256_hex(&self.canonical_bytes()?))
    }

    /// Raw 32-byte digest, the message that gets signed and anchored
    pub fn digest_bytes(&self) -> Result<[u8; 32]> {
        Ok(crate::canonical::sha256(&self.canonical_bytes()?))
    }

    pub fn file_name(&self) -> String {
        bundle_file_name(self.chain_index)
    }
}

pub fn bundle_file_name(chain_index: u64) -> String {
    format!("{:010}.json", chain_index)
}
