//! Compliance flow across modules: signed baseline, detection, healing,
//! sealed evidence and store-and-forward upload.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::SigningKey;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use warden_common::drift::{
    normalized_ruleset_hash, Baseline, CheckKind, DriftDetector, EndpointBaseline, EndpointState, HostProbe,
    SignedBaseline,
};
use warden_common::evidence::{
    EvidenceBundle, EvidenceChain, EvidenceDraft, EvidenceOutbox, EvidenceUploader, Ed25519Signer,
};
use warden_common::healing::{
    ActionRegistry, CatalogPlanner, ExecOutput, ExecResult, ExecutorSet, HealRequest, HealingEngine,
    RemoteExecutor, Target,
};
use warden_common::{DriftStatus, HealingState, Result, WardenError};

const RULESET: &str = "table inet filter {\n  chain input { policy drop; }\n}\n";

fn baseline() -> Baseline {
    let mut controls = BTreeMap::new();
    controls.insert("logging".to_string(), "164.312(b)".to_string());
    Baseline {
        version: 3,
        max_patch_age_days: 30,
        endpoint_protection: EndpointBaseline {
            service: "falcon-sensor".to_string(),
            binary_path: "/opt/CrowdStrike/falcond".to_string(),
            allowed_hashes: vec!["aa11".to_string()],
        },
        backup_max_age_hours: 24,
        log_services: vec!["rsyslog".to_string(), "auditd".to_string()],
        firewall_ruleset_hash: normalized_ruleset_hash(RULESET),
        encrypted_volumes: vec!["luks-root".to_string()],
        controls,
    }
}

/// A host that is compliant except for a stopped audit daemon
struct ClinicHost;

#[async_trait]
impl HostProbe for ClinicHost {
    fn host_id(&self) -> &str {
        "appliance"
    }
    async fn last_patch_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(Some(Utc::now() - Duration::days(3)))
    }
    async fn endpoint_protection(&self, _service: &str, _binary: &Path) -> Result<EndpointState> {
        Ok(EndpointState {
            running: true,
            binary_hash: Some("AA11".to_string()),
        })
    }
    async fn last_backup_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(Some(Utc::now() - Duration::hours(2)))
    }
    async fn service_active(&self, name: &str) -> Result<bool> {
        Ok(name != "auditd")
    }
    async fn firewall_ruleset(&self) -> Result<String> {
        Ok(format!("# managed\n{}\n", RULESET))
    }
    async fn encrypted_volumes(&self) -> Result<Vec<String>> {
        Ok(vec!["luks-root".to_string()])
    }
}

struct OkExecutor;

#[async_trait]
impl RemoteExecutor for OkExecutor {
    fn name(&self) -> &'static str {
        "ok"
    }

    async fn execute(&self, _target: &Target, _script: &str) -> ExecResult {
        Ok(ExecOutput {
            stdout: "active".to_string(),
            stderr: String::new(),
            exit_code: 0,
            duration_ms: 1,
        })
    }
}

/// Central that is down for the first attempt
#[derive(Default)]
struct FlakyCentral {
    reachable: AtomicBool,
    received: Mutex<Vec<String>>,
}

#[async_trait]
impl EvidenceUploader for FlakyCentral {
    async fn upload(&self, bundle: &EvidenceBundle) -> Result<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(WardenError::Upload("connection refused".to_string()));
        }
        self.received.lock().unwrap().push(bundle.evidence_bundle_hash.clone());
        Ok(())
    }
}

#[test]
fn test_tampered_baseline_is_refused() {
    let temp = TempDir::new().unwrap();
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    let path = temp.path().join("baseline.json");

    let mut signed = SignedBaseline::sign(baseline(), &key).unwrap();
    signed.save(&path).unwrap();
    assert!(SignedBaseline::load_verified(&path, &key.verifying_key()).is_ok());

    // Loosen the patch window without re-signing
    signed.baseline.max_patch_age_days = 365;
    signed.save(&path).unwrap();
    assert!(SignedBaseline::load_verified(&path, &key.verifying_key()).is_err());
}

#[tokio::test]
async fn test_drift_to_uploaded_evidence() {
    let temp = TempDir::new().unwrap();
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    let baseline_path = temp.path().join("baseline.json");
    SignedBaseline::sign(baseline(), &key).unwrap().save(&baseline_path).unwrap();

    // Detect
    let verified = SignedBaseline::load_verified(&baseline_path, &key.verifying_key()).unwrap();
    let detector = DriftDetector::new(verified);
    let report = detector.evaluate(&ClinicHost).await;
    assert_eq!(report.results.len(), CheckKind::ALL.len());
    assert!(report.faults.is_empty());
    let failures: Vec<_> = report.failures().cloned().collect();
    assert_eq!(failures.len(), 1);
    let drift = failures[0].clone();
    assert_eq!(drift.check_name, "logging");
    assert_eq!(drift.control_id.as_deref(), Some("164.312(b)"));
    assert!(report
        .results
        .iter()
        .filter(|r| r.check_name != "logging")
        .all(|r| r.status == DriftStatus::Pass));

    // Heal
    let engine = HealingEngine::new(
        Arc::new(ActionRegistry::builtin().unwrap()),
        ExecutorSet::uniform(Arc::new(OkExecutor)),
    )
    .with_l2(Arc::new(CatalogPlanner));
    let request = HealRequest::new(drift.clone(), Target::local("appliance"));
    let outcome = engine.heal_at(&request, Utc::now()).await;
    assert_eq!(outcome.result.terminal_state, HealingState::Success);
    let runbook = outcome.runbook.expect("runbook resolved");
    assert_eq!(runbook.id, "RB-LOG-001");

    // Seal
    let chain = EvidenceChain::new(temp.path().join("evidence"), "site-1", Arc::new(Ed25519Signer::generate()));
    let draft = EvidenceDraft::from_remediation(&drift, &outcome.result, Some(&runbook));
    let bundle = chain.append("clinic-a", draft).await.unwrap();
    assert_eq!(bundle.chain_index, 0);
    assert!(chain.verify_chain("clinic-a").await.unwrap().is_intact());

    // Forward, surviving one central outage
    let outbox = EvidenceOutbox::new(temp.path().join("spool"));
    outbox.enqueue(&bundle).await.unwrap();
    let central = FlakyCentral::default();
    let now = Utc::now();

    let first = outbox.flush_at(&central, now).await.unwrap();
    assert_eq!(first.uploaded, 0);
    assert_eq!(first.pending, 1);
    assert!(first.error.is_some());

    central.reachable.store(true, Ordering::SeqCst);
    let early = outbox.flush_at(&central, now + Duration::milliseconds(100)).await.unwrap();
    assert!(early.deferred);

    let later = outbox.flush_at(&central, now + Duration::hours(1)).await.unwrap();
    assert_eq!(later.uploaded, 1);
    assert!(outbox.pending().await.unwrap().is_empty());
    assert_eq!(*central.received.lock().unwrap(), vec![bundle.evidence_bundle_hash.clone()]);
}
