//! End-to-end tests for the appliance: agent API and the drift pipeline
//!
//! Remote execution is replaced by an executor that always succeeds, so the
//! healing state machine, evidence chain and learning loop run for real.

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use warden_common::evidence::{EvidenceChain, Ed25519Signer};
use warden_common::fleet::FleetRegistry;
use warden_common::healing::{
    ActionRegistry, CatalogPlanner, ExecOutput, ExecResult, ExecutorSet, HealingEngine, L1Rules,
    MaintenanceWindow, RemoteExecutor, Target, TargetOs,
};
use warden_common::learning::{LearningLoop, PatternStore, PromotionPolicy, RuleCatalog};
use warden_common::trust::TrustFabric;
use warden_common::{CooldownGate, DriftResult, DriftStatus, ResolutionLevel};
use wardend::config::WardenConfig;
use wardend::pipeline::{spawn_evidence_worker, Disposition, Pipeline};
use wardend::server::{router, AppState};

const CLIENT: &str = "clinic-a";
const SITE: &str = "site-local";

#[derive(Default)]
struct OkExecutor {
    calls: AtomicUsize,
}

#[async_trait]
impl RemoteExecutor for OkExecutor {
    fn name(&self) -> &'static str {
        "ok"
    }

    async fn execute(&self, _target: &Target, _script: &str) -> ExecResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExecOutput {
            stdout: "ok".to_string(),
            stderr: String::new(),
            exit_code: 0,
            duration_ms: 1,
        })
    }
}

fn linux_target(hostname: &str) -> Target {
    Target {
        hostname: hostname.to_string(),
        address: "10.0.0.10".to_string(),
        os: TargetOs::Linux,
        username: "warden".to_string(),
        port: None,
        credential: None,
        local: false,
    }
}

fn failing(check: &str, host: &str) -> DriftResult {
    DriftResult::new(check, DriftStatus::Fail, "active", "inactive").with_host(host)
}

struct Harness {
    _dir: TempDir,
    chain: Arc<EvidenceChain>,
    learning: LearningLoop,
    trust: Arc<TrustFabric>,
    executor: Arc<OkExecutor>,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let chain = Arc::new(EvidenceChain::new(
            dir.path().join("evidence"),
            SITE,
            Arc::new(Ed25519Signer::generate()),
        ));
        let catalog = Arc::new(RuleCatalog::open(dir.path().join("rules.json")).unwrap());
        let store = Arc::new(PatternStore::open(dir.path().join("patterns.json")).unwrap());
        let learning = LearningLoop::new(store, catalog, PromotionPolicy::default());
        let trust = Arc::new(TrustFabric::init(dir.path().join("ca")).unwrap());
        Self {
            _dir: dir,
            chain,
            learning,
            trust,
            executor: Arc::new(OkExecutor::default()),
        }
    }

    fn engine(&self, window: MaintenanceWindow) -> Arc<HealingEngine> {
        let registry = Arc::new(ActionRegistry::builtin().unwrap());
        let l1: Arc<dyn L1Rules> = self.learning.catalog().clone();
        Arc::new(
            HealingEngine::new(registry, ExecutorSet::uniform(self.executor.clone()))
                .with_window(window)
                .with_l1(l1)
                .with_l2(Arc::new(CatalogPlanner)),
        )
    }

    fn pipeline(
        &self,
        targets: Vec<Target>,
    ) -> (Pipeline, tokio::sync::mpsc::UnboundedReceiver<wardend::pipeline::EvidenceJob>) {
        self.pipeline_in(MaintenanceWindow::always(), targets)
    }

    fn pipeline_in(
        &self,
        window: MaintenanceWindow,
        targets: Vec<Target>,
    ) -> (Pipeline, tokio::sync::mpsc::UnboundedReceiver<wardend::pipeline::EvidenceJob>) {
        Pipeline::new(
            CLIENT,
            Arc::new(CooldownGate::default()),
            Some(self.engine(window)),
            targets,
            self.learning.clone(),
        )
    }

    fn app(&self, pipeline: Pipeline) -> axum::Router {
        let fleet = Arc::new(FleetRegistry::new(300, vec!["backup".to_string()]).with_trust(self.trust.clone()));
        let state = AppState::new(
            SITE,
            WardenConfig::default().agent_config(),
            fleet,
            self.learning.catalog().clone(),
            Arc::new(pipeline),
        );
        router(state)
    }
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Agent API
// ============================================================================

mod api {
    use super::*;

    #[tokio::test]
    async fn test_health_reports_catalog_version() {
        let harness = Harness::new();
        let (pipeline, _rx) = harness.pipeline(vec![]);
        let app = harness.app(pipeline);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["agents"], 0);
        assert_eq!(body["catalog_version"], 0);
    }

    #[tokio::test]
    async fn test_register_issues_certificate() {
        let harness = Harness::new();
        let (pipeline, _rx) = harness.pipeline(vec![]);
        let app = harness.app(pipeline);

        let response = app
            .oneshot(post_json(
                "/api/agents/register",
                json!({"hostname": "ws01", "os_version": "Windows 11", "machine_id": "m-1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["agent_id"].as_str().unwrap().starts_with("agent-"));
        assert_eq!(body["check_interval_seconds"], 300);
        assert!(body["certificate"]["cert_pem"].as_str().unwrap().contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn test_register_without_hostname_is_bad_request() {
        let harness = Harness::new();
        let (pipeline, _rx) = harness.pipeline(vec![]);
        let app = harness.app(pipeline);

        let response = app
            .oneshot(post_json("/api/agents/register", json!({"hostname": "  "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_heartbeat_from_unknown_agent_is_not_found() {
        let harness = Harness::new();
        let (pipeline, _rx) = harness.pipeline(vec![]);
        let app = harness.app(pipeline);

        let response = app
            .oneshot(post_json(
                "/api/agents/heartbeat",
                json!({"agent_id": "agent-nope", "timestamp": "2026-01-01T00:00:00Z"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_register_then_heartbeat_then_drift() {
        let harness = Harness::new();
        let (pipeline, _rx) = harness.pipeline(vec![]);
        let app = harness.app(pipeline);

        let response = app
            .clone()
            .oneshot(post_json("/api/agents/register", json!({"hostname": "ws02"})))
            .await
            .unwrap();
        let agent_id = body_json(response).await["agent_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/agents/heartbeat",
                json!({"agent_id": agent_id, "timestamp": "2026-01-01T00:00:00Z"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["acknowledged"], true);

        let response = app
            .oneshot(post_json(
                "/api/agents/drift",
                json!({
                    "agent_id": agent_id,
                    "hostname": "ws02",
                    "check_type": "firewall",
                    "passed": false,
                    "expected": "enabled",
                    "actual": "disabled"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["check_name"], "firewall");
        assert_eq!(body["status"], "fail");
    }

    #[tokio::test]
    async fn test_rule_sync_checks_site() {
        let harness = Harness::new();
        let (pipeline, _rx) = harness.pipeline(vec![]);
        let app = harness.app(pipeline);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/rules/sync?site_id=elsewhere")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/rules/sync?site_id={}", SITE))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["rules"].as_array().unwrap().len(), 0);
        assert_eq!(body["rules_hash"].as_str().unwrap().len(), 16);
        assert_eq!(body["config"]["cooldown_seconds"], 600);
    }
}

// ============================================================================
// Pipeline
// ============================================================================

mod pipeline {
    use super::*;

    #[tokio::test]
    async fn test_flapping_check_heals_once() {
        let harness = Harness::new();
        let (pipeline, rx) = harness.pipeline(vec![linux_target("web01")]);
        let worker = spawn_evidence_worker(harness.chain.clone(), None, rx);

        let first = pipeline.process(failing("logging", "web01")).await;
        let second = pipeline.process(failing("logging", "web01")).await;

        match first {
            Disposition::Remediated(result) => {
                assert!(result.success);
                assert_eq!(result.resolution_level, ResolutionLevel::L2);
            }
            other => panic!("expected remediation, got {:?}", other),
        }
        assert!(matches!(second, Disposition::Suppressed { .. }));

        drop(pipeline);
        worker.await.unwrap();

        let bundles = harness.chain.list(CLIENT).await.unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].host_id, "web01");
        let report = harness.chain.verify_chain(CLIENT).await.unwrap();
        assert!(report.is_intact());

        let stats = harness.learning.store().get("logging:restart_log_service").unwrap();
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.successes, 1);
    }

    #[tokio::test]
    async fn test_passing_and_unknown_hosts_are_not_healed() {
        let harness = Harness::new();
        let (pipeline, _rx) = harness.pipeline(vec![linux_target("web01")]);

        let pass = DriftResult::new("logging", DriftStatus::Pass, "active", "active").with_host("web01");
        assert_eq!(pipeline.process(pass).await, Disposition::NotFailing);
        assert_eq!(pipeline.process(failing("logging", "ghost")).await, Disposition::NoHealer);
        assert_eq!(harness.executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_repeated_success_promotes_to_l1() {
        let harness = Harness::new();
        let hosts: Vec<String> = (1..=6).map(|i| format!("web{:02}", i)).collect();
        let (pipeline, rx) = harness.pipeline(hosts.iter().map(|h| linux_target(h)).collect());
        let worker = spawn_evidence_worker(harness.chain.clone(), None, rx);

        for host in &hosts[..5] {
            let outcome = pipeline.process(failing("logging", host)).await;
            assert!(matches!(outcome, Disposition::Remediated(ref r) if r.success));
        }

        let promoted = harness.learning.sweep();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, "L1-AUTO-LOGGING-RESTART-LOG-SERVICE");

        match pipeline.process(failing("logging", &hosts[5])).await {
            Disposition::Remediated(result) => assert_eq!(result.resolution_level, ResolutionLevel::L1),
            other => panic!("expected remediation, got {:?}", other),
        }

        drop(pipeline);
        worker.await.unwrap();
        assert_eq!(harness.chain.list(CLIENT).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_closed_window_parks_heal_until_shutdown() {
        let harness = Harness::new();
        let now = chrono::Utc::now().time();
        let later = MaintenanceWindow::new(now + chrono::Duration::hours(2), now + chrono::Duration::hours(3));
        let (pipeline, rx) = harness.pipeline_in(later, vec![linux_target("web01"), linux_target("web02")]);
        let worker = spawn_evidence_worker(harness.chain.clone(), None, rx);

        match pipeline.process(failing("logging", "web01")).await {
            Disposition::Deferred { opens_in_secs } => assert!(opens_in_secs > 3600),
            other => panic!("expected deferral, got {:?}", other),
        }
        assert!(matches!(pipeline.process(failing("logging", "web02")).await, Disposition::Deferred { .. }));
        assert_eq!(pipeline.deferred(), 2);

        pipeline.close();
        drop(pipeline);
        worker.await.unwrap();

        assert_eq!(harness.executor.calls.load(Ordering::SeqCst), 0);
        assert!(harness.chain.list(CLIENT).await.unwrap().is_empty());
        assert!(harness.learning.store().get("logging:restart_log_service").is_none());
    }
}

// ============================================================================
// Evidence forwarding
// ============================================================================

mod forwarding {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use warden_common::evidence::{EvidenceBundle, EvidenceOutbox, EvidenceUploader};
    use wardend::scheduler::spawn_flush_loop;

    #[derive(Default)]
    struct Central {
        received: Mutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl EvidenceUploader for Central {
        async fn upload(&self, bundle: &EvidenceBundle) -> warden_common::Result<()> {
            self.received
                .lock()
                .unwrap()
                .push((bundle.client_id.clone(), bundle.chain_index));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_bundle_sealed_while_spool_unwritable_still_reaches_central() {
        let harness = Harness::new();
        let spool = harness._dir.path().join("spool");
        // A plain file where the spool directory should be
        std::fs::write(&spool, b"").unwrap();
        let outbox = Arc::new(EvidenceOutbox::new(&spool));

        let (pipeline, rx) = harness.pipeline(vec![linux_target("web01")]);
        let worker = spawn_evidence_worker(harness.chain.clone(), Some(outbox.clone()), rx);
        assert!(matches!(
            pipeline.process(failing("logging", "web01")).await,
            Disposition::Remediated(_)
        ));
        drop(pipeline);
        worker.await.unwrap();
        assert_eq!(harness.chain.list(CLIENT).await.unwrap().len(), 1);

        std::fs::remove_file(&spool).unwrap();
        let central = Arc::new(Central::default());
        let (stop, shutdown) = tokio::sync::watch::channel(false);
        let flush = spawn_flush_loop(
            harness.chain.clone(),
            outbox.clone(),
            central.clone(),
            Duration::from_secs(3600),
            shutdown,
        );
        for _ in 0..200 {
            if !central.received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop.send(true).unwrap();
        flush.await.unwrap();

        assert_eq!(*central.received.lock().unwrap(), vec![(CLIENT.to_string(), 0)]);
        assert_eq!(outbox.acknowledged().await.unwrap().get(CLIENT), Some(&0));
        assert!(outbox.pending().await.unwrap().is_empty());
    }
}
