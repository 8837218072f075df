//! Component assembly and lifecycle

use crate::central::{CentralPlanner, HttpUploader};
use crate::config::WardenConfig;
use crate::pipeline::{spawn_evidence_worker, Pipeline};
use crate::scheduler;
use crate::server::{self, AppState};
use crate::tls;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use warden_common::drift::{
    verifying_key_from_hex, DriftDetector, HostProbe, LocalProbe, RemoteProbe, SignedBaseline,
};
use warden_common::evidence::{
    load_signer, EvidenceChain, EvidenceOutbox, EvidenceUploader, OpenTimestampsAnchor,
};
use warden_common::fleet::FleetRegistry;
use warden_common::healing::{
    ActionRegistry, CatalogPlanner, ExecutorSet, HealingEngine, L1Rules, L2Planner, TargetOs,
};
use warden_common::learning::{LearningLoop, PatternStore, RuleCatalog};
use warden_common::timesync::TimeVerifier;
use warden_common::trust::TrustFabric;
use warden_common::CooldownGate;

pub struct Daemon {
    config: WardenConfig,
    trust: Arc<TrustFabric>,
    chain: Arc<EvidenceChain>,
    outbox: Option<Arc<EvidenceOutbox>>,
    uploader: Option<Arc<dyn EvidenceUploader>>,
    detector: Option<Arc<DriftDetector>>,
    executors: ExecutorSet,
    fleet: Arc<FleetRegistry>,
    learning: LearningLoop,
    pipeline: Arc<Pipeline>,
    evidence_jobs: mpsc::UnboundedReceiver<crate::pipeline::EvidenceJob>,
}

impl Daemon {
    pub async fn build(config: WardenConfig) -> Result<Self> {
        let paths = &config.paths;
        for dir in [&paths.state_dir, &paths.evidence_dir, &paths.spool_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let trust = Arc::new(TrustFabric::init(&paths.ca_dir).context("Failed to initialize local CA")?);

        // Evidence
        let signer = load_signer(config.evidence.signer, &paths.signer_key).context("Failed to load evidence signer")?;
        info!("Evidence signer {} ({})", signer.kind().algorithm(), signer.key_id());
        let verifier = TimeVerifier::from_servers(&config.timesync.servers)
            .with_timeout(Duration::from_millis(config.timesync.timeout_ms))
            .with_min_sources(config.timesync.min_sources)
            .with_max_skew_ms(config.timesync.max_skew_ms);
        let mut chain = EvidenceChain::new(&paths.evidence_dir, &config.site.site_id, signer)
            .with_time_verifier(Arc::new(verifier));
        if config.evidence.anchor_enabled {
            let anchor = OpenTimestampsAnchor::new(
                config.evidence.calendars.clone(),
                Duration::from_secs(config.evidence.anchor_timeout_secs),
            )?;
            chain = chain.with_anchor(Arc::new(anchor));
        }
        let chain = Arc::new(chain);

        let (outbox, uploader): (Option<Arc<EvidenceOutbox>>, Option<Arc<dyn EvidenceUploader>>) =
            if config.central.url.is_some() {
                let outbox = EvidenceOutbox::new(&paths.spool_dir).with_backoff(
                    chrono::Duration::seconds(config.evidence.backoff_base_secs),
                    chrono::Duration::seconds(config.evidence.backoff_max_secs),
                );
                (Some(Arc::new(outbox)), Some(Arc::new(HttpUploader::new(&config.central)?)))
            } else {
                info!("No central configured; evidence stays local");
                (None, None)
            };

        // Learning
        let catalog = Arc::new(RuleCatalog::open(paths.rules()).context("Failed to open rule catalog")?);
        let store = Arc::new(PatternStore::open(paths.patterns()).context("Failed to open pattern store")?);
        let learning = LearningLoop::new(store, catalog.clone(), config.learning.policy());

        // Healing
        let executors = ExecutorSet::standard(config.healing.winrm_tls);
        let engine = if config.healing.enabled {
            let registry = Arc::new(ActionRegistry::builtin().context("Remediation catalog is incomplete")?);
            let l2: Arc<dyn L2Planner> = if config.central.url.is_some() {
                Arc::new(CentralPlanner::new(&config.central)?)
            } else {
                Arc::new(CatalogPlanner)
            };
            let l1: Arc<dyn L1Rules> = catalog.clone();
            let engine = HealingEngine::new(registry, executors.clone())
                .with_window(config.healing.window()?)
                .with_command_timeout(Duration::from_secs(config.healing.command_timeout_secs))
                .with_l1(l1)
                .with_l2(l2);
            info!("Healing enabled, maintenance window {}", engine.window());
            Some(Arc::new(engine))
        } else {
            warn!("Healing disabled; drift is reported only");
            None
        };

        // Detection
        let detector = match load_detector(&config) {
            Ok(detector) => Some(Arc::new(detector)),
            Err(e) => {
                error!("Local detection disabled: {:#}", e);
                None
            }
        };

        let targets = config.targets();
        let gate = Arc::new(CooldownGate::new(chrono::Duration::seconds(
            config.detection.cooldown_secs as i64,
        )));
        let (pipeline, evidence_jobs) =
            Pipeline::new(&config.site.client_id, gate, engine, targets, learning.clone());

        let fleet = Arc::new(
            FleetRegistry::new(config.detection.check_interval_secs, config.detection.enabled_checks.clone())
                .with_trust(trust.clone()),
        );

        Ok(Self {
            config,
            trust,
            chain,
            outbox,
            uploader,
            detector,
            executors,
            fleet,
            learning,
            pipeline: Arc::new(pipeline),
            evidence_jobs,
        })
    }

    fn probes(&self) -> Vec<Arc<dyn HostProbe>> {
        let backup_stamp = &self.config.paths.backup_stamp;
        let mut probes: Vec<Arc<dyn HostProbe>> =
            vec![Arc::new(LocalProbe::new(&self.config.site.hostname, backup_stamp))];
        for target in self.config.targets() {
            // Windows hosts report through their agent
            if target.os == TargetOs::Linux && !target.local {
                let executor = self.executors.for_target(&target);
                probes.push(Arc::new(RemoteProbe::new(target, executor, backup_stamp)));
            }
        }
        probes
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let tls = match (self.config.listen.tls, self.config.listen.server_ip) {
            (true, Some(ip)) => Some(tls::server_config(&self.trust.server_certificate(ip)?)?),
            (true, None) => {
                warn!("listen.server_ip unset; serving the agent API without TLS");
                None
            }
            (false, _) => None,
        };

        let alerts = scheduler::verify_all_chains(&self.chain).await;
        if alerts > 0 {
            error!("{} tamper alerts in stored evidence", alerts);
        }

        let mut loops = Vec::new();
        if let Some(detector) = &self.detector {
            let interval = Duration::from_secs(self.config.detection.check_interval_secs);
            let jitter = Duration::from_secs(self.config.detection.jitter_secs);
            for probe in self.probes() {
                loops.push(scheduler::spawn_detection_loop(
                    detector.clone(),
                    probe,
                    self.pipeline.clone(),
                    interval,
                    jitter,
                    shutdown.clone(),
                ));
            }
        }
        if let (Some(outbox), Some(uploader)) = (&self.outbox, &self.uploader) {
            loops.push(scheduler::spawn_flush_loop(
                self.chain.clone(),
                outbox.clone(),
                uploader.clone(),
                Duration::from_secs(self.config.evidence.flush_interval_secs),
                shutdown.clone(),
            ));
        }
        loops.push(scheduler::spawn_promotion_loop(
            self.learning.clone(),
            Duration::from_secs(self.config.learning.sweep_interval_secs),
            shutdown.clone(),
        ));

        let evidence_worker = spawn_evidence_worker(self.chain.clone(), self.outbox.clone(), self.evidence_jobs);

        let state = AppState::new(
            &self.config.site.site_id,
            self.config.agent_config(),
            self.fleet.clone(),
            self.learning.catalog().clone(),
            self.pipeline.clone(),
        );
        let served = server::run(state, &self.config.listen.bind, tls, shutdown).await;
        if let Err(e) = &served {
            error!("API server stopped: {:#}", e);
            for handle in &loops {
                handle.abort();
            }
        }

        for handle in loops {
            let _ = handle.await;
        }
        self.pipeline.close();
        // Last sender goes with the pipeline; the worker then drains in-flight bundles
        drop(self.pipeline);
        if let Err(e) = evidence_worker.await {
            error!("Evidence worker panicked: {}", e);
        }
        info!("Shutdown complete");
        served
    }
}

fn load_detector(config: &WardenConfig) -> Result<DriftDetector> {
    let key = verifying_key_from_hex(&config.paths.baseline_public_key)
        .context("paths.baseline_public_key is not a valid ed25519 key")?;
    let baseline = SignedBaseline::load_verified(&config.paths.baseline, &key)
        .with_context(|| format!("Rejected baseline {}", config.paths.baseline.display()))?;
    info!("Loaded baseline v{}", baseline.version);
    Ok(DriftDetector::new(baseline).with_enabled(config.detection.checks()))
}
