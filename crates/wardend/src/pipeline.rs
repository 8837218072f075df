//! Drift → cooldown gate → healing → evidence → learning
//!
//! Local and agent-reported drift enter through [`Pipeline::process`]. Sealing
//! evidence happens on a separate worker fed by a channel, so a slow NTP
//! round or calendar never holds up the next heal. Drift that arrives while
//! the maintenance window is closed is parked until it opens.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use warden_common::evidence::{EvidenceChain, EvidenceDraft, EvidenceOutbox};
use warden_common::healing::{HealRequest, HealingEngine, Target};
use warden_common::learning::LearningLoop;
use warden_common::{CooldownGate, DriftResult, GateDecision, RemediationResult};

/// A sealed-to-be record for one client chain
#[derive(Debug)]
pub struct EvidenceJob {
    pub client_id: String,
    pub draft: EvidenceDraft,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    NotFailing,
    Suppressed { remaining_secs: i64 },
    /// Healing disabled, or no reachable target for the host
    NoHealer,
    /// Queued until the maintenance window opens
    Deferred { opens_in_secs: i64 },
    Remediated(Box<RemediationResult>),
}

/// Where finished runs go: evidence worker and learning loop
#[derive(Clone)]
struct Outcomes {
    client_id: String,
    learning: LearningLoop,
    evidence: mpsc::UnboundedSender<EvidenceJob>,
}

pub struct Pipeline {
    gate: Arc<CooldownGate>,
    engine: Option<Arc<HealingEngine>>,
    targets: HashMap<String, Target>,
    outcomes: Outcomes,
    /// host:check keys waiting on the window
    deferred: Arc<Mutex<HashSet<String>>>,
    closing: watch::Sender<bool>,
}

impl Pipeline {
    pub fn new(
        client_id: impl Into<String>,
        gate: Arc<CooldownGate>,
        engine: Option<Arc<HealingEngine>>,
        targets: Vec<Target>,
        learning: LearningLoop,
    ) -> (Self, mpsc::UnboundedReceiver<EvidenceJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let targets = targets.into_iter().map(|t| (t.hostname.clone(), t)).collect();
        let pipeline = Self {
            gate,
            engine,
            targets,
            outcomes: Outcomes {
                client_id: client_id.into(),
                learning,
                evidence: tx,
            },
            deferred: Arc::new(Mutex::new(HashSet::new())),
            closing: watch::channel(false).0,
        };
        (pipeline, rx)
    }

    pub fn learning(&self) -> &LearningLoop {
        &self.outcomes.learning
    }

    /// Number of heals parked on the maintenance window
    pub fn deferred(&self) -> usize {
        self.deferred.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Release parked heals without running them
    pub fn close(&self) {
        self.closing.send_replace(true);
    }

    pub async fn process(&self, drift: DriftResult) -> Disposition {
        let target = self.targets.get(&drift.host_id);
        let engine = self.engine.as_ref().filter(|_| target.is_some());

        match self.gate.evaluate(&drift, engine.is_some()) {
            GateDecision::NotFailing => Disposition::NotFailing,
            GateDecision::Suppressed { remaining_secs } => {
                debug!(
                    "{} on {} suppressed for another {}s",
                    drift.check_name, drift.host_id, remaining_secs
                );
                Disposition::Suppressed { remaining_secs }
            }
            GateDecision::NoHealer => {
                if drift.is_fail() {
                    warn!("{} failing on {} with no healer available", drift.check_name, drift.host_id);
                }
                Disposition::NoHealer
            }
            GateDecision::Heal => match (engine, target) {
                (Some(engine), Some(target)) => {
                    let now = Utc::now();
                    let window = engine.window();
                    if window.is_open_at(now) {
                        let result = self.outcomes.heal(engine, drift, target.clone()).await;
                        Disposition::Remediated(Box::new(result))
                    } else {
                        let opens_in_secs = window.until_open(now).num_seconds();
                        self.defer(engine.clone(), drift, target.clone());
                        Disposition::Deferred { opens_in_secs }
                    }
                }
                _ => Disposition::NoHealer,
            },
        }
    }

    /// Heal once the window opens; one parked run per host and check
    fn defer(&self, engine: Arc<HealingEngine>, drift: DriftResult, target: Target) {
        let key = format!("{}:{}", drift.host_id, drift.check_name);
        if !self.deferred.lock().unwrap_or_else(|e| e.into_inner()).insert(key.clone()) {
            debug!("{} already waiting for the maintenance window", key);
            return;
        }
        info!("{} deferred to maintenance window {}", key, engine.window());

        let outcomes = self.outcomes.clone();
        let deferred = self.deferred.clone();
        let mut closing = self.closing.subscribe();
        tokio::spawn(async move {
            if engine.window().wait_until_open(&mut closing).await {
                outcomes.heal(&engine, drift, target).await;
            } else {
                debug!("Dropped deferred heal of {} at shutdown", key);
            }
            deferred.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
        });
    }
}

impl Outcomes {
    async fn heal(&self, engine: &HealingEngine, drift: DriftResult, target: Target) -> RemediationResult {
        let request = HealRequest::new(drift, target);
        info!(
            "Healing {} on {} as {}",
            request.drift.check_name, request.target.hostname, request.incident_id
        );
        let outcome = engine.heal_at(&request, Utc::now()).await;
        let result = outcome.result;
        info!(
            "{} finished {:?} via {} ({} ms)",
            result.incident_id, result.terminal_state, result.resolution_level, result.resolution_time_ms
        );

        let draft = EvidenceDraft::from_remediation(&request.drift, &result, outcome.runbook.as_ref());
        let job = EvidenceJob {
            client_id: self.client_id.clone(),
            draft,
        };
        if self.evidence.send(job).is_err() {
            error!("Evidence worker is gone; {} was not sealed", result.incident_id);
        }

        match self.learning.observe(&result) {
            Ok(Some(rule)) => warn!("L1 rule {} deprecated", rule.id),
            Ok(None) => {}
            Err(e) => warn!("Failed to record outcome of {}: {}", result.incident_id, e),
        }
        result
    }
}

/// Seal queued drafts until every sender is dropped
pub fn spawn_evidence_worker(
    chain: Arc<EvidenceChain>,
    outbox: Option<Arc<EvidenceOutbox>>,
    mut jobs: mpsc::UnboundedReceiver<EvidenceJob>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            let bundle = match chain.append(&job.client_id, job.draft).await {
                Ok(bundle) => bundle,
                Err(e) => {
                    error!("Failed to seal evidence for {}: {}", job.client_id, e);
                    continue;
                }
            };
            if let Some(outbox) = &outbox {
                if let Err(e) = outbox.enqueue(&bundle).await {
                    error!(
                        "Failed to spool {}#{}: {}; the next flush respools it",
                        bundle.client_id, bundle.chain_index, e
                    );
                }
            }
        }
        debug!("Evidence worker drained");
    })
}
