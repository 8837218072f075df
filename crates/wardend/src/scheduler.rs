//! Periodic loops: per-host detection, evidence flush, promotion sweep
//!
//! Every loop exits when the shutdown watch flips to `true`.

use crate::pipeline::{Disposition, Pipeline};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use warden_common::drift::{DriftDetector, HostProbe};
use warden_common::evidence::{EvidenceChain, EvidenceOutbox, EvidenceUploader};
use warden_common::learning::LearningLoop;

/// Sleep for `period`, returning false if shutdown fired first
async fn pause(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

fn jittered(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    let extra = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
    interval + Duration::from_millis(extra)
}

/// One detection cycle for one host
pub async fn detect_once(detector: &DriftDetector, probe: &dyn HostProbe, pipeline: &Pipeline) -> usize {
    let report = detector.evaluate(probe).await;
    let mut healed = 0;
    for result in report.results {
        if let Disposition::Remediated(outcome) = pipeline.process(result).await {
            debug!("{} -> {:?}", outcome.incident_id, outcome.terminal_state);
            healed += 1;
        }
    }
    healed
}

pub fn spawn_detection_loop(
    detector: Arc<DriftDetector>,
    probe: Arc<dyn HostProbe>,
    pipeline: Arc<Pipeline>,
    interval: Duration,
    jitter: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Detection loop for {} every {:?}", probe.host_id(), interval);
        // Spread the first cycle so hosts do not probe in lockstep
        if !pause(jittered(Duration::ZERO, jitter), &mut shutdown).await {
            return;
        }
        loop {
            let healed = detect_once(&detector, probe.as_ref(), &pipeline).await;
            if healed > 0 {
                info!("{}: {} remediations this cycle", probe.host_id(), healed);
            }
            if !pause(jittered(interval, jitter), &mut shutdown).await {
                break;
            }
        }
        debug!("Detection loop for {} stopped", probe.host_id());
    })
}

pub fn spawn_flush_loop(
    chain: Arc<EvidenceChain>,
    outbox: Arc<EvidenceOutbox>,
    uploader: Arc<dyn EvidenceUploader>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = outbox.reconcile(&chain).await {
                error!("Evidence reconcile failed: {}", e);
            }
            match outbox.flush(uploader.as_ref()).await {
                Ok(report) if !report.quarantined.is_empty() => error!(
                    "{} spool entries quarantined; {} uploaded, {} pending",
                    report.quarantined.len(),
                    report.uploaded,
                    report.pending
                ),
                Ok(report) if report.error.is_some() => {
                    warn!("Evidence flush incomplete: {} bundles pending", report.pending)
                }
                Ok(report) => debug!("Evidence flush: {} uploaded", report.uploaded),
                Err(e) => error!("Evidence flush failed: {}", e),
            }
            if !pause(interval, &mut shutdown).await {
                break;
            }
        }
    })
}

pub fn spawn_promotion_loop(
    learning: LearningLoop,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while pause(interval, &mut shutdown).await {
            let promoted = learning.sweep();
            if !promoted.is_empty() {
                info!(
                    "Promoted {} patterns to L1 (catalog v{})",
                    promoted.len(),
                    learning.catalog().version()
                );
            }
        }
    })
}

/// Verify every client chain on disk; returns the number of tamper alerts
pub async fn verify_all_chains(chain: &EvidenceChain) -> usize {
    let clients = match chain.clients().await {
        Ok(clients) => clients,
        Err(e) => {
            error!("Cannot list evidence chains: {}", e);
            return 0;
        }
    };
    let mut alerts = 0;
    for client in clients {
        match chain.verify_chain(&client).await {
            Ok(report) if report.is_intact() => {
                info!("Evidence chain {} intact ({} bundles)", client, report.bundles_checked)
            }
            Ok(report) => alerts += report.alerts.len(),
            Err(e) => error!("Cannot verify chain {}: {}", client, e),
        }
    }
    alerts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pause_stops_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(!pause(Duration::from_secs(3600), &mut rx).await);
    }

    #[tokio::test]
    async fn test_pause_elapses() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(pause(Duration::from_millis(5), &mut rx).await);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let d = jittered(base, Duration::from_secs(2));
            assert!(d >= base && d <= base + Duration::from_secs(2));
        }
        assert_eq!(jittered(base, Duration::ZERO), base);
    }
}
