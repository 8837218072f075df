//! The fixed, versioned compliance check set
//!
//! Bump `CHECK_SET_VERSION` whenever a check's semantics change.

use super::baseline::Baseline;
use super::probe::HostProbe;
use crate::canonical::sha256_hex;
use crate::types::{DriftResult, DriftStatus, ObservationFault};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub const CHECK_SET_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Patching,
    EndpointProtection,
    Backup,
    Logging,
    Firewall,
    Encryption,
}

impl CheckKind {
    pub const ALL: [CheckKind; 6] = [
        CheckKind::Patching,
        CheckKind::EndpointProtection,
        CheckKind::Backup,
        CheckKind::Logging,
        CheckKind::Firewall,
        CheckKind::Encryption,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CheckKind::Patching => "patching",
            CheckKind::EndpointProtection => "endpoint_protection",
            CheckKind::Backup => "backup",
            CheckKind::Logging => "logging",
            CheckKind::Firewall => "firewall",
            CheckKind::Encryption => "encryption",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CheckKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CheckKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| format!("unknown check: {}", s))
    }
}

type CheckOutcome = Result<DriftResult, ObservationFault>;

/// Run one check; infrastructure faults come back as `Err`
pub async fn run_check(
    kind: CheckKind,
    baseline: &Baseline,
    probe: &dyn HostProbe,
    now: DateTime<Utc>,
) -> CheckOutcome {
    let fault = |e: crate::error::WardenError| ObservationFault {
        check_name: kind.name().to_string(),
        reason: e.to_string(),
        observed_at: now,
    };

    let result = match kind {
        CheckKind::Patching => {
            let last = probe.last_patch_time().await.map_err(fault)?;
            age_check(kind, last, now, baseline.max_patch_age_days * 24, "days")
        }
        CheckKind::EndpointProtection => {
            let ep = &baseline.endpoint_protection;
            let state = probe
                .endpoint_protection(&ep.service, Path::new(&ep.binary_path))
                .await
                .map_err(fault)?;
            endpoint_check(baseline, state)
        }
        CheckKind::Backup => {
            let last = probe.last_backup_time().await.map_err(fault)?;
            age_check(kind, last, now, baseline.backup_max_age_hours, "hours")
        }
        CheckKind::Logging => {
            let mut inactive = Vec::new();
            for service in &baseline.log_services {
                if !probe.service_active(service).await.map_err(fault)? {
                    inactive.push(service.clone());
                }
            }
            let status = if inactive.is_empty() {
                DriftStatus::Pass
            } else {
                DriftStatus::Fail
            };
            DriftResult::new(
                kind.name(),
                status,
                format!("active: {}", baseline.log_services.join(",")),
                if inactive.is_empty() {
                    "all active".to_string()
                } else {
                    format!("inactive: {}", inactive.join(","))
                },
            )
            .with_detail("inactive", json!(inactive))
        }
        CheckKind::Firewall => {
            let ruleset = probe.firewall_ruleset().await.map_err(fault)?;
            firewall_check(baseline, &ruleset)
        }
        CheckKind::Encryption => {
            let present = probe.encrypted_volumes().await.map_err(fault)?;
            let missing: Vec<String> = baseline
                .encrypted_volumes
                .iter()
                .filter(|v| !present.contains(v))
                .cloned()
                .collect();
            let status = if missing.is_empty() {
                DriftStatus::Pass
            } else {
                DriftStatus::Fail
            };
            DriftResult::new(
                kind.name(),
                status,
                baseline.encrypted_volumes.join(","),
                present.join(","),
            )
            .with_detail("missing", json!(missing))
        }
    };

    let result = result.with_host(probe.host_id()).at(now);
    Ok(match baseline.controls.get(kind.name()) {
        Some(control) => result.with_control(control.clone()),
        None => result,
    })
}

/// Pass within the limit, warn up to twice the limit, fail beyond or never
fn age_check(
    kind: CheckKind,
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_age_hours: i64,
    unit: &str,
) -> DriftResult {
    let as_unit = |hours: i64| if unit == "days" { hours / 24 } else { hours };
    let expected = format!("<= {} {}", as_unit(max_age_hours), unit);

    let Some(last) = last else {
        return DriftResult::new(kind.name(), DriftStatus::Fail, expected, "never");
    };

    let age_hours = (now - last).num_hours();
    let status = if age_hours <= max_age_hours {
        DriftStatus::Pass
    } else if age_hours <= max_age_hours * 2 {
        DriftStatus::Warn
    } else {
        DriftStatus::Fail
    };

    DriftResult::new(
        kind.name(),
        status,
        expected,
        format!("{} {}", as_unit(age_hours), unit),
    )
    .with_detail("last", json!(last.to_rfc3339()))
}

fn endpoint_check(baseline: &Baseline, state: super::probe::EndpointState) -> DriftResult {
    let ep = &baseline.endpoint_protection;
    let (status, actual) = match (&state.binary_hash, state.running) {
        (None, _) => (DriftStatus::Fail, "binary missing".to_string()),
        (Some(hash), _) if !ep.allowed_hashes.iter().any(|h| h.eq_ignore_ascii_case(hash)) => {
            (DriftStatus::Fail, format!("unapproved binary {}", hash))
        }
        (Some(_), false) => (DriftStatus::Fail, format!("{} not running", ep.service)),
        (Some(hash), true) => (DriftStatus::Pass, format!("running {}", hash)),
    };
    DriftResult::new(
        CheckKind::EndpointProtection.name(),
        status,
        format!("{} running with approved binary", ep.service),
        actual,
    )
    .with_detail("running", json!(state.running))
}

/// Hash of the ruleset with comments, blank lines and surrounding whitespace removed
pub fn normalized_ruleset_hash(ruleset: &str) -> String {
    let normalized: Vec<&str> = ruleset
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    sha256_hex(normalized.join("\n").as_bytes())
}

fn firewall_check(baseline: &Baseline, ruleset: &str) -> DriftResult {
    let actual = normalized_ruleset_hash(ruleset);
    let status = if ruleset.trim().is_empty() || actual != baseline.firewall_ruleset_hash {
        DriftStatus::Fail
    } else {
        DriftStatus::Pass
    };
    DriftResult::new(
        CheckKind::Firewall.name(),
        status,
        baseline.firewall_ruleset_hash.clone(),
        actual,
    )
}
