//! Registry of connected remote agents
//!
//! Drift pushed by an agent is translated into a [`DriftResult`] and enters
//! the same pipeline as locally detected drift.

use crate::error::{Result, WardenError};
use crate::trust::{IssuedCertificate, TrustFabric};
use crate::types::{DriftResult, DriftStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub hostname: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default)]
    pub machine_id: String,
    #[serde(default)]
    pub installed_software: Vec<String>,
    #[serde(default)]
    pub tier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub agent_id: String,
    pub check_interval_seconds: u64,
    pub enabled_checks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<IssuedCertificate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Drift as reported by a remote agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftEvent {
    pub agent_id: String,
    pub hostname: String,
    pub check_type: String,
    pub passed: bool,
    #[serde(default)]
    pub control_id: Option<String>,
    #[serde(default)]
    pub expected: String,
    #[serde(default)]
    pub actual: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub hostname: String,
    pub machine_id: String,
    pub os_version: String,
    pub agent_version: String,
    pub tier: String,
    /// Failing drift reports received
    pub drift_count: u64,
    pub rmm: BTreeSet<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

pub const DEFAULT_TIER: &str = "standard";

pub struct FleetRegistry {
    agents: RwLock<HashMap<String, AgentRecord>>,
    trust: Option<Arc<TrustFabric>>,
    check_interval_seconds: u64,
    enabled_checks: Vec<String>,
}

impl FleetRegistry {
    pub fn new(check_interval_seconds: u64, enabled_checks: Vec<String>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            trust: None,
            check_interval_seconds,
            enabled_checks,
        }
    }

    /// Issue client certificates on registration
    pub fn with_trust(mut self, trust: Arc<TrustFabric>) -> Self {
        self.trust = Some(trust);
        self
    }

    /// Admit an agent under a fresh identifier
    ///
    /// A machine that registers again replaces its previous record.
    pub fn register(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        if request.hostname.trim().is_empty() {
            return Err(WardenError::Registry("hostname is required".to_string()));
        }
        let certificate = match &self.trust {
            Some(trust) if trust.is_initialized() => Some(trust.issue_agent_certificate(&request.hostname)?),
            _ => None,
        };

        let now = Utc::now();
        let agent_id = format!("agent-{}", uuid::Uuid::new_v4());
        let record = AgentRecord {
            agent_id: agent_id.clone(),
            hostname: request.hostname.clone(),
            machine_id: request.machine_id.clone(),
            os_version: request.os_version,
            agent_version: request.agent_version,
            tier: request.tier.unwrap_or_else(|| DEFAULT_TIER.to_string()),
            drift_count: 0,
            rmm: BTreeSet::new(),
            connected_at: now,
            last_heartbeat: now,
        };

        let mut agents = self.write();
        if !request.machine_id.is_empty() {
            agents.retain(|_, a| !(a.machine_id == request.machine_id && a.hostname == request.hostname));
        }
        agents.insert(agent_id.clone(), record);
        info!("Registered agent {} for {}", agent_id, request.hostname);

        Ok(RegisterResponse {
            agent_id,
            check_interval_seconds: self.check_interval_seconds,
            enabled_checks: self.enabled_checks.clone(),
            certificate,
        })
    }

    /// Liveness only
    pub fn heartbeat(&self, agent_id: &str, timestamp: DateTime<Utc>) -> Result<()> {
        let mut agents = self.write();
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| WardenError::UnknownAgent(agent_id.to_string()))?;
        agent.last_heartbeat = agent.last_heartbeat.max(timestamp);
        debug!("Heartbeat from {}", agent_id);
        Ok(())
    }

    pub fn ingest_drift(&self, event: DriftEvent) -> Result<DriftResult> {
        let mut agents = self.write();
        let agent = agents
            .get_mut(&event.agent_id)
            .ok_or_else(|| WardenError::UnknownAgent(event.agent_id.clone()))?;
        if agent.hostname != event.hostname {
            warn!(
                "Agent {} registered as {} reported drift for {}",
                event.agent_id, agent.hostname, event.hostname
            );
        }
        if !event.passed {
            agent.drift_count += 1;
        }

        let status = if event.passed { DriftStatus::Pass } else { DriftStatus::Fail };
        let mut result = DriftResult::new(event.check_type, status, event.expected, event.actual)
            .with_host(agent.hostname.clone())
            .at(event.timestamp.unwrap_or_else(Utc::now));
        result.details = event.metadata;
        result
            .details
            .insert("agent_id".to_string(), Value::String(event.agent_id));
        result.control_id = event.control_id;
        Ok(result)
    }

    pub fn link_rmm(&self, agent_id: &str, rmm: &str) -> Result<()> {
        let mut agents = self.write();
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| WardenError::UnknownAgent(agent_id.to_string()))?;
        agent.rmm.insert(rmm.to_string());
        Ok(())
    }

    /// Agents whose last heartbeat is older than `threshold`
    pub fn stale_agents(&self, threshold: Duration) -> Vec<AgentRecord> {
        self.stale_agents_at(threshold, Utc::now())
    }

    pub fn stale_agents_at(&self, threshold: Duration, now: DateTime<Utc>) -> Vec<AgentRecord> {
        let mut stale: Vec<_> = self
            .read()
            .values()
            .filter(|a| now - a.last_heartbeat > threshold)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.last_heartbeat.cmp(&b.last_heartbeat));
        stale
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.read().get(agent_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, AgentRecord>> {
        self.agents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, AgentRecord>> {
        self.agents.write().unwrap_or_else(|e| e.into_inner())
    }
}
