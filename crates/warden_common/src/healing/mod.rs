//! Healing engine
//!
//! Drives one remediation through a fixed state machine:
//!
//! ```text
//! PENDING → MAINTENANCE_CHECK → PRE_HEALTH → EXECUTE → POST_HEALTH → SUCCESS
//!                                                 ↘ ROLLBACK → SUCCESS_ROLLED_BACK
//!                                                            ↘ FAILED
//! ```
//!
//! Every invocation returns exactly one `RemediationResult`. Transport and
//! script failures are data; nothing in here panics on a remote fault.

pub mod actions;
pub mod transport;
pub mod window;

pub use actions::{ActionHandler, ActionRegistry, RemediationAction, Runbook, ScriptedHandler, CATALOG_VERSION};
pub use transport::{
    run_bounded, ExecOutput, ExecResult, ExecutorSet, LocalExecutor, RemoteExecutor, SshExecutor,
    Target, TargetOs, WinRmExecutor,
};
pub use window::MaintenanceWindow;

use crate::drift::CheckKind;
use crate::types::{
    ActionStep, DriftResult, ExecError, ExecErrorKind, HealingState, RemediationResult,
    ResolutionLevel,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Default bound on each remote command
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

/// One failing check on one target
#[derive(Debug, Clone)]
pub struct HealRequest {
    pub incident_id: String,
    pub drift: DriftResult,
    pub target: Target,
}

impl HealRequest {
    pub fn new(drift: DriftResult, target: Target) -> Self {
        Self {
            incident_id: format!("INC-{}", uuid::Uuid::new_v4()),
            drift,
            target,
        }
    }
}

/// A run's result plus the rendered runbook it executed, if one was resolved
#[derive(Debug, Clone)]
pub struct HealOutcome {
    pub result: RemediationResult,
    pub runbook: Option<Runbook>,
}

impl HealOutcome {
    fn unplanned(result: RemediationResult) -> Self {
        Self { result, runbook: None }
    }
}

/// A locally matched deterministic rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L1Match {
    pub rule_id: String,
    pub action: RemediationAction,
    pub parameters: BTreeMap<String, String>,
}

/// Deterministic rules consulted before anything else
pub trait L1Rules: Send + Sync {
    fn match_rule(&self, drift: &DriftResult) -> Option<L1Match>;
}

/// Centrally-assisted action selection for drift no L1 rule covers
#[async_trait]
pub trait L2Planner: Send + Sync {
    async fn plan(&self, drift: &DriftResult) -> Option<RemediationAction>;
}

/// Offline planner: the catalog's default action for the check
pub struct CatalogPlanner;

#[async_trait]
impl L2Planner for CatalogPlanner {
    async fn plan(&self, drift: &DriftResult) -> Option<RemediationAction> {
        drift
            .check_name
            .parse::<CheckKind>()
            .ok()
            .map(RemediationAction::for_check)
    }
}

struct Plan {
    action: RemediationAction,
    level: ResolutionLevel,
    parameters: BTreeMap<String, String>,
}

/// Step recorder for one run
struct Run<'a> {
    request: &'a HealRequest,
    started: Instant,
    started_at: DateTime<Utc>,
    steps: Vec<ActionStep>,
}

impl<'a> Run<'a> {
    fn new(request: &'a HealRequest, now: DateTime<Utc>) -> Self {
        Self {
            request,
            started: Instant::now(),
            started_at: now,
            steps: Vec::new(),
        }
    }

    fn step(&mut self, state: HealingState, description: impl Into<String>, success: bool, output: Option<String>) {
        self.steps.push(ActionStep {
            step: self.steps.len() as u32 + 1,
            state,
            description: description.into(),
            success,
            at: Utc::now().max(self.started_at),
            output,
        });
    }

    fn finish(
        self,
        plan: Option<&Plan>,
        terminal_state: HealingState,
        error: Option<ExecError>,
    ) -> RemediationResult {
        let (action_taken, runbook_id, level) = match plan {
            Some(p) => (p.action.name().to_string(), p.action.runbook_id().to_string(), p.level),
            None => (String::new(), String::new(), ResolutionLevel::L2),
        };
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let result = RemediationResult {
            incident_id: self.request.incident_id.clone(),
            check_name: self.request.drift.check_name.clone(),
            host_id: self.request.target.hostname.clone(),
            action_taken,
            runbook_id,
            success: terminal_state == HealingState::Success,
            resolution_level: level,
            resolution_time_ms: elapsed_ms,
            terminal_state,
            rolled_back: terminal_state == HealingState::SuccessRolledBack,
            error,
            steps: self.steps,
            started_at: self.started_at,
            finished_at: self.started_at + chrono::Duration::milliseconds(elapsed_ms as i64),
        };
        match terminal_state {
            HealingState::Success => info!(
                "{} healed {} on {} via {} ({}ms)",
                result.incident_id, result.check_name, result.host_id, result.action_taken, elapsed_ms
            ),
            HealingState::SuccessRolledBack => warn!(
                "{} rolled back {} on {}: {}",
                result.incident_id,
                result.action_taken,
                result.host_id,
                result.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
            ),
            _ => error!(
                "{} failed to heal {} on {}: {}",
                result.incident_id,
                result.check_name,
                result.host_id,
                result.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
            ),
        }
        result
    }
}

fn summarize(output: &ExecOutput) -> Option<String> {
    let text = output.stdout.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.chars().take(2000).collect())
    }
}

pub struct HealingEngine {
    registry: Arc<ActionRegistry>,
    executors: ExecutorSet,
    window: MaintenanceWindow,
    command_timeout: Duration,
    l1: Option<Arc<dyn L1Rules>>,
    l2: Option<Arc<dyn L2Planner>>,
}

impl HealingEngine {
    pub fn new(registry: Arc<ActionRegistry>, executors: ExecutorSet) -> Self {
        Self {
            registry,
            executors,
            window: MaintenanceWindow::always(),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            l1: None,
            l2: None,
        }
    }

    pub fn with_window(mut self, window: MaintenanceWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_l1(mut self, rules: Arc<dyn L1Rules>) -> Self {
        self.l1 = Some(rules);
        self
    }

    pub fn with_l2(mut self, planner: Arc<dyn L2Planner>) -> Self {
        self.l2 = Some(planner);
        self
    }

    pub fn window(&self) -> MaintenanceWindow {
        self.window
    }

    pub async fn heal(&self, request: &HealRequest) -> RemediationResult {
        self.heal_at(request, Utc::now()).await.result
    }

    /// Run the state machine with `now` as the maintenance-window clock
    pub async fn heal_at(&self, request: &HealRequest, now: DateTime<Utc>) -> HealOutcome {
        let mut run = Run::new(request, now);

        // PENDING: pick the action
        let Some(plan) = self.plan(&request.drift).await else {
            run.step(HealingState::Pending, "no L1 rule or L2 plan for check", false, None);
            let err = ExecError::new(
                ExecErrorKind::NoPlan,
                format!("no remediation for {}", request.drift.check_name),
            );
            return HealOutcome::unplanned(run.finish(None, HealingState::Failed, Some(err)));
        };
        run.step(
            HealingState::Pending,
            format!("selected {} ({})", plan.action, plan.level),
            true,
            None,
        );

        let runbook = match self
            .registry
            .get(plan.action)
            .ok_or_else(|| format!("no handler registered for {}", plan.action))
            .and_then(|h| {
                h.runbook(request.target.os, &plan.parameters)
                    .map_err(|e| e.to_string())
            }) {
            Ok(rb) => rb,
            Err(message) => {
                run.step(HealingState::Pending, "runbook unavailable", false, Some(message.clone()));
                let err = ExecError::new(ExecErrorKind::NoPlan, message);
                return HealOutcome::unplanned(run.finish(Some(&plan), HealingState::Failed, Some(err)));
            }
        };

        let result = self.drive(request, run, &plan, &runbook, now).await;
        HealOutcome {
            result,
            runbook: Some(runbook),
        }
    }

    /// Maintenance check through rollback for a resolved runbook
    async fn drive(
        &self,
        request: &HealRequest,
        mut run: Run<'_>,
        plan: &Plan,
        runbook: &Runbook,
        now: DateTime<Utc>,
    ) -> RemediationResult {
        // MAINTENANCE_CHECK
        if !self.window.is_open_at(now) {
            run.step(
                HealingState::MaintenanceCheck,
                format!("outside maintenance window {}", self.window),
                false,
                None,
            );
            let err = ExecError::new(
                ExecErrorKind::OutsideMaintenanceWindow,
                format!("{} is outside {}", now.format("%H:%M"), self.window),
            );
            return run.finish(Some(plan), HealingState::Failed, Some(err));
        }
        run.step(HealingState::MaintenanceCheck, "inside maintenance window", true, None);

        // PRE_HEALTH
        if let Some(script) = &runbook.pre_health {
            match self.run(&request.target, script).await {
                Ok(out) => run.step(HealingState::PreHealth, "pre-health passed", true, summarize(&out)),
                Err(e) => {
                    run.step(HealingState::PreHealth, "pre-health failed", false, Some(e.to_string()));
                    let err = ExecError {
                        kind: ExecErrorKind::PreHealthFailed,
                        message: e.message,
                        exit_code: e.exit_code,
                    };
                    return run.finish(Some(plan), HealingState::Failed, Some(err));
                }
            }
        }

        // EXECUTE, then POST_HEALTH
        let failure = match self.run(&request.target, &runbook.execute).await {
            Ok(out) => {
                run.step(HealingState::Execute, format!("executed {}", runbook.id), true, summarize(&out));
                match self.run(&request.target, &runbook.post_health).await {
                    Ok(out) => {
                        run.step(HealingState::PostHealth, "post-health passed", true, summarize(&out));
                        return run.finish(Some(plan), HealingState::Success, None);
                    }
                    Err(e) => {
                        run.step(HealingState::PostHealth, "post-health failed", false, Some(e.to_string()));
                        ExecError {
                            kind: ExecErrorKind::PostHealthFailed,
                            message: e.message,
                            exit_code: e.exit_code,
                        }
                    }
                }
            }
            Err(e) => {
                run.step(HealingState::Execute, format!("{} failed", runbook.id), false, Some(e.to_string()));
                e
            }
        };

        // ROLLBACK
        let Some(rollback) = &runbook.rollback else {
            return run.finish(Some(plan), HealingState::Failed, Some(failure));
        };
        match self.run(&request.target, rollback).await {
            Ok(out) => {
                run.step(HealingState::Rollback, "rolled back", true, summarize(&out));
                run.finish(Some(plan), HealingState::SuccessRolledBack, Some(failure))
            }
            Err(e) => {
                run.step(HealingState::Rollback, "rollback failed", false, Some(e.to_string()));
                run.finish(Some(plan), HealingState::Failed, Some(failure))
            }
        }
    }

    async fn plan(&self, drift: &DriftResult) -> Option<Plan> {
        if let Some(m) = self.l1.as_ref().and_then(|rules| rules.match_rule(drift)) {
            info!("L1 rule {} matched {} on {}", m.rule_id, drift.check_name, drift.host_id);
            return Some(Plan {
                action: m.action,
                level: ResolutionLevel::L1,
                parameters: m.parameters,
            });
        }
        let planner = self.l2.as_ref()?;
        planner.plan(drift).await.map(|action| Plan {
            action,
            level: ResolutionLevel::L2,
            parameters: BTreeMap::new(),
        })
    }

    async fn run(&self, target: &Target, script: &str) -> ExecResult {
        run_bounded(self.executors.for_target(target), target, script, self.command_timeout).await
    }
}
