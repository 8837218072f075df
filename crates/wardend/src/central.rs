//! Clients for the central service: evidence upload and L2 planning

use crate::config::CentralConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use warden_common::evidence::{EvidenceBundle, EvidenceUploader};
use warden_common::healing::{L2Planner, RemediationAction};
use warden_common::{DriftResult, WardenError};

pub const SUBMIT_PATH: &str = "/api/evidence/submit";
pub const PLAN_PATH: &str = "/api/agent/l2/plan";

fn client(config: &CentralConfig) -> Result<(reqwest::Client, String)> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| anyhow!("central.url is not configured"))?
        .trim_end_matches('/')
        .to_string();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .context("Failed to build central HTTP client")?;
    Ok((client, url))
}

fn authorized(request: reqwest::RequestBuilder, api_key: &Option<String>) -> reqwest::RequestBuilder {
    match api_key {
        Some(key) => request.bearer_auth(key),
        None => request,
    }
}

/// Client errors other than timeouts and rate limits will not change on retry
fn is_refusal(status: reqwest::StatusCode) -> bool {
    status.is_client_error()
        && status != reqwest::StatusCode::REQUEST_TIMEOUT
        && status != reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// Posts sealed bundles to central
pub struct HttpUploader {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    retries: u32,
}

impl HttpUploader {
    pub fn new(config: &CentralConfig) -> Result<Self> {
        let (client, url) = client(config)?;
        Ok(Self {
            client,
            url,
            api_key: config.api_key.clone(),
            retries: config.retry_count,
        })
    }

    async fn attempt(&self, bundle: &EvidenceBundle) -> warden_common::Result<()> {
        let request = self.client.post(format!("{}{}", self.url, SUBMIT_PATH)).json(bundle);
        let response = authorized(request, &self.api_key).send().await?;
        let status = response.status();
        // 409: central already holds this index
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("central returned {}: {}", status, body.trim());
        if is_refusal(status) {
            return Err(WardenError::Rejected(message));
        }
        Err(WardenError::Upload(message))
    }
}

#[async_trait]
impl EvidenceUploader for HttpUploader {
    async fn upload(&self, bundle: &EvidenceBundle) -> warden_common::Result<()> {
        let mut attempt = 0;
        loop {
            match self.attempt(bundle).await {
                Ok(()) => {
                    debug!("Uploaded {}#{}", bundle.client_id, bundle.chain_index);
                    return Ok(());
                }
                Err(e) if attempt < self.retries && !e.is_permanent() => {
                    attempt += 1;
                    debug!("Upload attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct PlanRequest<'a> {
    check_name: &'a str,
    host_id: &'a str,
    status: String,
    expected: &'a str,
    actual: &'a str,
    details: &'a std::collections::BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    #[serde(default)]
    action: Option<String>,
}

/// Asks central to pick an action for drift no L1 rule covers
pub struct CentralPlanner {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl CentralPlanner {
    pub fn new(config: &CentralConfig) -> Result<Self> {
        let (client, url) = client(config)?;
        Ok(Self {
            client,
            url,
            api_key: config.api_key.clone(),
        })
    }

    async fn request_plan(&self, drift: &DriftResult) -> Result<Option<String>> {
        let body = PlanRequest {
            check_name: &drift.check_name,
            host_id: &drift.host_id,
            status: drift.status.to_string(),
            expected: &drift.expected,
            actual: &drift.actual,
            details: &drift.details,
        };
        let request = self.client.post(format!("{}{}", self.url, PLAN_PATH)).json(&body);
        let response = authorized(request, &self.api_key)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<PlanResponse>().await?.action)
    }
}

#[async_trait]
impl L2Planner for CentralPlanner {
    async fn plan(&self, drift: &DriftResult) -> Option<RemediationAction> {
        let action = match self.request_plan(drift).await {
            Ok(action) => action?,
            Err(e) => {
                warn!("L2 planning for {} failed: {}", drift.check_name, e);
                return None;
            }
        };
        match action.parse::<RemediationAction>() {
            Ok(action) => Some(action),
            Err(e) => {
                warn!("Central proposed an action outside the catalog: {}", e);
                None
            }
        }
    }
}
