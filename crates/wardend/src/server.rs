//! HTTP server for wardend

use crate::pipeline::Pipeline;
use crate::routes;
use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;
use warden_common::fleet::FleetRegistry;
use warden_common::learning::{AgentOperatingConfig, RuleCatalog};

/// Application state shared across handlers
pub struct AppState {
    pub site_id: String,
    pub agent_config: AgentOperatingConfig,
    pub fleet: Arc<FleetRegistry>,
    pub catalog: Arc<RuleCatalog>,
    pub pipeline: Arc<Pipeline>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        site_id: impl Into<String>,
        agent_config: AgentOperatingConfig,
        fleet: Arc<FleetRegistry>,
        catalog: Arc<RuleCatalog>,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            agent_config,
            fleet,
            catalog,
            pipeline,
            start_time: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes::health_routes())
        .merge(routes::rule_routes())
        .merge(routes::agent_routes())
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server until shutdown; TLS when a server config is given
pub async fn run(
    state: AppState,
    bind: &str,
    tls: Option<Arc<rustls::ServerConfig>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    match tls {
        Some(config) => {
            info!("Listening on https://{} (mTLS)", bind);
            crate::tls::serve_tls(listener, config, app, shutdown).await
        }
        None => {
            info!("Listening on http://{}", bind);
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await?;
            Ok(())
        }
    }
}
