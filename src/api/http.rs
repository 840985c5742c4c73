//! HTTP Status API
//!
//! Read-only view over the running engine: node health, cluster membership,
//! and live takeover attempts. Everything here observes; mutations only ever
//! enter through the cluster port.

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::config::ApiConfig;
use crate::engine::ClusterEngine;
use crate::error::{Error, Result};
use crate::takeover::AttemptSnapshot;

/// Shared application state
pub struct AppState {
    engine: Arc<ClusterEngine>,
    started_at: DateTime<Utc>,
}

/// Read-only HTTP server over the engine
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, engine: Arc<ClusterEngine>) -> Self {
        let state = Arc::new(AppState {
            engine,
            started_at: Utc::now(),
        });
        Self { config, state }
    }

    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/cluster", get(handle_cluster))
            .route("/takeovers", get(handle_takeovers))
            .with_state(state)
    }

    /// Serve until the process exits
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    instance: String,
    uptime_secs: i64,
}

#[derive(Serialize)]
struct StatusResponse {
    instance: String,
    identity: String,
    session: u64,
    ha_enabled: bool,
    master: Option<String>,
    members: usize,
    active_takeovers: usize,
}

#[derive(Serialize)]
struct ClusterResponse {
    master: Option<String>,
    members: Vec<MemberView>,
}

#[derive(Serialize)]
struct MemberView {
    identity: String,
    session: u64,
    state: String,
    reachable: bool,
    protocol_version: u16,
    joined_at: DateTime<Utc>,
    is_local: bool,
    is_master: bool,
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        instance: state.engine.local().instance.clone(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let engine = &state.engine;
    let members = engine.membership().snapshot().await;
    let attempts = engine.coordinator().snapshot().await;
    Json(StatusResponse {
        instance: engine.local().instance.clone(),
        identity: engine.local().identity_key(),
        session: engine.local().session.as_u64(),
        ha_enabled: engine.ha_enabled(),
        master: engine.membership().master().await.map(|m| m.identity_key()),
        members: members.len(),
        active_takeovers: attempts
            .iter()
            .filter(|a| !a.phase.is_terminal())
            .count(),
    })
}

async fn handle_cluster(State(state): State<Arc<AppState>>) -> Json<ClusterResponse> {
    let engine = &state.engine;
    let master = engine.membership().master().await;
    let members = engine
        .membership()
        .snapshot()
        .await
        .into_iter()
        .map(|m| MemberView {
            identity: m.address.identity_key(),
            session: m.address.session.as_u64(),
            state: m.state.to_string(),
            reachable: m.reachable,
            protocol_version: m.protocol_version,
            joined_at: m.joined_at,
            is_local: m.address.instance == engine.local().instance,
            is_master: master
                .as_ref()
                .map(|w| w.instance == m.address.instance)
                .unwrap_or(false),
        })
        .collect();
    Json(ClusterResponse {
        master: master.map(|m| m.identity_key()),
        members,
    })
}

async fn handle_takeovers(State(state): State<Arc<AppState>>) -> Json<Vec<AttemptSnapshot>> {
    Json(state.engine.coordinator().snapshot().await)
}
