//! Health check HTTP server
//!
//! Liveness and readiness checks for process supervision plus the
//! Prometheus metrics endpoint.

use crate::error::{RelayError, Result};
use crate::feed::FeedSessionPool;
use crate::services::Metrics;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    fn worst(self, other: HealthStatus) -> HealthStatus {
        use HealthStatus::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

/// Overall system health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub components: Vec<ComponentHealth>,
    pub feed_sessions: usize,
}

/// Shared state for health server
pub struct HealthState {
    pub started_at: DateTime<Utc>,
    pub pool: Arc<FeedSessionPool>,
    pub metrics: Arc<Metrics>,
    /// Whether a database backs the stores
    pub db_required: bool,
    pub db_connected: AtomicBool,
    pub last_db_check: RwLock<Option<DateTime<Utc>>>,
}

impl HealthState {
    pub fn new(pool: Arc<FeedSessionPool>, metrics: Arc<Metrics>) -> Self {
        Self {
            started_at: Utc::now(),
            pool,
            metrics,
            db_required: false,
            db_connected: AtomicBool::new(false),
            last_db_check: RwLock::new(None),
        }
    }

    pub fn with_database(mut self) -> Self {
        self.db_required = true;
        self
    }

    /// Record database check
    pub async fn record_db_check(&self, success: bool) {
        *self.last_db_check.write().await = Some(Utc::now());
        self.db_connected.store(success, Ordering::SeqCst);
    }

    fn feed_health(&self) -> ComponentHealth {
        let tenants = self.pool.tenants();
        let disconnected = tenants
            .iter()
            .filter_map(|t| self.pool.get(t))
            .filter(|s| !s.is_connected())
            .count();

        let (status, message) = if !self.pool.is_running() {
            (HealthStatus::Unhealthy, Some("pool shut down".to_string()))
        } else if disconnected > 0 {
            (
                HealthStatus::Degraded,
                Some(format!("{}/{} sessions disconnected", disconnected, tenants.len())),
            )
        } else {
            (HealthStatus::Healthy, None)
        };

        ComponentHealth {
            name: "feed_pool".to_string(),
            status,
            message,
            last_check: Some(Utc::now()),
        }
    }

    /// Get overall health status
    pub async fn get_health(&self) -> HealthResponse {
        let mut components = vec![self.feed_health()];

        if self.db_required {
            let connected = self.db_connected.load(Ordering::SeqCst);
            components.push(ComponentHealth {
                name: "database".to_string(),
                status: if connected {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Unhealthy
                },
                message: (!connected).then(|| "Disconnected".to_string()),
                last_check: *self.last_db_check.read().await,
            });
        }

        let status = components
            .iter()
            .fold(HealthStatus::Healthy, |acc, c| acc.worst(c.status));

        HealthResponse {
            status,
            timestamp: Utc::now(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            components,
            feed_sessions: self.pool.len(),
        }
    }
}

/// Build the health router
pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health check server
pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = router(Arc::clone(&self.state));
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting health server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| RelayError::Internal(format!("Health server error: {}", e)))?;

        Ok(())
    }

    pub fn state(&self) -> Arc<HealthState> {
        Arc::clone(&self.state)
    }
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let status_code = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

/// Is the process alive?
async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Ready once the pool accepts sessions and the database answers
async fn readiness_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let up = match health.status {
        HealthStatus::Healthy => 1,
        HealthStatus::Degraded => 0,
        HealthStatus::Unhealthy => -1,
    };

    let mut body = format!(
        r#"# HELP relay_up Health status (1=healthy, 0=degraded, -1=unhealthy)
# TYPE relay_up gauge
relay_up {}
# HELP relay_uptime_seconds Uptime in seconds
# TYPE relay_uptime_seconds counter
relay_uptime_seconds {}
# HELP relay_feed_sessions Live feed sessions
# TYPE relay_feed_sessions gauge
relay_feed_sessions {}
"#,
        up, health.uptime_seconds, health.feed_sessions,
    );
    body.push_str(&state.metrics.render_prometheus());

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
}
