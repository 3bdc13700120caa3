use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::time::Instant;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub redis: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn from_probe<E: std::fmt::Display>(component: &str, started: Instant, probe: Result<(), E>) -> Self {
        match probe {
            Ok(()) => Self {
                status: "ok".to_string(),
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
            Err(e) => {
                tracing::warn!(component, error = %e, "Health probe failed");
                Self {
                    status: "error".to_string(),
                    latency_ms: None,
                }
            }
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /health: Database and Redis reachability.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let started = Instant::now();
    let database = ComponentHealth::from_probe("database", started, state.store.ping().await);

    let started = Instant::now();
    let redis = ComponentHealth::from_probe("redis", started, state.sequence.health_check().await);

    let healthy = database.is_ok() && redis.is_ok();
    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks { database, redis },
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
