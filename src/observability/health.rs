//! Health check HTTP server
//!
//! Exposes the global metrics as JSON and derives an overall health verdict
//! from link, session, and publish freshness. Disabled unless
//! `[health] enabled = true`.

use crate::observability::metrics::{metrics, MetricsSnapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// HTTP health check server
pub struct HealthServer {
    client_id: String,
    port: u16,
    stale_after: Duration,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
}

impl HealthCheck {
    fn healthy(message: &str) -> Self {
        Self {
            status: "healthy".to_string(),
            message: Some(message.to_string()),
        }
    }

    fn with_status(status: &str, message: String) -> Self {
        Self {
            status: status.to_string(),
            message: Some(message),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub client_id: String,
    pub uptime_seconds: u64,
    pub buffered_samples: u64,
    pub checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

impl HealthServer {
    /// `stale_after` is how long without a successful publish counts as stale
    pub fn new(client_id: impl Into<String>, port: u16, stale_after: Duration) -> Self {
        Self {
            client_id: client_id.into(),
            port,
            stale_after,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Derive the health verdict from a metrics snapshot
    pub fn evaluate(&self, snapshot: &MetricsSnapshot, now: u64) -> HealthStatus {
        let mut checks = BTreeMap::new();

        checks.insert(
            "link".to_string(),
            if snapshot.link.connected {
                HealthCheck::healthy("Network link up")
            } else {
                HealthCheck::with_status(
                    "unhealthy",
                    format!("Network link down ({} drops)", snapshot.link.drops),
                )
            },
        );

        checks.insert(
            "mqtt".to_string(),
            if snapshot.session.connected {
                HealthCheck::healthy("MQTT session established")
            } else {
                HealthCheck::with_status(
                    "unhealthy",
                    format!(
                        "MQTT session down ({} failures)",
                        snapshot.session.failures
                    ),
                )
            },
        );

        let last_publish = snapshot.telemetry.last_publish;
        let telemetry = if last_publish == 0 {
            HealthCheck::healthy("No samples published yet")
        } else if now.saturating_sub(last_publish) > self.stale_after.as_secs() {
            HealthCheck::with_status(
                "stale",
                format!(
                    "No publish for {} seconds",
                    now.saturating_sub(last_publish)
                ),
            )
        } else {
            HealthCheck::healthy("Recent publish")
        };
        checks.insert("telemetry".to_string(), telemetry);

        let healthy = checks.values().all(HealthCheck::is_healthy);
        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            client_id: self.client_id.clone(),
            uptime_seconds: snapshot.uptime_seconds,
            buffered_samples: snapshot.telemetry.buffer_depth,
            checks,
        }
    }

    /// All HTTP routes
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let health_server = self.clone();

        // GET /health - overall status with per-component checks
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = health_server.clone();
                async move {
                    let status = server.evaluate(&metrics().get_metrics(), current_timestamp());
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        // GET /ready - link and session both up
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                let snapshot = metrics().get_metrics();
                let ready = snapshot.link.connected && snapshot.session.connected;
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&response), code)
            });

        // GET /live - process is serving requests
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        health_route.or(metrics_route).or(ready_route).or(live_route)
    }

    /// Serve until the process exits
    pub async fn start(self: Arc<Self>) {
        let port = self.port;
        tracing::info!("Starting health server on port {}", port);
        warp::serve(self.routes()).run(([0, 0, 0, 0], port)).await;
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
