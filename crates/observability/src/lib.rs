//! # framelink-observability
//!
//! Observability-Crate fuer framelink:
//! - Prometheus-kompatible Metriken (`/metrics`)
//! - Health-Check-Endpunkt (`/health`)
//! - Structured JSON Logging via tracing-subscriber

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{health_router, HealthQuelle, HealthResponse, HealthState, HealthStatus};
pub use logging::logging_initialisieren;
pub use metrics::{metrics_router, EndpointMetrics};

use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Router mit `/metrics` und `/health`
pub fn observability_router(metriken: EndpointMetrics, health: HealthState) -> Router {
    Router::new()
        .merge(metrics_router(metriken))
        .merge(health_router(health))
}

/// Startet den Observability-HTTP-Server (Metriken + Health)
///
/// Endpunkte:
/// - `GET /metrics` – Prometheus scrape format
/// - `GET /health`  – Health-Check JSON
pub async fn observability_server_starten(
    bind_addr: SocketAddr,
    metriken: EndpointMetrics,
    health: HealthState,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "Observability-Server gestartet");
    observability_bedienen(listener, metriken, health).await
}

/// Bedient einen bereits gebundenen Listener
pub async fn observability_bedienen(
    listener: TcpListener,
    metriken: EndpointMetrics,
    health: HealthState,
) -> Result<()> {
    axum::serve(listener, observability_router(metriken, health)).await?;
    Ok(())
}
