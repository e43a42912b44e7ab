//! Prometheus-kompatible Metriken fuer framelink
//!
//! Registrierte Metriken:
//! - `framelink_connections_active` – Gauge: Aktuell verbundene Peers
//! - `framelink_connections_total` – Counter: Angenommene Verbindungen
//! - `framelink_messages_received_total` – Counter: Empfangene Nachrichten
//! - `framelink_messages_sent_total` – Counter: Erfolgreich gesendete Nachrichten
//! - `framelink_send_failures_total` – Counter: Fehlgeschlagene Sendungen
//!
//! Die Werte kommen ausschliesslich aus abonnierten Endpoint-Ereignissen.

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use framelink_endpoint::{Message, SendError, ServerEndpoint};
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Alle framelink-Prometheus-Metriken
#[derive(Clone)]
pub struct EndpointMetrics {
    pub registry: Arc<Registry>,

    pub connections_active: IntGauge,
    pub connections_total: IntCounter,
    pub messages_received_total: IntCounter,
    pub messages_sent_total: IntCounter,
    pub send_failures_total: IntCounter,
}

impl EndpointMetrics {
    /// Erstellt und registriert alle Metriken in einer neuen Registry
    pub fn neu() -> Result<Self> {
        let registry = Registry::new();

        let connections_active = IntGauge::with_opts(Opts::new(
            "framelink_connections_active",
            "Anzahl aktuell verbundener Peers",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let connections_total = IntCounter::with_opts(Opts::new(
            "framelink_connections_total",
            "Gesamtanzahl angenommener Verbindungen",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let messages_received_total = IntCounter::with_opts(Opts::new(
            "framelink_messages_received_total",
            "Gesamtanzahl empfangener Nachrichten",
        ))?;
        registry.register(Box::new(messages_received_total.clone()))?;

        let messages_sent_total = IntCounter::with_opts(Opts::new(
            "framelink_messages_sent_total",
            "Gesamtanzahl gesendeter Nachrichten",
        ))?;
        registry.register(Box::new(messages_sent_total.clone()))?;

        let send_failures_total = IntCounter::with_opts(Opts::new(
            "framelink_send_failures_total",
            "Gesamtanzahl fehlgeschlagener Sendungen",
        ))?;
        registry.register(Box::new(send_failures_total.clone()))?;

        // Prozess-Metriken (CPU, Speicher, File-Deskriptoren)
        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry: Arc::new(registry),
            connections_active,
            connections_total,
            messages_received_total,
            messages_sent_total,
            send_failures_total,
        })
    }

    /// Abonniert die Ereignisse eines Endpoints
    ///
    /// Kann vor oder nach `starten` aufgerufen werden; es zaehlt nur, was
    /// nach dem Abonnieren passiert.
    pub fn beobachten<M: Message>(&self, endpoint: &ServerEndpoint<M>) {
        let (aktiv, gesamt) = (self.connections_active.clone(), self.connections_total.clone());
        endpoint.verbunden_abonnieren(Arc::new(move |_| {
            aktiv.inc();
            gesamt.inc();
        }));

        let aktiv = self.connections_active.clone();
        endpoint.getrennt_abonnieren(Arc::new(move |_| aktiv.dec()));

        let empfangen = self.messages_received_total.clone();
        endpoint.empfangen_abonnieren(Arc::new(move |_, _: &M| empfangen.inc()));

        let gesendet = self.messages_sent_total.clone();
        endpoint.gesendet_abonnieren(Arc::new(move |_, _: &M| gesendet.inc()));

        let fehler = self.send_failures_total.clone();
        endpoint.sendefehler_abonnieren(Arc::new(move |peer, _: &M, grund: &SendError| {
            tracing::debug!(peer = %peer, fehler = %grund, "Sendefehler gezaehlt");
            fehler.inc();
        }));
    }

    /// Exportiert alle Metriken im Prometheus-Textformat
    pub fn exportieren(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Axum-Router fuer den `/metrics`-Endpunkt
pub fn metrics_router(metriken: EndpointMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metriken)
}

async fn metrics_handler(State(metriken): State<EndpointMetrics>) -> impl IntoResponse {
    match metriken.exportieren() {
        Ok(text) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4",
            )],
            text,
        )
            .into_response(),
        Err(err) => {
            tracing::error!("Metriken-Export fehlgeschlagen: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
