//! framelink-server – Bibliotheks-Root
//!
//! Echo-Server auf Basis von `framelink-endpoint`: jede empfangene Nachricht
//! geht unveraendert an ihren Absender zurueck. Die Bibliothek stellt den
//! Einstiegspunkt fuer `main` und die Integrationstests bereit.

pub mod config;

use anyhow::{Context, Result};
use config::ServerConfig;
use framelink_endpoint::ServerEndpoint;
use framelink_observability::{observability_server_starten, EndpointMetrics, HealthState};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;

/// Nachrichtentyp des Echo-Servers
pub type EchoEndpoint = ServerEndpoint<Value>;

/// Haelt den laufenden Server-Zustand zusammen
pub struct Server {
    pub config: ServerConfig,
    endpoint: Arc<EchoEndpoint>,
    metriken: EndpointMetrics,
}

impl Server {
    /// Erstellt den Endpoint, verdrahtet Echo und Metriken
    pub fn neu(config: ServerConfig) -> Result<Self> {
        let endpoint = Arc::new(EchoEndpoint::neu(config.endpoint.clone()));
        let metriken = EndpointMetrics::neu().context("Metriken konnten nicht angelegt werden")?;

        // Metriken zuerst, damit Zaehler vor dem Echo stehen
        metriken.beobachten(&endpoint);
        echo_verdrahten(&endpoint);

        Ok(Self {
            config,
            endpoint,
            metriken,
        })
    }

    pub fn endpoint(&self) -> &Arc<EchoEndpoint> {
        &self.endpoint
    }

    pub fn metriken(&self) -> &EndpointMetrics {
        &self.metriken
    }

    /// Initialisiert und startet den Endpoint, liefert die gebundene Adresse
    pub fn hochfahren(&self) -> Result<SocketAddr> {
        self.endpoint
            .initialisieren()
            .context("Endpoint-Initialisierung fehlgeschlagen")?;
        self.endpoint
            .starten()
            .context("Endpoint-Start fehlgeschlagen")?;
        self.endpoint
            .lokale_adresse()
            .context("Endpoint hat keine lokale Adresse")
    }

    /// Stoppt den Endpoint; alle Verbindungen werden getrennt
    pub fn herunterfahren(&self) -> Result<()> {
        self.endpoint.stoppen()?;
        Ok(())
    }

    /// Startet alle Subsysteme und laeuft bis zum Shutdown-Signal
    ///
    /// Reihenfolge:
    /// 1. Echo-Endpoint starten
    /// 2. Observability-Server starten (falls aktiviert)
    /// 3. Auf Ctrl-C warten
    /// 4. Endpoint stoppen
    pub async fn starten(self) -> Result<()> {
        let adresse = self.hochfahren()?;
        tracing::info!(
            adresse = %adresse,
            name = %self.config.endpoint.name,
            "Echo-Endpoint laeuft"
        );

        let observability = if self.config.observability.aktiviert {
            let bind = self.config.observability_bind_adresse();
            let health = HealthState::neu(self.endpoint.clone());
            let metriken = self.metriken.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = observability_server_starten(bind, metriken, health).await {
                    tracing::error!(fehler = %e, "Observability-Server beendet");
                }
            }))
        } else {
            tracing::info!("Observability-Server deaktiviert");
            None
        };

        tracing::info!("Server laeuft. Warte auf Shutdown-Signal (Ctrl-C)...");
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown-Signal empfangen, Server wird beendet");

        if let Some(task) = observability {
            task.abort();
        }

        // Stoppen joint die Kontext-Threads, daher ausserhalb der Runtime-Worker
        let endpoint = Arc::clone(&self.endpoint);
        tokio::task::spawn_blocking(move || endpoint.stoppen()).await??;

        tracing::info!(
            verbindungen = self.metriken.connections_total.get(),
            "Server beendet"
        );
        Ok(())
    }
}

/// Sendet jede empfangene Nachricht an ihren Absender zurueck
pub fn echo_verdrahten(endpoint: &EchoEndpoint) {
    let sender = endpoint.sender();
    endpoint.empfangen_abonnieren(Arc::new(move |peer, nachricht: &Value| {
        if let Err(e) = sender.senden(peer, nachricht.clone()) {
            tracing::debug!(peer = %peer, fehler = %e, "Echo nicht moeglich");
        }
    }));
}
