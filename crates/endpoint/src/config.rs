//! Konfiguration fuer den Server-Endpoint
//!
//! Alle Felder ausser dem Port haben Standardwerte, sodass ein Endpoint mit
//! `EndpointConfig::mit_port(p)` sofort lauffaehig ist. Die Struktur ist
//! serde-faehig und kann direkt aus einer TOML-Sektion geladen werden.

use framelink_protocol::{DEFAULT_MAX_FRAME_SIZE, MAX_DARSTELLBARE_GROESSE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Standard-Puffergroesse fuer Lesen und Schreiben (Bytes)
pub const STANDARD_PUFFERGROESSE: usize = 8192;

/// Standard-Schreib-Timeout in Millisekunden
pub const STANDARD_SCHREIB_TIMEOUT_MS: u64 = 10_000;

/// Konfiguration eines Server-Endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// TCP-Port auf allen lokalen Interfaces (0 = vom OS vergeben)
    pub port: u16,
    /// Kapazitaet des Lesepuffers pro Verbindung
    pub lese_puffer_bytes: usize,
    /// Schwelle des Schreibpuffers pro Verbindung
    pub schreib_puffer_bytes: usize,
    /// Lese-Timeout pro Frame (None oder 0 = unbegrenzt)
    pub lese_timeout_ms: Option<u64>,
    /// Schreib-Timeout pro Nachricht (None oder 0 = unbegrenzt)
    pub schreib_timeout_ms: Option<u64>,
    /// Maximale Frame-Groesse in Bytes
    pub max_frame_bytes: usize,
    /// Praefix fuer die Thread-Namen der Ausfuehrungskontexte
    pub name: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            port: 0,
            lese_puffer_bytes: STANDARD_PUFFERGROESSE,
            schreib_puffer_bytes: STANDARD_PUFFERGROESSE,
            lese_timeout_ms: None,
            schreib_timeout_ms: Some(STANDARD_SCHREIB_TIMEOUT_MS),
            max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
            name: "framelink".into(),
        }
    }
}

impl EndpointConfig {
    /// Standardkonfiguration fuer einen bestimmten Port
    pub fn mit_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Leitet die Einstellungen ab, mit denen jede Verbindung konfiguriert wird
    pub fn verbindungs_einstellungen(&self) -> VerbindungsEinstellungen {
        VerbindungsEinstellungen {
            lese_puffer_bytes: self.lese_puffer_bytes,
            schreib_puffer_bytes: self.schreib_puffer_bytes,
            lese_timeout: timeout_aus_ms(self.lese_timeout_ms),
            schreib_timeout: timeout_aus_ms(self.schreib_timeout_ms),
            max_frame_bytes: self.max_frame_bytes.min(MAX_DARSTELLBARE_GROESSE),
        }
    }

    /// Thread-Name des Lese-Kontexts
    pub fn leser_name(&self) -> String {
        format!("{}-reader-{}", self.name, self.port)
    }

    /// Thread-Name des Schreib-Kontexts
    pub fn schreiber_name(&self) -> String {
        format!("{}-writer-{}", self.name, self.port)
    }
}

fn timeout_aus_ms(ms: Option<u64>) -> Option<Duration> {
    ms.filter(|ms| *ms > 0).map(Duration::from_millis)
}

/// Puffer- und Timeout-Einstellungen einer einzelnen Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerbindungsEinstellungen {
    pub lese_puffer_bytes: usize,
    pub schreib_puffer_bytes: usize,
    pub lese_timeout: Option<Duration>,
    pub schreib_timeout: Option<Duration>,
    pub max_frame_bytes: usize,
}

impl Default for VerbindungsEinstellungen {
    fn default() -> Self {
        EndpointConfig::default().verbindungs_einstellungen()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_config() {
        let cfg = EndpointConfig::mit_port(7000);
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.lese_puffer_bytes, 8192);
        assert_eq!(cfg.schreib_puffer_bytes, 8192);
        assert_eq!(cfg.lese_timeout_ms, None);
        assert_eq!(cfg.schreib_timeout_ms, Some(10_000));
    }

    #[test]
    fn verbindungs_einstellungen_umrechnung() {
        let cfg = EndpointConfig {
            lese_timeout_ms: Some(250),
            ..EndpointConfig::mit_port(1)
        };
        let e = cfg.verbindungs_einstellungen();
        assert_eq!(e.lese_timeout, Some(Duration::from_millis(250)));
        assert_eq!(e.schreib_timeout, Some(Duration::from_secs(10)));
        assert_eq!(e.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn null_timeout_bedeutet_unbegrenzt() {
        let cfg = EndpointConfig {
            schreib_timeout_ms: Some(0),
            ..EndpointConfig::default()
        };
        assert_eq!(cfg.verbindungs_einstellungen().schreib_timeout, None);
    }

    #[test]
    fn frame_grenze_wird_auf_laengenfeld_begrenzt() {
        let cfg = EndpointConfig {
            max_frame_bytes: usize::MAX,
            ..EndpointConfig::default()
        };
        assert_eq!(
            cfg.verbindungs_einstellungen().max_frame_bytes,
            MAX_DARSTELLBARE_GROESSE
        );
    }

    #[test]
    fn thread_namen() {
        let cfg = EndpointConfig::mit_port(9000);
        assert_eq!(cfg.leser_name(), "framelink-reader-9000");
        assert_eq!(cfg.schreiber_name(), "framelink-writer-9000");
    }

    #[test]
    fn config_aus_toml_string() {
        let toml = r#"
            port = 6001
            schreib_timeout_ms = 500
        "#;
        let cfg: EndpointConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.port, 6001);
        assert_eq!(cfg.schreib_timeout_ms, Some(500));
        // Nicht angegebene Felder behalten Standardwerte
        assert_eq!(cfg.lese_puffer_bytes, 8192);
        assert_eq!(cfg.name, "framelink");
    }
}
