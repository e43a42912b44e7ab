//! Fehlertypen fuer den Endpoint

use framelink_core::PeerAddress;
use std::time::Duration;
use thiserror::Error;

/// Fehlertyp fuer Endpoint-, Registry- und Handle-Operationen
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Listening-Socket oder Ausfuehrungskontexte konnten nicht angelegt werden
    #[error("Initialisierung fehlgeschlagen: {0}")]
    Initialisierung(#[source] std::io::Error),

    /// Port belegt oder Bind nicht erlaubt
    #[error("Bind auf Port {port} fehlgeschlagen: {quelle}")]
    Bind {
        port: u16,
        #[source]
        quelle: std::io::Error,
    },

    /// Sonstiger IO-Fehler (Socket-Aufteilung, Adressabfrage)
    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    /// Kein lebender Eintrag fuer diese Peer-Adresse
    #[error("Verbindung nicht gefunden: {0}")]
    NichtGefunden(PeerAddress),

    /// Peer-Adresse ist bereits registriert
    #[error("Verbindung bereits registriert: {0}")]
    DoppelteVerbindung(PeerAddress),

    /// `starten` ohne vorheriges `initialisieren` (auch nach `stoppen`)
    #[error("Endpoint ist nicht initialisiert")]
    NichtInitialisiert,

    /// Operation im aktuellen Lebenszyklus-Zustand nicht erlaubt
    #[error("Ungueltiger Zustand: {0}")]
    UngueltigerZustand(&'static str),

    /// `lesen_starten` vor `konfigurieren`
    #[error("Verbindung {0} ist nicht konfiguriert")]
    NichtKonfiguriert(PeerAddress),

    /// `lesen_starten` wurde bereits aufgerufen
    #[error("Verbindung {0} liest bereits")]
    BereitsGestartet(PeerAddress),

    /// Der Endpoint existiert nicht mehr (nur ueber `EndpointSender`)
    #[error("Endpoint wurde beendet")]
    Beendet,
}

impl EndpointError {
    /// Gibt true zurueck wenn der Fehler ein unbekannter Peer ist
    pub fn ist_nicht_gefunden(&self) -> bool {
        matches!(self, Self::NichtGefunden(_))
    }
}

/// Result-Typ fuer den Endpoint
pub type EndpointResult<T> = Result<T, EndpointError>;

/// Grund, warum eine einzelne Nachricht nicht gesendet werden konnte
///
/// Wird an die Sendefehler-Handler uebergeben. Die Verbindung bleibt bei
/// `Timeout` und `Io` bestehen.
#[derive(Debug, Error)]
pub enum SendError {
    /// Schreiben hat das Schreib-Timeout ueberschritten
    #[error("Schreib-Timeout nach {0:?}")]
    Timeout(Duration),

    /// Serialisierung oder Socket-Schreiben fehlgeschlagen
    #[error("Schreibfehler: {0}")]
    Io(#[from] std::io::Error),

    /// Verbindung war bereits getrennt oder wurde vor dem Schreiben getrennt
    #[error("Verbindung geschlossen")]
    VerbindungGeschlossen,
}
