//! Identifikationstypen fuer Verbindungen
//!
//! Beide Typen verwenden das Newtype-Pattern, damit eine Peer-Adresse nicht
//! mit einer beliebigen `SocketAddr` (z.B. der lokalen Bind-Adresse)
//! verwechselt werden kann.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

/// Netzwerk-Identitaet (Host + Port) eines verbundenen Clients
///
/// Schluessel der Verbindungs-Registry. Eindeutig pro lebender Verbindung
/// und stabil fuer deren gesamte Lebensdauer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(pub SocketAddr);

impl PeerAddress {
    /// Gibt die innere Socket-Adresse zurueck
    pub fn inner(&self) -> SocketAddr {
        self.0
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Eindeutige ID eines einzelnen Connection-Handles
///
/// Zwei Handles koennen nacheinander dieselbe `PeerAddress` tragen; die ID
/// unterscheidet sie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Erstellt eine neue zufaellige ConnectionId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Gibt die innere UUID zurueck
    pub fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}
