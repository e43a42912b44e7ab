//! Verbindungs-Registry – Wer ist gerade verbunden
//!
//! Einzige Quelle der Wahrheit fuer lebende Verbindungen: ein Schluessel
//! existiert genau dann, wenn der Endpoint die Verbindung als lebendig
//! betrachtet. Eintraege werden genau einmal hinzugefuegt (nach vollstaendiger
//! Konfiguration) und genau einmal entfernt (beim Trennen).
//!
//! Thread-safe via DashMap; Accept-Pfad und Trenn-Pfad greifen ohne externe
//! Sperren zu.

use dashmap::{mapref::entry::Entry, DashMap};
use framelink_core::{ConnectionId, PeerAddress};

use crate::connection::ConnectionHandle;
use crate::error::{EndpointError, EndpointResult};

/// Nebenlaeufige Zuordnung Peer-Adresse -> Connection-Handle
pub struct ConnectionRegistry<M> {
    verbindungen: DashMap<PeerAddress, ConnectionHandle<M>>,
}

impl<M> ConnectionRegistry<M> {
    /// Erstellt eine leere Registry
    pub fn neu() -> Self {
        Self {
            verbindungen: DashMap::new(),
        }
    }

    /// Registriert ein Handle unter seiner Peer-Adresse
    ///
    /// Schlaegt mit `DoppelteVerbindung` fehl, wenn die Adresse bereits belegt
    /// ist. Der bestehende Eintrag bleibt dann unveraendert.
    pub fn registrieren(
        &self,
        adresse: PeerAddress,
        handle: ConnectionHandle<M>,
    ) -> EndpointResult<()> {
        match self.verbindungen.entry(adresse) {
            Entry::Occupied(_) => Err(EndpointError::DoppelteVerbindung(adresse)),
            Entry::Vacant(frei) => {
                frei.insert(handle);
                tracing::trace!(peer = %adresse, "Verbindung registriert");
                Ok(())
            }
        }
    }

    /// Schlaegt das Handle zu einer Peer-Adresse nach
    pub fn nachschlagen(&self, adresse: &PeerAddress) -> EndpointResult<ConnectionHandle<M>> {
        self.verbindungen
            .get(adresse)
            .map(|eintrag| eintrag.value().clone())
            .ok_or(EndpointError::NichtGefunden(*adresse))
    }

    /// Entfernt einen Eintrag und gibt das bisherige Handle zurueck
    pub fn entfernen(&self, adresse: &PeerAddress) -> Option<ConnectionHandle<M>> {
        self.verbindungen.remove(adresse).map(|(_, handle)| handle)
    }

    /// Entfernt einen Eintrag nur, wenn er zu genau diesem Handle gehoert
    pub fn entfernen_wenn(
        &self,
        adresse: &PeerAddress,
        id: ConnectionId,
    ) -> Option<ConnectionHandle<M>> {
        self.verbindungen
            .remove_if(adresse, |_, handle| handle.id() == id)
            .map(|(_, handle)| handle)
    }

    /// Entfernt alle Eintraege (nur beim Herunterfahren)
    pub fn alle_entfernen(&self) -> Vec<ConnectionHandle<M>> {
        let adressen = self.adressen();
        adressen
            .iter()
            .filter_map(|adresse| self.entfernen(adresse))
            .collect()
    }

    pub fn enthaelt(&self, adresse: &PeerAddress) -> bool {
        self.verbindungen.contains_key(adresse)
    }

    /// Snapshot aller registrierten Peer-Adressen
    pub fn adressen(&self) -> Vec<PeerAddress> {
        self.verbindungen.iter().map(|eintrag| *eintrag.key()).collect()
    }

    pub fn anzahl(&self) -> usize {
        self.verbindungen.len()
    }

    pub fn ist_leer(&self) -> bool {
        self.verbindungen.is_empty()
    }
}

impl<M> Default for ConnectionRegistry<M> {
    fn default() -> Self {
        Self::neu()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
