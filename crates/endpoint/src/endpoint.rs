//! Server-Endpoint – Lebenszyklus, Verdrahtung und Senden
//!
//! ## Lebenszyklus
//! ```text
//! Neu --initialisieren--> Initialisiert --starten--> Gestartet
//!  ^                          |                          |
//!  |                          +--------- stoppen --------+--> Gestoppt
//!  +------------------------- initialisieren ----------------------+
//! ```
//!
//! Abonnements ueberleben `stoppen` und gelten nach erneutem
//! `initialisieren`/`starten` weiter.

use framelink_core::{Message, PeerAddress};
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::accept::accept_schleife;
use crate::config::{EndpointConfig, VerbindungsEinstellungen};
use crate::connection::ConnectionHandle;
use crate::error::{EndpointError, EndpointResult, SendError};
use crate::executor::ExecutionContext;
use crate::handlers::{
    ConnectedHandler, DisconnectedHandler, MessageReceivedHandler, MessageSentHandler,
    SendFailedHandler, ServerHandlers,
};
use crate::registry::ConnectionRegistry;

/// Backlog des Listening-Sockets
const LISTEN_BACKLOG: u32 = 1024;

/// Beobachtbarer Zustand des Endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointZustand {
    Neu,
    Initialisiert,
    Gestartet,
    Gestoppt,
}

// ---------------------------------------------------------------------------
// Interner Zustand
// ---------------------------------------------------------------------------

/// Ressourcen nach `initialisieren`
struct Vorbereitet {
    socket: TcpSocket,
    leser: ExecutionContext,
    schreiber: ExecutionContext,
}

/// Ressourcen nach `starten`
struct Laufend {
    leser: ExecutionContext,
    schreiber: ExecutionContext,
    schliessen_tx: watch::Sender<bool>,
    lokale_adresse: SocketAddr,
}

enum Lebenszyklus {
    Neu,
    Initialisiert(Vorbereitet),
    Gestartet(Laufend),
    Gestoppt,
}

impl Lebenszyklus {
    fn zustand(&self) -> EndpointZustand {
        match self {
            Self::Neu => EndpointZustand::Neu,
            Self::Initialisiert(_) => EndpointZustand::Initialisiert,
            Self::Gestartet(_) => EndpointZustand::Gestartet,
            Self::Gestoppt => EndpointZustand::Gestoppt,
        }
    }
}

struct Innen {
    config: EndpointConfig,
    lebenszyklus: Lebenszyklus,
}

/// Zustand, den Endpoint, Accept-Schleife, Handles und `EndpointSender` teilen
struct Geteilt<M> {
    registry: ConnectionRegistry<M>,
    handlers: ServerHandlers<M>,
}

impl<M: Message> Geteilt<M> {
    /// Richtet eine frisch angenommene Verbindung ein
    ///
    /// Reihenfolge: konfigurieren, verdrahten, registrieren, Verbunden
    /// melden, Lesen starten. Ein Handle wird erst sichtbar, wenn es
    /// vollstaendig konfiguriert ist.
    fn verbindung_einrichten(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: PeerAddress,
        einstellungen: VerbindungsEinstellungen,
        leser: &Handle,
        schreiber: &Handle,
    ) {
        let handle = ConnectionHandle::neu(peer, stream);
        if let Err(e) = handle.konfigurieren(einstellungen, leser.clone(), schreiber.clone()) {
            tracing::error!(peer = %peer, fehler = %e, "Verbindung konnte nicht konfiguriert werden");
            handle.verwerfen();
            return;
        }

        self.verdrahten(&handle);

        if let Err(e) = self.registry.registrieren(peer, handle.clone()) {
            tracing::warn!(peer = %peer, fehler = %e, "Verbindung verworfen");
            handle.verwerfen();
            return;
        }

        tracing::info!(peer = %peer, id = %handle.id(), "Verbindung hergestellt");
        self.handlers.verbunden.verteilen(|h| h(peer));

        if let Err(e) = handle.lesen_starten() {
            tracing::error!(peer = %peer, fehler = %e, "Lesen konnte nicht gestartet werden");
            handle.trennen();
        }
    }

    /// Leitet die Ereignisse eines Handles an die Server-Handler weiter
    fn verdrahten(self: &Arc<Self>, handle: &ConnectionHandle<M>) {
        let id = handle.id();

        let geteilt = Arc::downgrade(self);
        handle.bei_getrennt(Arc::new(move |peer| {
            let Some(geteilt) = geteilt.upgrade() else {
                return;
            };
            geteilt.registry.entfernen_wenn(&peer, id);
            tracing::info!(peer = %peer, "Verbindung beendet");
            geteilt.handlers.getrennt.verteilen(|h| h(peer));
        }));

        let geteilt = Arc::downgrade(self);
        handle.bei_empfangen(Arc::new(move |peer, nachricht: &M| {
            if let Some(geteilt) = geteilt.upgrade() {
                geteilt.handlers.empfangen.verteilen(|h| h(peer, nachricht));
            }
        }));

        let geteilt = Arc::downgrade(self);
        handle.bei_gesendet(Arc::new(move |peer, nachricht: &M| {
            if let Some(geteilt) = geteilt.upgrade() {
                geteilt.handlers.gesendet.verteilen(|h| h(peer, nachricht));
            }
        }));

        let geteilt = Arc::downgrade(self);
        handle.bei_sendefehler(Arc::new(move |peer, nachricht: &M, fehler: &SendError| {
            if let Some(geteilt) = geteilt.upgrade() {
                geteilt
                    .handlers
                    .sendefehler
                    .verteilen(|h| h(peer, nachricht, fehler));
            }
        }));
    }

    fn senden(&self, adresse: PeerAddress, nachricht: M) -> EndpointResult<()> {
        self.registry.nachschlagen(&adresse)?.senden(nachricht);
        Ok(())
    }

    fn trennen(&self, adresse: PeerAddress) -> EndpointResult<()> {
        self.registry.nachschlagen(&adresse)?.trennen();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ServerEndpoint
// ---------------------------------------------------------------------------

/// Ereignisgesteuerter TCP-Server-Endpoint
///
/// Alle Methoden nehmen `&self`; der Endpoint kann in einem `Arc` zwischen
/// Threads geteilt werden. Handler laufen auf den Threads der
/// Ausfuehrungskontexte und duerfen alle Methoden ausser `stoppen` ohne
/// Deadlock aufrufen.
pub struct ServerEndpoint<M: Message> {
    innen: Mutex<Innen>,
    geteilt: Arc<Geteilt<M>>,
}

impl<M: Message> ServerEndpoint<M> {
    pub fn neu(config: EndpointConfig) -> Self {
        Self {
            innen: Mutex::new(Innen {
                config,
                lebenszyklus: Lebenszyklus::Neu,
            }),
            geteilt: Arc::new(Geteilt {
                registry: ConnectionRegistry::neu(),
                handlers: ServerHandlers::neu(),
            }),
        }
    }

    /// Endpoint mit Standardkonfiguration auf `port`
    pub fn mit_port(port: u16) -> Self {
        Self::neu(EndpointConfig::mit_port(port))
    }

    // -----------------------------------------------------------------------
    // Lebenszyklus
    // -----------------------------------------------------------------------

    /// Legt Listening-Socket und beide Ausfuehrungskontexte an
    ///
    /// Erlaubt im Zustand `Neu` und nach `stoppen`.
    pub fn initialisieren(&self) -> EndpointResult<()> {
        let mut innen = self.innen.lock();
        match innen.lebenszyklus {
            Lebenszyklus::Neu | Lebenszyklus::Gestoppt => {}
            Lebenszyklus::Initialisiert(_) | Lebenszyklus::Gestartet(_) => {
                return Err(EndpointError::UngueltigerZustand(
                    "Endpoint ist bereits initialisiert",
                ));
            }
        }

        let socket = TcpSocket::new_v4().map_err(EndpointError::Initialisierung)?;
        socket
            .set_reuseaddr(true)
            .map_err(EndpointError::Initialisierung)?;
        let leser = ExecutionContext::starten(innen.config.leser_name())
            .map_err(EndpointError::Initialisierung)?;
        let schreiber = ExecutionContext::starten(innen.config.schreiber_name())
            .map_err(EndpointError::Initialisierung)?;

        innen.lebenszyklus = Lebenszyklus::Initialisiert(Vorbereitet {
            socket,
            leser,
            schreiber,
        });
        tracing::debug!(port = innen.config.port, "Endpoint initialisiert");
        Ok(())
    }

    /// Bindet den Port auf allen Interfaces und startet die Accept-Schleife
    ///
    /// Nach `stoppen` schlaegt `starten` mit `NichtInitialisiert` fehl, bis
    /// erneut initialisiert wurde.
    pub fn starten(&self) -> EndpointResult<()> {
        let mut innen = self.innen.lock();
        let vorbereitet = match std::mem::replace(&mut innen.lebenszyklus, Lebenszyklus::Neu) {
            Lebenszyklus::Initialisiert(vorbereitet) => vorbereitet,
            anderer => {
                let fehler = if matches!(anderer, Lebenszyklus::Gestartet(_)) {
                    EndpointError::UngueltigerZustand("Endpoint laeuft bereits")
                } else {
                    EndpointError::NichtInitialisiert
                };
                innen.lebenszyklus = anderer;
                return Err(fehler);
            }
        };

        let port = innen.config.port;
        let bind_adresse = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        if let Err(quelle) = vorbereitet.socket.bind(bind_adresse) {
            innen.lebenszyklus = Lebenszyklus::Initialisiert(vorbereitet);
            return Err(EndpointError::Bind { port, quelle });
        }

        let Vorbereitet {
            socket,
            leser,
            schreiber,
        } = vorbereitet;

        // Listener gehoert zur Runtime des Lese-Kontexts
        let listener = {
            let _kontext = leser.handle().enter();
            socket.listen(LISTEN_BACKLOG)
        };
        let listener = listener.map_err(|quelle| EndpointError::Bind { port, quelle })?;
        let lokale_adresse = listener.local_addr()?;

        let (schliessen_tx, schliessen_rx) = watch::channel(false);
        let geteilt = Arc::clone(&self.geteilt);
        let einstellungen = innen.config.verbindungs_einstellungen();
        let lese_handle = leser.handle().clone();
        let schreib_handle = schreiber.handle().clone();

        leser.spawn(accept_schleife(listener, schliessen_rx, move |stream, peer| {
            geteilt.verbindung_einrichten(stream, peer, einstellungen, &lese_handle, &schreib_handle);
        }));

        innen.lebenszyklus = Lebenszyklus::Gestartet(Laufend {
            leser,
            schreiber,
            schliessen_tx,
            lokale_adresse,
        });
        tracing::info!(adresse = %lokale_adresse, "Endpoint gestartet");
        Ok(())
    }

    /// Schliesst Listener und alle Verbindungen und beendet die Kontexte
    ///
    /// Fuer jede offene Verbindung wird genau eine Getrennt-Benachrichtigung
    /// ausgeloest. Mehrfache Aufrufe und Aufrufe vor `starten` sind erlaubt.
    pub fn stoppen(&self) -> EndpointResult<()> {
        // Sperre vor dem Trennen freigeben, Handler duerfen den Endpoint benutzen
        let alter = {
            let mut innen = self.innen.lock();
            match innen.lebenszyklus {
                Lebenszyklus::Neu | Lebenszyklus::Gestoppt => return Ok(()),
                _ => std::mem::replace(&mut innen.lebenszyklus, Lebenszyklus::Gestoppt),
            }
        };

        match alter {
            Lebenszyklus::Initialisiert(vorbereitet) => {
                drop(vorbereitet);
                tracing::debug!("Endpoint vor dem Start gestoppt");
            }
            Lebenszyklus::Gestartet(mut laufend) => {
                laufend.schliessen_tx.send_replace(true);
                // Lese-Kontext zuerst: danach nimmt niemand mehr Verbindungen an
                laufend.leser.herunterfahren();

                let handles = self.geteilt.registry.alle_entfernen();
                let anzahl = handles.len();
                for handle in handles {
                    handle.trennen();
                }

                // Verworfene Schreib-Tasks melden ihre Queue noch vor dem Join
                laufend.schreiber.herunterfahren();
                tracing::info!(
                    adresse = %laufend.lokale_adresse,
                    verbindungen = anzahl,
                    "Endpoint gestoppt"
                );
            }
            Lebenszyklus::Neu | Lebenszyklus::Gestoppt => {}
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Senden und Trennen
    // -----------------------------------------------------------------------

    /// Sendet eine Nachricht an einen verbundenen Peer
    ///
    /// Schlaegt mit `NichtGefunden` fehl, wenn die Adresse nicht registriert
    /// ist. Das Ergebnis des Schreibens melden die Gesendet- und
    /// Sendefehler-Handler.
    pub fn nachricht_senden(&self, adresse: PeerAddress, nachricht: M) -> EndpointResult<()> {
        self.geteilt.senden(adresse, nachricht)
    }

    /// Trennt eine einzelne Verbindung
    pub fn verbindung_trennen(&self, adresse: PeerAddress) -> EndpointResult<()> {
        self.geteilt.trennen(adresse)
    }

    /// Schwacher, klonbarer Sender fuer Handler und andere Threads
    pub fn sender(&self) -> EndpointSender<M> {
        EndpointSender {
            geteilt: Arc::downgrade(&self.geteilt),
        }
    }

    // -----------------------------------------------------------------------
    // Abfragen
    // -----------------------------------------------------------------------

    pub fn zustand(&self) -> EndpointZustand {
        self.innen.lock().lebenszyklus.zustand()
    }

    pub fn config(&self) -> EndpointConfig {
        self.innen.lock().config.clone()
    }

    /// Tatsaechlich gebundene Adresse (nur im Zustand `Gestartet`)
    pub fn lokale_adresse(&self) -> Option<SocketAddr> {
        match &self.innen.lock().lebenszyklus {
            Lebenszyklus::Gestartet(laufend) => Some(laufend.lokale_adresse),
            _ => None,
        }
    }

    pub fn verbindungen(&self) -> Vec<PeerAddress> {
        self.geteilt.registry.adressen()
    }

    pub fn anzahl_verbindungen(&self) -> usize {
        self.geteilt.registry.anzahl()
    }

    pub fn ist_verbunden(&self, adresse: &PeerAddress) -> bool {
        self.geteilt.registry.enthaelt(adresse)
    }

    /// Handle einer Verbindung, z.B. fuer verbindungseigene Handler
    pub fn verbindung(&self, adresse: &PeerAddress) -> EndpointResult<ConnectionHandle<M>> {
        self.geteilt.registry.nachschlagen(adresse)
    }

    // -----------------------------------------------------------------------
    // Konfiguration (nur vor `initialisieren`)
    // -----------------------------------------------------------------------

    fn config_aendern(&self, aenderung: impl FnOnce(&mut EndpointConfig)) -> EndpointResult<()> {
        let mut innen = self.innen.lock();
        match innen.lebenszyklus {
            Lebenszyklus::Neu | Lebenszyklus::Gestoppt => {
                aenderung(&mut innen.config);
                Ok(())
            }
            _ => Err(EndpointError::UngueltigerZustand(
                "Konfiguration nach initialisieren nicht mehr aenderbar",
            )),
        }
    }

    pub fn port_setzen(&self, port: u16) -> EndpointResult<()> {
        self.config_aendern(|c| c.port = port)
    }

    pub fn lese_puffergroesse_setzen(&self, bytes: usize) -> EndpointResult<()> {
        self.config_aendern(|c| c.lese_puffer_bytes = bytes)
    }

    pub fn schreib_puffergroesse_setzen(&self, bytes: usize) -> EndpointResult<()> {
        self.config_aendern(|c| c.schreib_puffer_bytes = bytes)
    }

    /// `None` = unbegrenzt
    pub fn lese_timeout_setzen(&self, timeout: Option<Duration>) -> EndpointResult<()> {
        self.config_aendern(|c| c.lese_timeout_ms = timeout.map(dauer_in_ms))
    }

    /// `None` = unbegrenzt
    pub fn schreib_timeout_setzen(&self, timeout: Option<Duration>) -> EndpointResult<()> {
        self.config_aendern(|c| c.schreib_timeout_ms = timeout.map(dauer_in_ms))
    }

    // -----------------------------------------------------------------------
    // Abonnements
    // -----------------------------------------------------------------------

    pub fn verbunden_abonnieren(&self, handler: Arc<ConnectedHandler>) {
        self.geteilt.handlers.verbunden.abonnieren(handler);
    }

    pub fn verbunden_abbestellen(&self, handler: &Arc<ConnectedHandler>) -> bool {
        self.geteilt.handlers.verbunden.abbestellen(handler)
    }

    pub fn getrennt_abonnieren(&self, handler: Arc<DisconnectedHandler>) {
        self.geteilt.handlers.getrennt.abonnieren(handler);
    }

    pub fn getrennt_abbestellen(&self, handler: &Arc<DisconnectedHandler>) -> bool {
        self.geteilt.handlers.getrennt.abbestellen(handler)
    }

    pub fn empfangen_abonnieren(&self, handler: Arc<MessageReceivedHandler<M>>) {
        self.geteilt.handlers.empfangen.abonnieren(handler);
    }

    pub fn empfangen_abbestellen(&self, handler: &Arc<MessageReceivedHandler<M>>) -> bool {
        self.geteilt.handlers.empfangen.abbestellen(handler)
    }

    pub fn gesendet_abonnieren(&self, handler: Arc<MessageSentHandler<M>>) {
        self.geteilt.handlers.gesendet.abonnieren(handler);
    }

    pub fn gesendet_abbestellen(&self, handler: &Arc<MessageSentHandler<M>>) -> bool {
        self.geteilt.handlers.gesendet.abbestellen(handler)
    }

    pub fn sendefehler_abonnieren(&self, handler: Arc<SendFailedHandler<M>>) {
        self.geteilt.handlers.sendefehler.abonnieren(handler);
    }

    pub fn sendefehler_abbestellen(&self, handler: &Arc<SendFailedHandler<M>>) -> bool {
        self.geteilt.handlers.sendefehler.abbestellen(handler)
    }
}

impl<M: Message> Drop for ServerEndpoint<M> {
    fn drop(&mut self) {
        if let Err(e) = self.stoppen() {
            tracing::warn!(fehler = %e, "Stoppen beim Verwerfen fehlgeschlagen");
        }
    }
}

impl<M: Message> std::fmt::Debug for ServerEndpoint<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("zustand", &self.zustand())
            .field("verbindungen", &self.anzahl_verbindungen())
            .finish()
    }
}

fn dauer_in_ms(dauer: Duration) -> u64 {
    u64::try_from(dauer.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// EndpointSender
// ---------------------------------------------------------------------------

/// Klonbarer Verweis zum Senden aus Handlern heraus
///
/// Haelt den Endpoint nicht am Leben; nach dessen Verwerfen liefern alle
/// Operationen `Beendet`.
pub struct EndpointSender<M> {
    geteilt: Weak<Geteilt<M>>,
}

impl<M> Clone for EndpointSender<M> {
    fn clone(&self) -> Self {
        Self {
            geteilt: Weak::clone(&self.geteilt),
        }
    }
}

impl<M: Message> EndpointSender<M> {
    pub fn senden(&self, adresse: PeerAddress, nachricht: M) -> EndpointResult<()> {
        self.geteilt
            .upgrade()
            .ok_or(EndpointError::Beendet)?
            .senden(adresse, nachricht)
    }

    pub fn trennen(&self, adresse: PeerAddress) -> EndpointResult<()> {
        self.geteilt
            .upgrade()
            .ok_or(EndpointError::Beendet)?
            .trennen(adresse)
    }
}

impl<M> std::fmt::Debug for EndpointSender<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointSender")
            .field("aktiv", &(self.geteilt.strong_count() > 0))
            .finish()
    }
}
