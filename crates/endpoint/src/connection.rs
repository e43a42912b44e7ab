//! Connection-Handle – Eine einzelne angenommene TCP-Verbindung
//!
//! Das Handle besitzt den Socket, die Puffer- und Timeout-Einstellungen und
//! vier eigene Handler-Registries (getrennt, empfangen, gesendet,
//! sendefehler). Der Endpoint verdrahtet diese beim Einrichten einmalig mit
//! seinen eigenen Registries.
//!
//! ## Lebenszyklus
//! ```text
//! neu --konfigurieren--> konfiguriert --lesen_starten--> liest
//!  |                         |                            |
//!  +-------------------------+------- trennen ------------+--> getrennt
//! ```
//!
//! ## Tasks
//! - Lese-Task auf dem Lese-Kontext: dekodiert Frames und verteilt sie an
//!   die Empfangen-Handler. EOF, IO-Fehler, Dekodierfehler und Lese-Timeout
//!   trennen die Verbindung.
//! - Schreib-Task auf dem Schreib-Kontext: leert die FIFO-Sendequeue der
//!   Verbindung. Ein fehlgeschlagenes Senden trennt die Verbindung nicht,
//!   ausser der Frame wurde nur teilweise geschrieben (Timeout oder
//!   IO-Fehler mitten im Frame). Dann sind die Frame-Grenzen verloren und
//!   die Verbindung wird getrennt.
//! - Jede gesendete Nachricht erhaelt genau ein Ereignis: gesendet oder
//!   sendefehler. Was beim Trennen noch wartet oder gerade geschrieben
//!   wird, meldet der Schreib-Task als `VerbindungGeschlossen`.
//!
//! Beide Tasks arbeiten auf eigenen Kopien des Sockets (dupliziertes
//! Handle), damit jede Kopie bei genau der Runtime registriert ist, die sie
//! pollt.

use framelink_core::{ConnectionId, Message, PeerAddress};
use framelink_protocol::FrameCodec;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::config::VerbindungsEinstellungen;
use crate::error::{EndpointError, EndpointResult, SendError};
use crate::handlers::{
    DisconnectedHandler, HandlerRegistry, MessageReceivedHandler, MessageSentHandler,
    SendFailedHandler,
};

type FrameLeser<M> = FramedRead<TcpStream, FrameCodec<M>>;
type FrameSchreiber<M> = FramedWrite<TcpStream, FrameCodec<M>>;

// ---------------------------------------------------------------------------
// Handler einer Verbindung
// ---------------------------------------------------------------------------

/// Die vier Registries eines einzelnen Handles
pub struct VerbindungsHandlers<M> {
    pub getrennt: HandlerRegistry<DisconnectedHandler>,
    pub empfangen: HandlerRegistry<MessageReceivedHandler<M>>,
    pub gesendet: HandlerRegistry<MessageSentHandler<M>>,
    pub sendefehler: HandlerRegistry<SendFailedHandler<M>>,
}

impl<M> VerbindungsHandlers<M> {
    fn neu() -> Self {
        Self {
            getrennt: HandlerRegistry::neu(),
            empfangen: HandlerRegistry::neu(),
            gesendet: HandlerRegistry::neu(),
            sendefehler: HandlerRegistry::neu(),
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionHandle
// ---------------------------------------------------------------------------

/// Konfiguration, die `konfigurieren` setzt
#[derive(Clone)]
struct Konfiguration {
    einstellungen: VerbindungsEinstellungen,
    leser: Handle,
    schreiber: Handle,
}

struct HandleInner<M> {
    id: ConnectionId,
    peer: PeerAddress,
    /// Socket bis `lesen_starten` ihn an die Tasks uebergibt
    socket: Mutex<Option<TcpStream>>,
    konfiguration: Mutex<Option<Konfiguration>>,
    sende_tx: mpsc::UnboundedSender<M>,
    /// Empfangsseite der Sendequeue bis der Schreib-Task sie uebernimmt
    sende_rx: Mutex<Option<mpsc::UnboundedReceiver<M>>>,
    gestartet: AtomicBool,
    getrennt: AtomicBool,
    schliessen_tx: watch::Sender<bool>,
    handlers: VerbindungsHandlers<M>,
}

/// Handle auf eine lebende Verbindung
///
/// Clone teilt den inneren Zustand.
pub struct ConnectionHandle<M> {
    inner: Arc<HandleInner<M>>,
}

impl<M> Clone for ConnectionHandle<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> ConnectionHandle<M> {
    /// Eindeutige ID dieses Handles
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_adresse(&self) -> PeerAddress {
        self.inner.peer
    }

    /// Einstellungen aus `konfigurieren`, falls schon konfiguriert
    pub fn einstellungen(&self) -> Option<VerbindungsEinstellungen> {
        self.inner
            .konfiguration
            .lock()
            .as_ref()
            .map(|k| k.einstellungen)
    }

    pub fn ist_getrennt(&self) -> bool {
        self.inner.getrennt.load(Ordering::SeqCst)
    }

    pub fn liest(&self) -> bool {
        self.inner.gestartet.load(Ordering::SeqCst) && !self.ist_getrennt()
    }

    /// Zugriff auf die eigenen Registries (z.B. zum Abbestellen)
    pub fn handlers(&self) -> &VerbindungsHandlers<M> {
        &self.inner.handlers
    }

    pub fn bei_getrennt(&self, handler: Arc<DisconnectedHandler>) {
        self.inner.handlers.getrennt.abonnieren(handler);
    }

    pub fn bei_empfangen(&self, handler: Arc<MessageReceivedHandler<M>>) {
        self.inner.handlers.empfangen.abonnieren(handler);
    }

    pub fn bei_gesendet(&self, handler: Arc<MessageSentHandler<M>>) {
        self.inner.handlers.gesendet.abonnieren(handler);
    }

    pub fn bei_sendefehler(&self, handler: Arc<SendFailedHandler<M>>) {
        self.inner.handlers.sendefehler.abonnieren(handler);
    }

    /// Setzt Puffergroessen, Timeouts und die beiden Ausfuehrungskontexte
    ///
    /// Muss vor `lesen_starten` aufgerufen werden; danach ist die
    /// Konfiguration fest.
    pub fn konfigurieren(
        &self,
        einstellungen: VerbindungsEinstellungen,
        leser: Handle,
        schreiber: Handle,
    ) -> EndpointResult<()> {
        if self.inner.gestartet.load(Ordering::SeqCst) {
            return Err(EndpointError::BereitsGestartet(self.inner.peer));
        }
        *self.inner.konfiguration.lock() = Some(Konfiguration {
            einstellungen,
            leser,
            schreiber,
        });
        Ok(())
    }

    /// Trennt die Verbindung
    ///
    /// Idempotent: nur der erste Aufruf schliesst den Socket und loest genau
    /// eine Getrennt-Benachrichtigung aus. Noch nicht geschriebene
    /// Nachrichten werden als `VerbindungGeschlossen` gemeldet.
    pub fn trennen(&self) {
        if self.inner.getrennt.swap(true, Ordering::SeqCst) {
            return;
        }

        // Beide Tasks beobachten dieses Signal und geben ihre Socket-Kopie frei
        self.inner.schliessen_tx.send_replace(true);

        // Nie gestartet: Socket und Queue liegen noch im Handle
        drop(self.inner.socket.lock().take());
        let wartend = self.inner.sende_rx.lock().take();
        if let Some(mut rx) = wartend {
            rx.close();
            while let Ok(nachricht) = rx.try_recv() {
                self.sendefehler_melden(&nachricht, &SendError::VerbindungGeschlossen);
            }
        }

        tracing::debug!(peer = %self.inner.peer, id = %self.inner.id, "Verbindung getrennt");

        let peer = self.inner.peer;
        self.inner.handlers.getrennt.verteilen(|h| h(peer));
    }

    /// Schliesst ein nie registriertes Handle ohne Benachrichtigung
    pub(crate) fn verwerfen(&self) {
        if self.inner.getrennt.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.schliessen_tx.send_replace(true);
        drop(self.inner.socket.lock().take());
        drop(self.inner.sende_rx.lock().take());
    }

    fn sendefehler_melden(&self, nachricht: &M, fehler: &SendError) {
        let peer = self.inner.peer;
        self.inner
            .handlers
            .sendefehler
            .verteilen(|h| h(peer, nachricht, fehler));
    }
}

impl<M: Message> ConnectionHandle<M> {
    /// Erstellt ein Handle fuer einen frisch angenommenen Socket
    pub fn neu(peer: PeerAddress, socket: TcpStream) -> Self {
        Self::mit_socket(peer, Some(socket))
    }

    fn mit_socket(peer: PeerAddress, socket: Option<TcpStream>) -> Self {
        let (sende_tx, sende_rx) = mpsc::unbounded_channel();
        let (schliessen_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(HandleInner {
                id: ConnectionId::new(),
                peer,
                socket: Mutex::new(socket),
                konfiguration: Mutex::new(None),
                sende_tx,
                sende_rx: Mutex::new(Some(sende_rx)),
                gestartet: AtomicBool::new(false),
                getrennt: AtomicBool::new(false),
                schliessen_tx,
                handlers: VerbindungsHandlers::neu(),
            }),
        }
    }

    /// Handle ohne Socket fuer Registry-Tests
    #[cfg(test)]
    pub(crate) fn ohne_socket(peer: PeerAddress) -> Self {
        Self::mit_socket(peer, None)
    }

    /// Sendet eine Nachricht asynchron
    ///
    /// Die Nachricht wird in die FIFO-Sendequeue der Verbindung gestellt.
    /// Ergebnis meldet der Schreib-Task ueber die Gesendet- bzw.
    /// Sendefehler-Handler. Nachrichten vor `lesen_starten` werden
    /// gepuffert und danach in Reihenfolge geschrieben.
    pub fn senden(&self, nachricht: M) {
        if self.ist_getrennt() {
            self.sendefehler_melden(&nachricht, &SendError::VerbindungGeschlossen);
            return;
        }
        if let Err(mpsc::error::SendError(nachricht)) = self.inner.sende_tx.send(nachricht) {
            self.sendefehler_melden(&nachricht, &SendError::VerbindungGeschlossen);
        }
    }

    /// Startet Lese- und Schreib-Task auf den konfigurierten Kontexten
    pub fn lesen_starten(&self) -> EndpointResult<()> {
        let peer = self.inner.peer;
        let konfiguration = self
            .inner
            .konfiguration
            .lock()
            .clone()
            .ok_or(EndpointError::NichtKonfiguriert(peer))?;

        if self.inner.gestartet.swap(true, Ordering::SeqCst) {
            return Err(EndpointError::BereitsGestartet(peer));
        }

        let socket = self.inner.socket.lock().take();
        let sende_rx = self.inner.sende_rx.lock().take();
        let (Some(socket), Some(sende_rx)) = (socket, sende_rx) else {
            if self.ist_getrennt() {
                tracing::debug!(peer = %peer, "Lesen nicht gestartet, Verbindung bereits getrennt");
                return Ok(());
            }
            return Err(EndpointError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "Handle besitzt keinen Socket",
            )));
        };

        let Konfiguration {
            einstellungen,
            leser,
            schreiber,
        } = konfiguration;
        let (lese_socket, schreib_socket) = socket_aufteilen(socket, &leser, &schreiber)?;

        let frames = FrameLeser::<M>::with_capacity(
            lese_socket,
            FrameCodec::with_max_size(einstellungen.max_frame_bytes),
            einstellungen.lese_puffer_bytes,
        );
        let mut sink = FrameSchreiber::<M>::new(
            schreib_socket,
            FrameCodec::with_max_size(einstellungen.max_frame_bytes),
        );
        sink.set_backpressure_boundary(einstellungen.schreib_puffer_bytes);

        let lese_handle = self.clone();
        let lese_schliessen = self.inner.schliessen_tx.subscribe();
        leser.spawn(async move {
            lese_handle
                .lese_schleife(frames, einstellungen.lese_timeout, lese_schliessen)
                .await;
        });

        let schreib_handle = self.clone();
        let schreib_schliessen = self.inner.schliessen_tx.subscribe();
        schreiber.spawn(async move {
            schreib_handle
                .schreib_schleife(sink, sende_rx, einstellungen.schreib_timeout, schreib_schliessen)
                .await;
        });

        tracing::debug!(peer = %peer, id = %self.inner.id, "Lesen gestartet");
        Ok(())
    }

    async fn lese_schleife(
        self,
        mut frames: FrameLeser<M>,
        lese_timeout: Option<Duration>,
        mut schliessen_rx: watch::Receiver<bool>,
    ) {
        let peer = self.inner.peer;

        loop {
            let ergebnis = tokio::select! {
                _ = schliessen_rx.wait_for(|geschlossen| *geschlossen) => break,
                frame = naechster_frame(&mut frames, lese_timeout) => frame,
            };

            match ergebnis {
                Ok(Some(nachricht)) => {
                    tracing::trace!(peer = %peer, "Nachricht empfangen");
                    self.inner
                        .handlers
                        .empfangen
                        .verteilen(|h| h(peer, &nachricht));
                }
                Ok(None) => {
                    tracing::info!(peer = %peer, "Verbindung vom Peer getrennt");
                    break;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, fehler = %e, "Frame-Lesefehler");
                    break;
                }
            }
        }

        drop(frames);
        self.trennen();
    }

    async fn schreib_schleife(
        self,
        mut sink: FrameSchreiber<M>,
        sende_rx: mpsc::UnboundedReceiver<M>,
        schreib_timeout: Option<Duration>,
        mut schliessen_rx: watch::Receiver<bool>,
    ) {
        let peer = self.inner.peer;
        let mut queue = SendeQueue {
            handle: self.clone(),
            rx: sende_rx,
            in_flug: None,
        };

        loop {
            let nachricht = tokio::select! {
                biased;
                _ = schliessen_rx.wait_for(|geschlossen| *geschlossen) => break,
                naechste = queue.rx.recv() => match naechste {
                    Some(nachricht) => nachricht,
                    None => break,
                },
            };

            // Liegt im Guard, solange sie geschrieben wird
            let in_flug = queue.in_flug.insert(nachricht);

            // Schliessen bricht auch ein blockiertes Schreiben ab
            let ergebnis = tokio::select! {
                biased;
                _ = schliessen_rx.wait_for(|geschlossen| *geschlossen) => None,
                ergebnis = schreiben(&mut sink, &*in_flug, schreib_timeout) => Some(ergebnis),
            };
            let Some(ergebnis) = ergebnis else {
                break;
            };
            let Some(nachricht) = queue.in_flug.take() else {
                break;
            };

            match ergebnis {
                Ok(()) => {
                    tracing::trace!(peer = %peer, "Nachricht gesendet");
                    self.inner
                        .handlers
                        .gesendet
                        .verteilen(|h| h(peer, &nachricht));
                }
                Err(Schreibfehler::Verworfen(fehler)) => {
                    tracing::warn!(peer = %peer, fehler = %fehler, "Senden fehlgeschlagen");
                    self.sendefehler_melden(&nachricht, &fehler);
                }
                Err(Schreibfehler::Abgebrochen(fehler)) => {
                    tracing::warn!(
                        peer = %peer,
                        fehler = %fehler,
                        "Frame nur teilweise geschrieben, Verbindung wird getrennt"
                    );
                    self.sendefehler_melden(&nachricht, &fehler);
                    self.trennen();
                    break;
                }
            }
        }

        // Restliche Queue vor dem FIN melden
        drop(queue);

        // FIN an den Peer, auch wenn die Lese-Kopie noch offen ist
        let _ = sink.get_mut().shutdown().await;
    }
}

/// Sendequeue im Besitz des Schreib-Tasks
///
/// Beim Drop wird die gerade geschriebene und jede noch wartende Nachricht
/// als `VerbindungGeschlossen` gemeldet. Das gilt auch, wenn die Runtime den
/// Task beim Herunterfahren des Schreib-Kontexts verwirft.
struct SendeQueue<M> {
    handle: ConnectionHandle<M>,
    rx: mpsc::UnboundedReceiver<M>,
    in_flug: Option<M>,
}

impl<M> Drop for SendeQueue<M> {
    fn drop(&mut self) {
        if let Some(nachricht) = self.in_flug.take() {
            self.handle
                .sendefehler_melden(&nachricht, &SendError::VerbindungGeschlossen);
        }
        self.rx.close();
        while let Ok(nachricht) = self.rx.try_recv() {
            self.handle
                .sendefehler_melden(&nachricht, &SendError::VerbindungGeschlossen);
        }
    }
}

impl<M> std::fmt::Debug for ConnectionHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("getrennt", &self.ist_getrennt())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Hilfsfunktionen
// ---------------------------------------------------------------------------

/// Dupliziert den Socket und bindet je eine Kopie an Lese- und Schreib-Runtime
fn socket_aufteilen(
    socket: TcpStream,
    leser: &Handle,
    schreiber: &Handle,
) -> io::Result<(TcpStream, TcpStream)> {
    let lese_std = socket.into_std()?;
    let schreib_std = lese_std.try_clone()?;

    let lese_socket = {
        let _kontext = leser.enter();
        TcpStream::from_std(lese_std)?
    };
    let schreib_socket = {
        let _kontext = schreiber.enter();
        TcpStream::from_std(schreib_std)?
    };
    Ok((lese_socket, schreib_socket))
}

async fn naechster_frame<M: Message>(
    frames: &mut FrameLeser<M>,
    lese_timeout: Option<Duration>,
) -> io::Result<Option<M>> {
    let frame = match lese_timeout {
        Some(dauer) => tokio::time::timeout(dauer, frames.next())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "Lese-Timeout"))?,
        None => frames.next().await,
    };
    frame.transpose()
}

/// Ausgang eines fehlgeschlagenen Schreibens
enum Schreibfehler {
    /// Kein Byte des Frames hat den Socket erreicht, die Verbindung bleibt nutzbar
    Verworfen(SendError),
    /// Frame teilweise geschrieben, die Frame-Grenzen im Stream sind verloren
    Abgebrochen(SendError),
}

/// Schreibt genau einen Frame
///
/// Der Schreibpuffer ist vorher leer: jedes erfolgreiche Schreiben leert
/// ihn, und jeder Fehler leert ihn oder beendet die Verbindung. Nach einem
/// Timeout oder IO-Fehler ohne geschriebene Bytes wird der Frame wieder aus
/// dem Puffer entfernt, damit ein als fehlgeschlagen gemeldeter Frame nie
/// spaeter doch noch beim Peer ankommt.
async fn schreiben<M: Message, W: AsyncWrite + Unpin>(
    sink: &mut FramedWrite<W, FrameCodec<M>>,
    nachricht: &M,
    schreib_timeout: Option<Duration>,
) -> Result<(), Schreibfehler> {
    let vorher = sink.write_buffer().len();

    // Leerer Puffer: feed kodiert nur, ohne auf den Socket zu warten
    if let Err(e) = sink.feed(nachricht).await {
        sink.write_buffer_mut().truncate(vorher);
        return Err(Schreibfehler::Verworfen(e.into()));
    }
    let frame_ende = sink.write_buffer().len();

    let fehler = match schreib_timeout {
        Some(dauer) => match tokio::time::timeout(dauer, SinkExt::<&M>::flush(sink)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => SendError::from(e),
            Err(_) => SendError::Timeout(dauer),
        },
        None => match SinkExt::<&M>::flush(sink).await {
            Ok(()) => return Ok(()),
            Err(e) => SendError::from(e),
        },
    };

    if sink.write_buffer().len() == frame_ende {
        sink.write_buffer_mut().truncate(vorher);
        Err(Schreibfehler::Verworfen(fehler))
    } else {
        Err(Schreibfehler::Abgebrochen(fehler))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
