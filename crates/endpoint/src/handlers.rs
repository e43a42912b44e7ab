//! Handler-Registries – Abonnenten pro Ereignisart
//!
//! Jede Registry ist eine Copy-on-Write-Liste: `abonnieren` und
//! `abbestellen` ersetzen die Liste atomar, `verteilen` iteriert ueber einen
//! unveraenderlichen Snapshot. Ein Handler kann daher waehrend der Verteilung
//! andere Handler hinzufuegen oder entfernen, ohne die laufende Verteilung zu
//! blockieren oder zu veraendern.
//!
//! Identitaet eines Handlers ist seine `Arc`-Allokation. Wer einen Handler
//! wieder entfernen moechte, behaelt eine Kopie des `Arc`.

use framelink_core::PeerAddress;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::SendError;

// ---------------------------------------------------------------------------
// Handler-Typen
// ---------------------------------------------------------------------------

/// Neue Verbindung wurde angenommen und registriert
pub type ConnectedHandler = dyn Fn(PeerAddress) + Send + Sync;

/// Verbindung wurde getrennt (lokal, vom Peer oder durch IO-Fehler)
pub type DisconnectedHandler = dyn Fn(PeerAddress) + Send + Sync;

/// Vollstaendig dekodierte Nachricht empfangen
pub type MessageReceivedHandler<M> = dyn Fn(PeerAddress, &M) + Send + Sync;

/// Nachricht wurde vollstaendig geschrieben
pub type MessageSentHandler<M> = dyn Fn(PeerAddress, &M) + Send + Sync;

/// Nachricht konnte nicht gesendet werden
pub type SendFailedHandler<M> = dyn Fn(PeerAddress, &M, &SendError) + Send + Sync;

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Thread-sichere Copy-on-Write-Menge von Handlern einer Ereignisart
pub struct HandlerRegistry<H: ?Sized> {
    handler: RwLock<Arc<Vec<Arc<H>>>>,
}

impl<H: ?Sized> HandlerRegistry<H> {
    /// Erstellt eine leere Registry
    pub fn neu() -> Self {
        Self {
            handler: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Fuegt einen Handler am Ende hinzu
    ///
    /// Doppelte Abonnements sind erlaubt; der Handler wird dann mehrfach
    /// aufgerufen.
    pub fn abonnieren(&self, handler: Arc<H>) {
        let mut guard = self.handler.write();
        let mut neu = Vec::with_capacity(guard.len() + 1);
        neu.extend(guard.iter().cloned());
        neu.push(handler);
        *guard = Arc::new(neu);
    }

    /// Entfernt das erste Vorkommen des Handlers
    ///
    /// Gibt `false` zurueck wenn der Handler nicht abonniert war.
    pub fn abbestellen(&self, handler: &Arc<H>) -> bool {
        let mut guard = self.handler.write();
        let Some(pos) = guard.iter().position(|h| gleicher_handler(h, handler)) else {
            return false;
        };
        let mut neu: Vec<Arc<H>> = guard.iter().cloned().collect();
        neu.remove(pos);
        *guard = Arc::new(neu);
        true
    }

    /// Unveraenderlicher Snapshot der aktuell abonnierten Handler
    pub fn snapshot(&self) -> Arc<Vec<Arc<H>>> {
        Arc::clone(&self.handler.read())
    }

    /// Ruft `aufruf` fuer jeden abonnierten Handler in Abonnement-Reihenfolge auf
    ///
    /// Die Sperre wird vor dem ersten Aufruf freigegeben. Panics eines
    /// Handlers werden nicht abgefangen.
    pub fn verteilen(&self, mut aufruf: impl FnMut(&H)) {
        let snapshot = self.snapshot();
        for handler in snapshot.iter() {
            aufruf(handler);
        }
    }

    pub fn anzahl(&self) -> usize {
        self.handler.read().len()
    }

    pub fn ist_leer(&self) -> bool {
        self.anzahl() == 0
    }
}

impl<H: ?Sized> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self::neu()
    }
}

/// Vergleicht nur die Datenadresse; Vtable-Zeiger von `dyn`-Handlern sind
/// nicht eindeutig.
fn gleicher_handler<H: ?Sized>(a: &Arc<H>, b: &Arc<H>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

// ---------------------------------------------------------------------------
// ServerHandlers
// ---------------------------------------------------------------------------

/// Die fuenf Registries eines Server-Endpoints
pub struct ServerHandlers<M> {
    pub verbunden: HandlerRegistry<ConnectedHandler>,
    pub getrennt: HandlerRegistry<DisconnectedHandler>,
    pub empfangen: HandlerRegistry<MessageReceivedHandler<M>>,
    pub gesendet: HandlerRegistry<MessageSentHandler<M>>,
    pub sendefehler: HandlerRegistry<SendFailedHandler<M>>,
}

impl<M> ServerHandlers<M> {
    pub fn neu() -> Self {
        Self {
            verbunden: HandlerRegistry::neu(),
            getrennt: HandlerRegistry::neu(),
            empfangen: HandlerRegistry::neu(),
            gesendet: HandlerRegistry::neu(),
            sendefehler: HandlerRegistry::neu(),
        }
    }
}

impl<M> Default for ServerHandlers<M> {
    fn default() -> Self {
        Self::neu()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn peer() -> PeerAddress {
        PeerAddress("127.0.0.1:4000".parse().unwrap())
    }

    fn zaehl_handler(zaehler: &Arc<AtomicUsize>) -> Arc<ConnectedHandler> {
        let zaehler = Arc::clone(zaehler);
        Arc::new(move |_| {
            zaehler.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn verteilen_ruft_alle_handler_auf() {
        let registry = HandlerRegistry::<ConnectedHandler>::neu();
        let zaehler = Arc::new(AtomicUsize::new(0));
        registry.abonnieren(zaehl_handler(&zaehler));
        registry.abonnieren(zaehl_handler(&zaehler));

        registry.verteilen(|h| h(peer()));
        assert_eq!(zaehler.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reihenfolge_entspricht_abonnement() {
        let registry = HandlerRegistry::<ConnectedHandler>::neu();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            registry.abonnieren(Arc::new(move |_| log.lock().push(i)));
        }
        registry.verteilen(|h| h(peer()));
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn doppelt_abonniert_einmal_abbestellt_bleibt_abonniert() {
        let registry = HandlerRegistry::<ConnectedHandler>::neu();
        let zaehler = Arc::new(AtomicUsize::new(0));
        let handler = zaehl_handler(&zaehler);

        registry.abonnieren(Arc::clone(&handler));
        registry.abonnieren(Arc::clone(&handler));
        assert!(registry.abbestellen(&handler));
        assert_eq!(registry.anzahl(), 1);

        registry.verteilen(|h| h(peer()));
        assert_eq!(zaehler.load(Ordering::SeqCst), 1);

        assert!(registry.abbestellen(&handler));
        assert!(registry.ist_leer());
    }

    #[test]
    fn abbestellen_unbekannter_handler_ist_noop() {
        let registry = HandlerRegistry::<ConnectedHandler>::neu();
        let zaehler = Arc::new(AtomicUsize::new(0));
        registry.abonnieren(zaehl_handler(&zaehler));

        let fremd = zaehl_handler(&zaehler);
        assert!(!registry.abbestellen(&fremd));
        assert_eq!(registry.anzahl(), 1);
    }

    #[test]
    fn abonnieren_waehrend_verteilen_wirkt_erst_beim_naechsten_mal() {
        let registry = Arc::new(HandlerRegistry::<ConnectedHandler>::neu());
        let zaehler = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&registry);
        let z = Arc::clone(&zaehler);
        registry.abonnieren(Arc::new(move |_| {
            r.abonnieren(zaehl_handler(&z));
        }));

        registry.verteilen(|h| h(peer()));
        assert_eq!(zaehler.load(Ordering::SeqCst), 0);
        assert_eq!(registry.anzahl(), 2);

        registry.verteilen(|h| h(peer()));
        assert_eq!(zaehler.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abbestellen_waehrend_verteilen_blockiert_nicht() {
        let registry = Arc::new(HandlerRegistry::<ConnectedHandler>::neu());
        let zaehler = Arc::new(AtomicUsize::new(0));
        let zweiter = zaehl_handler(&zaehler);

        let r = Arc::clone(&registry);
        let z = Arc::clone(&zweiter);
        registry.abonnieren(Arc::new(move |_| {
            r.abbestellen(&z);
        }));
        registry.abonnieren(Arc::clone(&zweiter));

        // Snapshot enthaelt den zweiten Handler noch
        registry.verteilen(|h| h(peer()));
        assert_eq!(zaehler.load(Ordering::SeqCst), 1);
        assert_eq!(registry.anzahl(), 1);
    }

    #[test]
    fn nachrichten_handler_erhalten_payload() {
        let handlers = ServerHandlers::<String>::neu();
        let empfangen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let e = Arc::clone(&empfangen);
        handlers
            .empfangen
            .abonnieren(Arc::new(move |addr, msg: &String| e.lock().push((addr, msg.clone()))));

        let nachricht = "hallo".to_string();
        handlers.empfangen.verteilen(|h| h(peer(), &nachricht));
        assert_eq!(*empfangen.lock(), vec![(peer(), "hallo".to_string())]);
    }
}
