//! Accept-Schleife – Nimmt Verbindungen auf dem Lese-Kontext an
//!
//! Genau eine Schleife pro laufendem Endpoint. Jeder Durchlauf nimmt eine
//! Verbindung an oder protokolliert den Fehler und versucht es erneut,
//! solange der Listener offen ist. Zwischen zwei Durchlaeufen gibt die
//! Schleife den Kontext frei, damit Lese-Tasks auch bei einem Sturm von
//! Accept-Fehlern weiterlaufen.

use framelink_core::PeerAddress;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Quelle angenommener Verbindungen
pub trait Acceptor: Send + 'static {
    /// Wartet auf die naechste eingehende Verbindung
    fn annehmen(
        &mut self,
    ) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send + '_;
}

impl Acceptor for TcpListener {
    fn annehmen(
        &mut self,
    ) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send + '_ {
        self.accept()
    }
}

/// Laeuft bis `schliessen_rx` `true` meldet
///
/// `bei_verbindung` wird fuer jede angenommene Verbindung synchron auf dem
/// Kontext der Schleife aufgerufen.
pub async fn accept_schleife<A, F>(
    mut acceptor: A,
    mut schliessen_rx: watch::Receiver<bool>,
    mut bei_verbindung: F,
) where
    A: Acceptor,
    F: FnMut(TcpStream, PeerAddress) + Send,
{
    tracing::debug!("Accept-Schleife gestartet");

    loop {
        tokio::select! {
            biased;

            _ = schliessen_rx.wait_for(|geschlossen| *geschlossen) => break,

            ergebnis = acceptor.annehmen() => match ergebnis {
                Ok((stream, adresse)) => {
                    tracing::debug!(peer = %adresse, "Verbindung angenommen");
                    bei_verbindung(stream, PeerAddress(adresse));
                }
                Err(e) => {
                    tracing::error!(fehler = %e, "TCP-Accept-Fehler");
                }
            },
        }

        tokio::task::yield_now().await;
    }

    tracing::debug!("Accept-Schleife beendet");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Schlaegt bei jedem Aufruf sofort fehl
    struct FehlerSturm {
        versuche: Arc<AtomicUsize>,
    }

    impl Acceptor for FehlerSturm {
        fn annehmen(
            &mut self,
        ) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send + '_ {
            self.versuche.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "simulierter Accept-Fehler",
            )))
        }
    }

    #[tokio::test]
    async fn fehlersturm_blockiert_andere_tasks_nicht() {
        let versuche = Arc::new(AtomicUsize::new(0));
        let (schliessen_tx, schliessen_rx) = watch::channel(false);

        let schleife = tokio::spawn(accept_schleife(
            FehlerSturm {
                versuche: Arc::clone(&versuche),
            },
            schliessen_rx,
            |_, _| panic!("keine Verbindung erwartet"),
        ));

        // Ein zweiter Task auf derselben single-threaded Runtime kommt dran
        let fortschritt = tokio::spawn(async {
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            true
        });
        assert!(tokio::time::timeout(Duration::from_secs(5), fortschritt)
            .await
            .unwrap()
            .unwrap());

        // Die Schleife versucht es weiter, solange der Listener offen ist
        while versuche.load(Ordering::SeqCst) < 100 {
            tokio::task::yield_now().await;
        }

        schliessen_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), schleife)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn echte_verbindungen_werden_gemeldet() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let adresse = listener.local_addr().unwrap();
        let (schliessen_tx, schliessen_rx) = watch::channel(false);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let schleife = tokio::spawn(accept_schleife(listener, schliessen_rx, move |stream, peer| {
            let _ = tx.send((stream, peer));
        }));

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(adresse).await.unwrap());
        }

        let mut peers = Vec::new();
        for _ in 0..3 {
            let (_, peer) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            peers.push(peer);
        }
        for client in &clients {
            assert!(peers.contains(&PeerAddress(client.local_addr().unwrap())));
        }

        schliessen_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), schleife)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn bereits_geschlossen_beendet_sofort() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_schliessen_tx, schliessen_rx) = watch::channel(true);

        tokio::time::timeout(
            Duration::from_secs(5),
            accept_schleife(listener, schliessen_rx, |_, _| {}),
        )
        .await
        .unwrap();
    }
}
