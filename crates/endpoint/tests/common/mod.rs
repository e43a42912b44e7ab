//! Gemeinsame Hilfsfunktionen fuer die Endpoint-Integrationstests

#![allow(dead_code)]

use framelink_endpoint::{EndpointConfig, PeerAddress, SendError, ServerEndpoint};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

pub const WARTEN: Duration = Duration::from_secs(5);

/// Alle Server-Ereignisse als Kanaele
pub struct Ereignisse {
    pub verbunden: UnboundedReceiver<PeerAddress>,
    pub getrennt: UnboundedReceiver<PeerAddress>,
    pub empfangen: UnboundedReceiver<(PeerAddress, Value)>,
    pub gesendet: UnboundedReceiver<(PeerAddress, Value)>,
    pub sendefehler: UnboundedReceiver<(PeerAddress, Value, String)>,
}

/// Abonniert alle fuenf Ereignisarten und leitet sie in Kanaele um
pub fn ereignisse_abonnieren(endpoint: &ServerEndpoint<Value>) -> Ereignisse {
    let (verbunden_tx, verbunden) = unbounded_channel();
    endpoint.verbunden_abonnieren(Arc::new(move |peer| {
        let _ = verbunden_tx.send(peer);
    }));

    let (getrennt_tx, getrennt) = unbounded_channel();
    endpoint.getrennt_abonnieren(Arc::new(move |peer| {
        let _ = getrennt_tx.send(peer);
    }));

    let (empfangen_tx, empfangen) = unbounded_channel();
    endpoint.empfangen_abonnieren(Arc::new(move |peer, nachricht: &Value| {
        let _ = empfangen_tx.send((peer, nachricht.clone()));
    }));

    let (gesendet_tx, gesendet) = unbounded_channel();
    endpoint.gesendet_abonnieren(Arc::new(move |peer, nachricht: &Value| {
        let _ = gesendet_tx.send((peer, nachricht.clone()));
    }));

    let (sendefehler_tx, sendefehler) = unbounded_channel();
    endpoint.sendefehler_abonnieren(Arc::new(
        move |peer, nachricht: &Value, fehler: &SendError| {
            let _ = sendefehler_tx.send((peer, nachricht.clone(), fehler.to_string()));
        },
    ));

    Ereignisse {
        verbunden,
        getrennt,
        empfangen,
        gesendet,
        sendefehler,
    }
}

/// Startet einen Endpoint auf einem freien Port
pub fn endpoint_starten(config: EndpointConfig) -> (ServerEndpoint<Value>, Ereignisse, SocketAddr) {
    let endpoint = ServerEndpoint::neu(config);
    let ereignisse = ereignisse_abonnieren(&endpoint);
    endpoint
        .initialisieren()
        .expect("Initialisieren fehlgeschlagen");
    endpoint.starten().expect("Starten fehlgeschlagen");
    let adresse = loopback(&endpoint);
    (endpoint, ereignisse, adresse)
}

/// Loopback-Adresse des gebundenen Ports
pub fn loopback(endpoint: &ServerEndpoint<Value>) -> SocketAddr {
    let port = endpoint
        .lokale_adresse()
        .expect("Endpoint sollte gestartet sein")
        .port();
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Verbindet einen Client und liefert dessen Adresse aus Server-Sicht
pub async fn verbinden(adresse: SocketAddr) -> (TcpStream, PeerAddress) {
    let client = TcpStream::connect(adresse)
        .await
        .expect("Verbinden fehlgeschlagen");
    let peer = PeerAddress(client.local_addr().expect("lokale Adresse"));
    (client, peer)
}

/// Naechstes Ereignis oder Panic nach `WARTEN`
pub async fn naechstes<T>(rx: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WARTEN, rx.recv())
        .await
        .expect("Ereignis nicht rechtzeitig eingetroffen")
        .expect("Ereignis-Kanal geschlossen")
}

/// Stellt sicher, dass innerhalb einer kurzen Frist nichts mehr eintrifft
pub async fn keine_weiteren<T: std::fmt::Debug>(rx: &mut UnboundedReceiver<T>) {
    if let Ok(Some(ereignis)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        panic!("unerwartetes Ereignis: {ereignis:?}");
    }
}

/// Wartet bis der Server die Verbindung geschlossen hat
pub async fn geschlossen(client: &mut TcpStream) {
    let mut puffer = [0u8; 64];
    loop {
        match tokio::time::timeout(WARTEN, client.read(&mut puffer))
            .await
            .expect("Verbindung wurde nicht geschlossen")
        {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

/// Wartet bis `bedingung` wahr ist
pub async fn warten_bis(mut bedingung: impl FnMut() -> bool) {
    let start = tokio::time::Instant::now();
    while !bedingung() {
        assert!(start.elapsed() < WARTEN, "Bedingung nicht rechtzeitig erfuellt");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
