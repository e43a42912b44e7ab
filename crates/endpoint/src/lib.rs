//! framelink-endpoint – Ereignisgesteuerter TCP-Server-Endpoint
//!
//! Nimmt TCP-Verbindungen an, liest length-prefixed JSON-Frames und meldet
//! alles Relevante ueber abonnierbare Handler. Nachrichten gehen ueber die
//! Peer-Adresse raus; das Ergebnis des Schreibens kommt wieder als Ereignis.
//!
//! ## Architektur
//! ```text
//!                     ServerEndpoint<M>
//!        +-----------------+------------------+
//!        |                 |                  |
//!  ServerHandlers   ConnectionRegistry   2x ExecutionContext
//!  (5 Registries)   PeerAddress->Handle  <name>-reader-<port>
//!        ^                 |             <name>-writer-<port>
//!        |                 v
//!        +---------- ConnectionHandle<M>
//!          verdrahtet  (Lese-Task / Schreib-Task / FIFO-Queue)
//! ```
//!
//! ## Threads
//! - Reader-Kontext: Accept-Schleife, alle Lese-Tasks und damit alle
//!   Verbunden-, Getrennt- (bei Peer-Trennung) und Empfangen-Handler
//! - Writer-Kontext: alle Schreib-Tasks und damit alle Gesendet- und
//!   Sendefehler-Handler
//!
//! Handler sollten kurz sein; ein blockierender Handler haelt alle
//! Verbindungen seines Kontexts auf.
//!
//! ## Beispiel
//! ```rust,no_run
//! use framelink_endpoint::ServerEndpoint;
//! use std::sync::Arc;
//!
//! let endpoint = ServerEndpoint::<serde_json::Value>::mit_port(7000);
//! let sender = endpoint.sender();
//! endpoint.empfangen_abonnieren(Arc::new(move |peer, nachricht: &serde_json::Value| {
//!     let _ = sender.senden(peer, nachricht.clone());
//! }));
//! endpoint.initialisieren()?;
//! endpoint.starten()?;
//! # Ok::<(), framelink_endpoint::EndpointError>(())
//! ```

pub mod accept;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod registry;

pub use config::{EndpointConfig, VerbindungsEinstellungen};
pub use connection::{ConnectionHandle, VerbindungsHandlers};
pub use endpoint::{EndpointSender, EndpointZustand, ServerEndpoint};
pub use error::{EndpointError, EndpointResult, SendError};
pub use executor::ExecutionContext;
pub use handlers::{
    ConnectedHandler, DisconnectedHandler, HandlerRegistry, MessageReceivedHandler,
    MessageSentHandler, SendFailedHandler, ServerHandlers,
};
pub use registry::ConnectionRegistry;

pub use framelink_core::{ConnectionId, Message, PeerAddress};
