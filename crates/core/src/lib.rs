//! framelink-core – Gemeinsame Typen
//!
//! Dieses Crate stellt die fundamentalen Bausteine bereit, die vom
//! Protokoll-Crate und vom Endpoint-Crate gemeinsam genutzt werden.

pub mod message;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use message::Message;
pub use types::{ConnectionId, PeerAddress};
