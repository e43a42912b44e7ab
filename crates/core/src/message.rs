//! Bound fuer strukturierte Nachrichten
//!
//! Jede Nachricht, die ueber eine Verbindung laeuft, muss serialisierbar,
//! deserialisierbar und zwischen Threads teilbar sein. Der Blanket-Impl
//! macht jeden passenden Typ automatisch zur `Message`.

use serde::{de::DeserializeOwned, Serialize};

/// Strukturierte Nachricht, die ein Frame-Codec kodieren und dekodieren kann
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}
