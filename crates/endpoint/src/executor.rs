//! Ausfuehrungskontexte – dedizierte Single-Worker-Executoren
//!
//! Ein `ExecutionContext` ist ein eigener OS-Thread mit einer
//! single-threaded tokio-Runtime. Alle Tasks eines Kontexts laufen
//! nacheinander auf diesem einen Thread; sie unterbrechen sich nur an
//! `.await`-Punkten. Der Endpoint haelt zwei davon: einen fuer Accept und
//! alle Lesevorgaenge, einen fuer alle Schreibvorgaenge.
//!
//! ## Lebenszyklus
//! ```text
//! starten() --> laeuft --> herunterfahren() --> beendet
//! ```
//! Beim Herunterfahren wird die Runtime im Worker-Thread verworfen; alle
//! noch laufenden Tasks werden dabei abgebrochen und ihre Sockets geschlossen.

use std::future::Future;
use std::io;
use std::thread::JoinHandle;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle as TaskHandle;

/// Dedizierter Single-Worker-Kontext
pub struct ExecutionContext {
    name: String,
    handle: Handle,
    stopp_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ExecutionContext {
    /// Startet einen neuen Worker-Thread mit eigener Runtime
    pub fn starten(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (stopp_tx, stopp_rx) = oneshot::channel::<()>();

        let thread_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                tracing::debug!(kontext = %thread_name, "Ausfuehrungskontext gestartet");
                // Ein verworfener Sender beendet den Kontext ebenfalls
                runtime.block_on(async {
                    let _ = stopp_rx.await;
                });
                drop(runtime);
                tracing::debug!(kontext = %thread_name, "Ausfuehrungskontext beendet");
            })?;

        Ok(Self {
            name,
            handle,
            stopp_tx: Some(stopp_tx),
            thread: Some(thread),
        })
    }

    /// Reicht einen Task an den Kontext weiter
    pub fn spawn<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Runtime-Handle, z.B. um IO-Ressourcen an diesen Kontext zu binden
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn laeuft(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Beendet den Kontext und wartet auf den Worker-Thread
    ///
    /// Wird das aus dem eigenen Worker-Thread heraus aufgerufen (z.B. aus
    /// einem Handler), wird nur signalisiert und nicht gewartet.
    /// Mehrfache Aufrufe sind wirkungslos.
    pub fn herunterfahren(&mut self) {
        if let Some(stopp_tx) = self.stopp_tx.take() {
            let _ = stopp_tx.send(());
        }

        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            tracing::debug!(kontext = %self.name, "Herunterfahren aus eigenem Thread, kein Join");
            return;
        }
        if thread.join().is_err() {
            tracing::error!(kontext = %self.name, "Worker-Thread ist mit Panic beendet");
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.herunterfahren();
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.name)
            .field("laeuft", &self.laeuft())
            .finish()
    }
}
