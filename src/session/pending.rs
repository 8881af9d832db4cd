//! Abbrechbare Hintergrundvorgänge
//!
//! Öffnen, Reconnect, Liveness-Prüfung und Anwahl laufen als eigene Tasks,
//! damit der Event-Loop währenddessen Befehle und Timer bedient. Das
//! Ergebnis wird über [`wait`] abgeholt; wer das Handle verwirft, bricht
//! den Vorgang ab.

use std::future::Future;
use tokio::task::{JoinError, JoinHandle};

/// Laufender Vorgang; wird beim Drop abgebrochen
#[derive(Debug)]
pub(crate) struct PendingTask<T> {
    task: JoinHandle<T>,
}

impl<T: Send + 'static> PendingTask<T> {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            task: tokio::spawn(future),
        }
    }
}

impl<T> Drop for PendingTask<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Wartet auf den Vorgang in `slot` und leert ihn danach. Ohne Vorgang
/// wartet die Funktion ewig. Abbruchsicher: das Handle bleibt im Slot,
/// bis ein Ergebnis vorliegt.
pub(crate) async fn wait<T>(slot: &mut Option<PendingTask<T>>) -> Result<T, JoinError> {
    let Some(pending) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let result = (&mut pending.task).await;
    *slot = None;
    result
}
