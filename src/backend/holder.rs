//! Single-slot owner of the currently selected backend. HTTP and WebSocket
//! handlers read the slot per request so a reseat is picked up immediately;
//! events are re-published onto a process-wide bus so subscribers survive
//! backend swaps without resubscribing.

use crate::backend::{Backend, BackendEvent};
use crate::error::{Error, Result};
use crate::weak_error;
use log::debug;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

const EVENT_BUS_CAPACITY: usize = 256;

pub struct BackendHolder {
    slot: RwLock<Option<Arc<Backend>>>,
    bus: broadcast::Sender<BackendEvent>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Default for BackendHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendHolder {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        BackendHolder {
            slot: RwLock::new(None),
            bus,
            forwarder: Mutex::new(None),
        }
    }

    /// Current backend, if any.
    pub async fn current(&self) -> Option<Arc<Backend>> {
        self.slot.read().await.clone()
    }

    /// Current backend or [`Error::NoBackend`].
    pub async fn require(&self) -> Result<Arc<Backend>> {
        self.current().await.ok_or(Error::NoBackend)
    }

    /// Subscribe to events of whichever backend occupies the slot, across
    /// reseats.
    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.bus.subscribe()
    }

    /// Assign a new backend, shutting the previous one down best-effort and
    /// re-wiring the event forwarder.
    pub async fn replace(&self, backend: Arc<Backend>) {
        let mut events = backend.subscribe();
        let previous = {
            let mut slot = self.slot.write().await;
            slot.replace(backend)
        };
        if let Some(old) = previous {
            debug!(target: "backend", "shutting down displaced {} backend", old.kind());
            weak_error!(old.shutdown().await, "displaced backend shutdown:");
        }

        let bus = self.bus.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let _ = bus.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(target: "backend", "event forwarder lagged, {skipped} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(old) = self.forwarder.lock().await.replace(forwarder) {
            old.abort();
        }
    }

    /// Drop the current backend after a best-effort shutdown.
    pub async fn clear(&self) {
        let previous = self.slot.write().await.take();
        if let Some(old) = previous {
            weak_error!(old.shutdown().await, "backend shutdown:");
        }
        if let Some(task) = self.forwarder.lock().await.take() {
            task.abort();
        }
    }
}
