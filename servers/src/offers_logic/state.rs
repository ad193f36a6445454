use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lib_common::engine::{EngineError, OfferEngine, Subscription};
use lib_common::markets::gpu::Snapshot;
use tokio::sync::broadcast;

/// Shared by every handler. The server holds one engine subscription and
/// fans its snapshots out to downstream sockets over `snapshots`.
#[derive(Clone)]
pub struct AppState {
    pub engine: OfferEngine,
    pub snapshots: broadcast::Sender<Arc<Snapshot>>,
    clients: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(engine: OfferEngine) -> Self {
        // Snapshots replace each other, so a short buffer is enough; laggards
        // are resynced from the current snapshot.
        let (snapshots, _) = broadcast::channel(16);
        Self {
            engine,
            snapshots,
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Subscribes to the engine, starting it. Hold the returned value for as
    /// long as the server runs.
    pub fn attach(&self) -> Result<Subscription, EngineError> {
        let tx = self.snapshots.clone();
        self.engine.subscribe(move |snapshot| {
            // No receivers simply means no client is connected.
            let _ = tx.send(snapshot);
        })
    }

    pub fn add_client(&self) -> usize {
        self.clients.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn remove_client(&self) -> usize {
        self.clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }
}
