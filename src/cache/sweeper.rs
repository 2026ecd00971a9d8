//! Background eviction sweep
//!
//! Periodically removes expired entries so memory does not grow from keys that
//! are never read again. The task holds only a weak reference to the store and
//! exits once the store is dropped or shutdown is signalled.

use std::sync::Weak;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;

use super::store::KeyedStore;

/// Handle for controlling a running sweeper
#[derive(Debug)]
pub struct SweeperHandle {
    /// Channel to signal shutdown
    shutdown_tx: mpsc::Sender<()>,
}

impl SweeperHandle {
    /// Spawns a sweeper task for `store` ticking every `interval`
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn<T>(store: Weak<KeyedStore<T>>, interval: Duration) -> Self
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the first tick (immediate)
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(live) = store.upgrade() else {
                            break;
                        };
                        live.sweep_expired();
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
            tracing::debug!("Cache sweeper stopped");
        });

        Self { shutdown_tx }
    }

    /// Signals the sweeper task to stop
    pub fn shutdown(self) {
        let _ = self.shutdown_tx.try_send(());
    }
}
